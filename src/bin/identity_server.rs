//! Identity reconciliation gRPC server.
//!
//! Opens a persistent contact database and serves `IdentityService` until
//! Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tonic::transport::Server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use identity_reconciler::engine::runtime::{IdentityRuntime, RuntimeConfig};
use identity_reconciler::engine::IdentityEngine;
use identity_reconciler::storage::open_database;
use identity_reconciler::transport::IdentityServiceImpl;

/// Server configuration
struct Config {
    /// Address to bind to
    addr: SocketAddr,
    /// Data directory for persistent storage
    data_dir: PathBuf,
    /// Worker threads
    workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("./contacts.idrc"),
            workers: RuntimeConfig::default().workers,
        }
    }
}

fn usage() {
    println!("identity-server - contact identity reconciliation over gRPC");
    println!();
    println!("USAGE:");
    println!("    identity-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -p, --port <PORT>         Port to listen on [default: 3000]");
    println!("    -d, --data-dir <DIR>      Data directory [default: ./contacts.idrc]");
    println!("    -w, --workers <N>         Worker threads [default: 4]");
    println!("    -h, --help                Print help information");
    println!();
    println!("Log level is read from RUST_LOG [default: identity_reconciler=info].");
}

fn fail(msg: &str) -> ! {
    eprintln!("error: {msg}");
    std::process::exit(1);
}

fn parse_args() -> Config {
    let mut config = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" | "-p" => {
                let Some(value) = args.next() else {
                    fail("--port requires a value");
                };
                let port: u16 = value
                    .parse()
                    .unwrap_or_else(|_| fail(&format!("invalid port number: {value}")));
                config.addr.set_port(port);
            }
            "--data-dir" | "-d" => {
                let Some(value) = args.next() else {
                    fail("--data-dir requires a value");
                };
                config.data_dir = PathBuf::from(value);
            }
            "--workers" | "-w" => {
                let Some(value) = args.next() else {
                    fail("--workers requires a value");
                };
                config.workers = match value.parse() {
                    Ok(n) if n > 0 => n,
                    _ => fail(&format!("invalid worker count: {value}")),
                };
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            other => fail(&format!("unknown argument: {other}")),
        }
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_reconciler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = parse_args();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "starting identity server"
    );

    // Holds the directory lock for the process lifetime.
    let store = open_database(&config.data_dir, None)?;
    let engine = IdentityEngine::new(Arc::new(store));
    let runtime = Arc::new(IdentityRuntime::new(
        engine,
        RuntimeConfig {
            workers: config.workers,
            ..RuntimeConfig::default()
        },
    )?);

    let svc = IdentityServiceImpl::new(Arc::clone(&runtime)).into_server();

    tracing::info!(addr = %config.addr, workers = config.workers, "serving gRPC");
    Server::builder()
        .add_service(svc)
        .serve_with_shutdown(config.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("shut down");
    Ok(())
}
