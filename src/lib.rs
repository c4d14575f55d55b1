//! # identity-reconciler
//!
//! Contact identity reconciliation. Every incoming `(email?, phone?)` pair is
//! resolved to a cluster of contacts that share an identifier, led by exactly
//! one primary: the oldest member. New information extends a cluster with a
//! secondary contact; a request that touches two clusters merges them under
//! the older primary.
//!
//! ## Core Concepts
//!
//! - **Contact**: one stored `(email, phone)` observation
//! - **Cluster**: a primary plus every secondary linked to it
//! - **Resolution**: the outcome of reconciling one request inside a single
//!   transaction
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use identity_reconciler::{IdentifyRequest, IdentityEngine, InMemoryContactStore};
//!
//! let engine = IdentityEngine::new(Arc::new(InMemoryContactStore::new()));
//!
//! let first = engine
//!     .identify(&IdentifyRequest::new().with_email("lorraine@hillvalley.edu").with_phone("123456"))
//!     .unwrap();
//! let second = engine
//!     .identify(&IdentifyRequest::new().with_email("mcfly@hillvalley.edu").with_phone("123456"))
//!     .unwrap();
//!
//! assert_eq!(first.contact.primary_contact_id, second.contact.primary_contact_id);
//! assert_eq!(second.contact.emails.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod contact;
pub mod engine;
pub mod error;
pub mod request;
pub mod resolver;
pub mod response;
pub mod storage;
pub mod time;

#[cfg(feature = "transport-grpc")]
pub mod transport;

pub use contact::{Contact, ContactId, LinkPrecedence, NewContact};
pub use engine::runtime::{ExecutionHandle, IdentityRuntime, RuntimeConfig};
pub use engine::{EngineConfig, IdentityEngine};
pub use error::{ExecutionError, ReconcileError, ReconcileResult, ValidationError};
pub use request::{IdentifyRequest, Identity};
pub use resolver::{resolve, Resolution};
pub use response::{ContactSummary, IdentifyResponse};
pub use storage::{
    ContactStore, ContactTransaction, InMemoryContactStore, Mutation, StorageError, StoreConfig,
};
pub use time::{Clock, SteppingClock, SystemClock};
