//! Write-ahead log of committed contact mutations.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```
//!
//! Every committed transaction is one `Commit` entry. Compaction replaces the
//! whole file with a single `Snapshot` entry.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::storage::memory::Mutation;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// One committed transaction, in apply order.
    Commit {
        /// Mutations of the transaction.
        mutations: Vec<Mutation>,
    },
    /// Full table state; replaces everything before it.
    Snapshot {
        /// Every contact, ordered by id.
        contacts: Vec<Contact>,
    },
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
    len: u64,
    /// Set when a failed append could not be rolled back.
    failed: bool,
    #[cfg(test)]
    fail_next_sync: bool,
}

/// Append-only contact log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "write-ahead log mutex poisoned")
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned to its last valid entry. Anything after
    /// that point (a torn write, a checksum failure) is cut off so new
    /// entries never land behind unreadable bytes.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let on_disk = file.metadata()?.len();
        let (sequence, valid_len) = if on_disk < codec::HEADER_LEN {
            // Fresh file, or a crash before the header was complete.
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            (0, codec::HEADER_LEN)
        } else {
            let scan = Self::scan(path)?;
            if scan.valid_len < on_disk {
                tracing::warn!(
                    path = %path.display(),
                    valid_bytes = scan.valid_len,
                    dropped_bytes = on_disk - scan.valid_len,
                    last_sequence = scan.last_sequence,
                    "truncating damaged write-ahead log tail"
                );
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            (scan.last_sequence, scan.valid_len)
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
                len: valid_len,
                failed: false,
                #[cfg(test)]
                fail_next_sync: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    /// Append an entry, returning its sequence number.
    ///
    /// On failure the file is cut back to its length before the call, so a
    /// rejected entry is never replayed and later entries never land behind
    /// torn bytes. If that cut itself fails, every later append is refused.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock()?;
        if state.failed {
            return Err(IoError::new(
                ErrorKind::Other,
                "write-ahead log is unusable after a failed append",
            ));
        }

        let sequence = state.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        if let Err(e) = self.write_entry(&mut state, &encoded) {
            if let Err(rewind) = self.rewind(&mut state) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rewind,
                    "cannot roll back failed write-ahead log append"
                );
                state.failed = true;
            }
            return Err(e);
        }

        state.sequence = sequence;
        state.len += encoded.len() as u64;
        Ok(sequence)
    }

    fn write_entry(&self, state: &mut WalState, encoded: &[u8]) -> IoResult<()> {
        state.writer.write_all(encoded)?;
        state.writer.flush()?;
        if self.sync_on_write {
            #[cfg(test)]
            if std::mem::take(&mut state.fail_next_sync) {
                return Err(IoError::new(ErrorKind::Other, "sync failed"));
            }
            state.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drop buffered bytes and truncate the file to the last good entry.
    fn rewind(&self, state: &mut WalState) -> IoResult<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut state.writer, BufWriter::new(file));
        // `into_parts` hands back the unflushed buffer instead of writing it.
        drop(stale.into_parts());

        let file = state.writer.get_ref();
        file.set_len(state.len)?;
        file.sync_data()
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_sync = true;
        }
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }

    /// Size of the log in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(self.lock()?.len)
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the log with a single snapshot entry.
    ///
    /// The snapshot is written to a sibling temp file, synced, then renamed
    /// over the log. A crash at any point leaves either the old log or the
    /// new one in place.
    pub fn compact(&self, contacts: Vec<Contact>) -> IoResult<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;

        let sequence = state.sequence + 1;
        let encoded = codec::encode(&WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind: WalEntryKind::Snapshot { contacts },
        })?;

        let tmp_path = self.path.with_extension("wal.compact");
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            codec::write_header(&mut tmp)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent(&self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.sequence = sequence;
        state.len = codec::HEADER_LEN + encoded.len() as u64;
        state.failed = false;
        Ok(())
    }

    fn scan(path: &Path) -> IoResult<Scan> {
        let mut iter = WalIterator::new(path)?;
        let mut scan = Scan {
            last_sequence: 0,
            valid_len: codec::HEADER_LEN,
        };
        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    scan.last_sequence = entry.sequence;
                    scan.valid_len = iter.position()?;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        after_sequence = scan.last_sequence,
                        error = %e,
                        "write-ahead log corruption detected"
                    );
                    break;
                }
            }
        }
        Ok(scan)
    }
}

struct Scan {
    last_sequence: u64,
    valid_len: u64,
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> IoResult<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> IoResult<()> {
    Ok(())
}

/// Iterator over WAL entries.
///
/// Stops cleanly at a record cut short by a crash; other damage is yielded
/// as an error.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    use crate::contact::{ContactId, NewContact};

    fn insert(id: u64, email: &str) -> WalEntryKind {
        WalEntryKind::Commit {
            mutations: vec![Mutation::Insert(
                NewContact::primary(Some(email), None).into_contact(ContactId::new(id), Utc::now()),
            )],
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.wal");

        {
            let wal = WriteAheadLog::open(&path, false).unwrap();
            assert_eq!(wal.append(insert(1, "a@x.com")).unwrap(), 1);
            assert_eq!(wal.append(insert(2, "b@x.com")).unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::Commit { .. }));
    }

    #[test]
    fn torn_tail_is_cut_and_appends_continue() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.wal");

        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(insert(1, "a@x.com")).unwrap();
            wal.append(insert(2, "b@x.com")).unwrap();
        }
        let full = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(full - 3)
            .unwrap();

        let wal = WriteAheadLog::open(&path, true).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 1);
        assert_eq!(wal.append(insert(2, "c@x.com")).unwrap(), 2);
        drop(wal);

        let wal = WriteAheadLog::open(&path, true).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), wal.size_bytes().unwrap());
    }

    #[test]
    fn failed_append_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.wal");

        {
            let wal = WriteAheadLog::open(&path, true).unwrap();
            wal.append(insert(1, "a@x.com")).unwrap();

            wal.fail_next_sync();
            assert!(wal.append(insert(2, "rejected@x.com")).is_err());
            assert_eq!(wal.current_sequence().unwrap(), 1);
            assert_eq!(fs::metadata(&path).unwrap().len(), wal.size_bytes().unwrap());

            assert_eq!(wal.append(insert(2, "b@x.com")).unwrap(), 2);
        }

        let wal = WriteAheadLog::open(&path, true).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        let WalEntryKind::Commit { mutations } = &entries[1].kind else {
            panic!("expected a commit entry");
        };
        let Mutation::Insert(contact) = &mutations[0] else {
            panic!("expected an insert");
        };
        assert_eq!(contact.email.as_deref(), Some("b@x.com"));
    }

    #[test]
    fn compact_leaves_single_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.wal");

        let wal = WriteAheadLog::open(&path, false).unwrap();
        wal.append(insert(1, "a@x.com")).unwrap();
        wal.append(insert(2, "b@x.com")).unwrap();
        let before = wal.size_bytes().unwrap();

        let contact = NewContact::primary(Some("a@x.com"), None)
            .into_contact(ContactId::new(1), Utc::now());
        wal.compact(vec![contact]).unwrap();
        assert!(wal.size_bytes().unwrap() < before);
        assert!(!path.with_extension("wal.compact").exists());

        wal.append(insert(2, "b@x.com")).unwrap();
        drop(wal);

        let wal = WriteAheadLog::open(&path, false).unwrap();
        let entries: Vec<_> = wal.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[0].kind,
            WalEntryKind::Snapshot { contacts } if contacts.len() == 1
        ));
        assert_eq!(entries[1].sequence, 4);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contacts.wal");
        fs::write(&path, b"not a log at all").unwrap();

        let err = WriteAheadLog::open(&path, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
