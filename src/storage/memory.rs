//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the contact
//! store. It is intended for embedded usage, tests, and as the read model the
//! persistent backend replays into.
//!
//! Concurrency control is pessimistic: a transaction takes exclusive locks on
//! the identifier values it looks up (`email:…`, `phone:…`) and on every row
//! it reads for update (`contact:…`). Locks are held until commit or
//! rollback. Waiting is bounded by [`StoreConfig::lock_timeout`]; a timeout
//! surfaces as [`StorageError::LockTimeout`], which also breaks deadlocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::error::{ExecutionError, ReconcileError};
use crate::storage::traits::{ContactStore, ContactTransaction, StorageError};
use crate::time::{Clock, SystemClock};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Store-level configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum time to wait for a single lock.
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl StoreConfig {
    const MIN_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

    /// Rejects degenerate settings.
    pub fn validate(self) -> Result<Self, ReconcileError> {
        if self.lock_timeout < Self::MIN_LOCK_TIMEOUT {
            return Err(ReconcileError::Execution(ExecutionError::Storage {
                message: format!(
                    "lock_timeout must be at least {:?} (got {:?})",
                    Self::MIN_LOCK_TIMEOUT,
                    self.lock_timeout
                ),
            }));
        }
        Ok(self)
    }
}

/// A committed change to the contact table.
///
/// Committed transactions are expressed as an ordered list of mutations; the
/// persistent backend logs exactly this list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// A new contact.
    Insert(Contact),
    /// A linkage change on an existing contact.
    Relink {
        /// Contact being relinked.
        id: ContactId,
        /// New primary, if secondary.
        linked_id: Option<ContactId>,
        /// New precedence.
        link_precedence: LinkPrecedence,
        /// Time of the change.
        updated_at: DateTime<Utc>,
    },
}

/// Committed contacts plus the lookup indexes the transactions need.
#[derive(Debug, Default, Clone)]
pub(crate) struct ContactTable {
    by_id: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
}

impl ContactTable {
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    pub(crate) fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    pub(crate) fn max_id(&self) -> u64 {
        self.by_id.keys().next_back().map_or(0, |id| id.get())
    }

    fn matching_ids(&self, email: Option<&str>, phone: Option<&str>) -> BTreeSet<ContactId> {
        let mut out = BTreeSet::new();
        if let Some(ids) = email.and_then(|e| self.by_email.get(e)) {
            out.extend(ids.iter().copied());
        }
        if let Some(ids) = phone.and_then(|p| self.by_phone.get(p)) {
            out.extend(ids.iter().copied());
        }
        out
    }

    fn member_ids(&self, roots: &BTreeSet<ContactId>) -> BTreeSet<ContactId> {
        let mut out = BTreeSet::new();
        for root in roots {
            if self.by_id.contains_key(root) {
                out.insert(*root);
            }
            if let Some(linked) = self.by_linked.get(root) {
                out.extend(linked.iter().copied());
            }
        }
        out
    }

    /// Inserts a contact read from an external source (seed data, replay).
    pub(crate) fn insert(&mut self, contact: Contact) -> Result<(), StorageError> {
        if self.by_id.contains_key(&contact.id) {
            return Err(StorageError::DuplicateKey(contact.id.to_string()));
        }
        self.index(&contact);
        self.by_id.insert(contact.id, contact);
        Ok(())
    }

    fn index(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.by_email.entry(email.clone()).or_default().insert(contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            self.by_phone.entry(phone.clone()).or_default().insert(contact.id);
        }
        if let Some(linked) = contact.linked_id {
            self.by_linked.entry(linked).or_default().insert(contact.id);
        }
    }

    /// Checks that `mutations` can be applied without partial failure.
    pub(crate) fn validate(&self, mutations: &[Mutation]) -> Result<(), StorageError> {
        let mut inserted = BTreeSet::new();
        for m in mutations {
            match m {
                Mutation::Insert(c) => {
                    if self.by_id.contains_key(&c.id) || !inserted.insert(c.id) {
                        return Err(StorageError::DuplicateKey(c.id.to_string()));
                    }
                }
                Mutation::Relink { id, .. } => {
                    if !self.by_id.contains_key(id) && !inserted.contains(id) {
                        return Err(StorageError::ContactNotFound(*id));
                    }
                }
            }
        }
        Ok(())
    }

    /// Applies mutations previously accepted by [`validate`](Self::validate).
    pub(crate) fn apply(&mut self, mutations: &[Mutation]) {
        for m in mutations {
            match m {
                Mutation::Insert(c) => {
                    self.index(c);
                    self.by_id.insert(c.id, c.clone());
                }
                Mutation::Relink {
                    id,
                    linked_id,
                    link_precedence,
                    updated_at,
                } => {
                    let Some(contact) = self.by_id.get_mut(id) else {
                        continue;
                    };
                    let previous = contact.linked_id;
                    contact.linked_id = *linked_id;
                    contact.link_precedence = *link_precedence;
                    contact.updated_at = *updated_at;

                    if let Some(prev) = previous {
                        if let Some(set) = self.by_linked.get_mut(&prev) {
                            set.remove(id);
                            if set.is_empty() {
                                self.by_linked.remove(&prev);
                            }
                        }
                    }
                    if let Some(next) = linked_id {
                        self.by_linked.entry(*next).or_default().insert(*id);
                    }
                }
            }
        }
    }
}

/// Lock key: an identifier value or a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum LockKey {
    Email(String),
    Phone(String),
    Row(ContactId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email(e) => write!(f, "email:{e}"),
            Self::Phone(p) => write!(f, "phone:{p}"),
            Self::Row(id) => write!(f, "contact:{id}"),
        }
    }
}

/// Exclusive, re-entrant (per transaction) locks with bounded waits.
#[derive(Debug, Default)]
struct LockTable {
    owners: Mutex<HashMap<LockKey, u64>>,
    released: Condvar,
}

impl LockTable {
    /// Returns `Ok(true)` if newly acquired, `Ok(false)` if already held by `owner`.
    fn acquire(&self, key: &LockKey, owner: u64, timeout: Duration) -> Result<bool, StorageError> {
        let deadline = Instant::now() + timeout;
        let mut owners = self.owners.lock().map_err(|_| lock_err("locks.acquire"))?;
        loop {
            match owners.get(key) {
                None => {
                    owners.insert(key.clone(), owner);
                    return Ok(true);
                }
                Some(&holder) if holder == owner => return Ok(false),
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::LockTimeout {
                            key: key.to_string(),
                        });
                    }
                    let (guard, _) = self
                        .released
                        .wait_timeout(owners, deadline - now)
                        .map_err(|_| lock_err("locks.wait"))?;
                    owners = guard;
                }
            }
        }
    }

    fn release_all(&self, owner: u64, keys: &[LockKey]) {
        if keys.is_empty() {
            return;
        }
        // A poisoned table still has to give the locks back.
        let mut owners = self
            .owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in keys {
            if owners.get(key) == Some(&owner) {
                owners.remove(key);
            }
        }
        drop(owners);
        self.released.notify_all();
    }
}

/// Durability hook invoked while a commit holds the table write lock.
pub(crate) trait CommitHook: Send + Sync {
    /// Make `mutations` durable. Failing here aborts the commit.
    fn log(&self, mutations: &[Mutation]) -> Result<(), StorageError>;

    /// Called after the mutations are visible.
    fn published(&self, table: &ContactTable);
}

/// Shared engine behind the in-memory and persistent stores.
pub(crate) struct StoreCore {
    table: RwLock<ContactTable>,
    locks: LockTable,
    next_id: AtomicU64,
    next_tx: AtomicU64,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl fmt::Debug for StoreCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreCore")
            .field("next_id", &self.next_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StoreCore {
    pub(crate) fn new(table: ContactTable, clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        let next_id = table.max_id() + 1;
        Self {
            table: RwLock::new(table),
            locks: LockTable::default(),
            next_id: AtomicU64::new(next_id),
            next_tx: AtomicU64::new(1),
            clock,
            config,
        }
    }

    pub(crate) fn begin<'a>(&'a self, hook: Option<&'a dyn CommitHook>) -> MemoryTransaction<'a> {
        MemoryTransaction {
            core: self,
            hook,
            tx_id: self.next_tx.fetch_add(1, Ordering::Relaxed),
            held: Vec::new(),
            staged: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> Result<usize, StorageError> {
        Ok(self.table.read().map_err(|_| lock_err("contacts.len"))?.len())
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.snapshot"))?;
        Ok(table.contacts().cloned().collect())
    }

    /// Runs `f` against the committed table while holding off commits.
    #[cfg(feature = "persistent")]
    pub(crate) fn with_table<R>(&self, f: impl FnOnce(&ContactTable) -> R) -> Result<R, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("contacts.with_table"))?;
        Ok(f(&table))
    }
}

/// Transaction over a [`StoreCore`].
pub(crate) struct MemoryTransaction<'a> {
    core: &'a StoreCore,
    hook: Option<&'a dyn CommitHook>,
    tx_id: u64,
    held: Vec<LockKey>,
    staged: BTreeMap<ContactId, Contact>,
    log: Vec<Mutation>,
}

impl MemoryTransaction<'_> {
    fn lock(&mut self, key: LockKey) -> Result<(), StorageError> {
        if self
            .core
            .locks
            .acquire(&key, self.tx_id, self.core.config.lock_timeout)?
        {
            self.held.push(key);
        }
        Ok(())
    }

    fn lock_rows(&mut self, ids: &BTreeSet<ContactId>) -> Result<(), StorageError> {
        for id in ids {
            self.lock(LockKey::Row(*id))?;
        }
        Ok(())
    }

    fn visible(&self, table: &ContactTable, id: ContactId) -> Option<Contact> {
        self.staged
            .get(&id)
            .cloned()
            .or_else(|| table.get(id).cloned())
    }

    fn matching(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        let table = self.core.table.read().map_err(|_| lock_err("contacts.matching"))?;
        let mut ids = table.matching_ids(email, phone);
        ids.extend(
            self.staged
                .values()
                .filter(|c| c.matches(email, phone))
                .map(|c| c.id),
        );
        let mut out: Vec<Contact> = ids
            .into_iter()
            .filter_map(|id| self.visible(&table, id))
            .collect();
        out.sort_by(Contact::seniority);
        Ok(out)
    }

    fn members(&self, roots: &BTreeSet<ContactId>) -> Result<Vec<Contact>, StorageError> {
        let table = self.core.table.read().map_err(|_| lock_err("contacts.members"))?;
        let mut ids = table.member_ids(roots);
        ids.extend(self.staged.keys().copied());
        let mut out: Vec<Contact> = ids
            .into_iter()
            .filter_map(|id| self.visible(&table, id))
            .filter(|c| roots.contains(&c.id) || c.linked_id.is_some_and(|l| roots.contains(&l)))
            .collect();
        out.sort_by(Contact::seniority);
        Ok(out)
    }

    fn release(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.core.locks.release_all(self.tx_id, &held);
    }
}

impl ContactTransaction for MemoryTransaction<'_> {
    fn lock_matching(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>, StorageError> {
        // Identifier locks first, in a fixed order, so overlapping requests
        // serialize even when no row exists yet.
        let mut keys = Vec::with_capacity(2);
        if let Some(e) = email {
            keys.push(LockKey::Email(e.to_string()));
        }
        if let Some(p) = phone {
            keys.push(LockKey::Phone(p.to_string()));
        }
        keys.sort();
        for key in keys {
            self.lock(key)?;
        }

        let ids: BTreeSet<ContactId> = self.matching(email, phone)?.iter().map(|c| c.id).collect();
        self.lock_rows(&ids)?;
        self.matching(email, phone)
    }

    fn find_matching(
        &mut self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Contact>, StorageError> {
        Ok(self.matching(email, phone)?.into_iter().next())
    }

    fn find_by_id(&mut self, id: ContactId) -> Result<Option<Contact>, StorageError> {
        let table = self.core.table.read().map_err(|_| lock_err("contacts.get"))?;
        Ok(self.visible(&table, id))
    }

    fn find_cluster_members(
        &mut self,
        roots: &BTreeSet<ContactId>,
    ) -> Result<Vec<Contact>, StorageError> {
        self.lock_rows(roots)?;

        {
            let table = self.core.table.read().map_err(|_| lock_err("contacts.roots"))?;
            for root in roots {
                let contact = self
                    .visible(&table, *root)
                    .ok_or(StorageError::ContactNotFound(*root))?;
                // A dangling link does not count; its target cannot be a root.
                if let Some(parent) = contact.linked_id {
                    if !contact.is_primary() && self.visible(&table, parent).is_some() {
                        return Err(StorageError::SerializationFailure(format!(
                            "contact {root} was relinked to {parent} while waiting for its lock"
                        )));
                    }
                }
            }
        }

        let ids: BTreeSet<ContactId> = self.members(roots)?.iter().map(|c| c.id).collect();
        self.lock_rows(&ids)?;
        self.members(roots)
    }

    fn create(&mut self, contact: NewContact) -> Result<Contact, StorageError> {
        let id = ContactId::new(self.core.next_id.fetch_add(1, Ordering::SeqCst));
        let contact = contact.into_contact(id, self.core.clock.now());
        self.lock(LockKey::Row(id))?;
        self.staged.insert(id, contact.clone());
        self.log.push(Mutation::Insert(contact.clone()));
        Ok(contact)
    }

    fn update(
        &mut self,
        id: ContactId,
        linked_id: Option<ContactId>,
        precedence: LinkPrecedence,
    ) -> Result<(), StorageError> {
        self.lock(LockKey::Row(id))?;
        let mut contact = {
            let table = self.core.table.read().map_err(|_| lock_err("contacts.update"))?;
            self.visible(&table, id)
                .ok_or(StorageError::ContactNotFound(id))?
        };
        let now = self.core.clock.now();
        contact.linked_id = linked_id;
        contact.link_precedence = precedence;
        contact.updated_at = now;
        self.staged.insert(id, contact);
        self.log.push(Mutation::Relink {
            id,
            linked_id,
            link_precedence: precedence,
            updated_at: now,
        });
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.log.is_empty() {
            return Ok(());
        }

        let mut table = self.core.table.write().map_err(|_| lock_err("contacts.commit"))?;
        table.validate(&self.log)?;
        if let Some(hook) = self.hook {
            hook.log(&self.log)?;
        }
        table.apply(&self.log);
        if let Some(hook) = self.hook {
            hook.published(&table);
        }
        drop(table);

        self.log.clear();
        self.staged.clear();
        self.release();
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Thread-safe in-memory contact store.
#[derive(Debug)]
pub struct InMemoryContactStore {
    core: StoreCore,
}

impl Default for InMemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContactStore {
    /// Create a new empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), StoreConfig::default())
    }

    /// Create a new empty store with an explicit clock and configuration.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>, config: StoreConfig) -> Self {
        Self {
            core: StoreCore::new(ContactTable::default(), clock, config),
        }
    }

    /// Create a store pre-populated with existing records.
    ///
    /// Records are taken as-is, including linkage that breaks cluster
    /// invariants; reconciliation is expected to cope with legacy data.
    ///
    /// # Errors
    /// `DuplicateKey` if two records share an id.
    pub fn from_contacts(
        contacts: impl IntoIterator<Item = Contact>,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        let mut table = ContactTable::default();
        for contact in contacts {
            table.insert(contact)?;
        }
        Ok(Self {
            core: StoreCore::new(table, clock, config),
        })
    }
}

impl ContactStore for InMemoryContactStore {
    fn begin(&self) -> Result<Box<dyn ContactTransaction + '_>, StorageError> {
        Ok(Box::new(self.core.begin(None)))
    }

    fn len(&self) -> Result<usize, StorageError> {
        self.core.len()
    }

    fn snapshot(&self) -> Result<Vec<Contact>, StorageError> {
        self.core.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::thread;

    use chrono::Duration as ChronoDuration;

    use crate::time::SteppingClock;

    fn store_with_timeout(timeout: Duration) -> InMemoryContactStore {
        InMemoryContactStore::with_clock(
            Arc::new(SteppingClock::new(Utc::now(), ChronoDuration::seconds(1))),
            StoreConfig {
                lock_timeout: timeout,
            },
        )
    }

    fn seed(store: &InMemoryContactStore, email: Option<&str>, phone: Option<&str>) -> Contact {
        let mut tx = store.begin().unwrap();
        let c = tx.create(NewContact::primary(email, phone)).unwrap();
        tx.commit().unwrap();
        c
    }

    #[test]
    fn create_is_invisible_until_commit() {
        let store = InMemoryContactStore::new();
        let mut tx = store.begin().unwrap();
        let c = tx.create(NewContact::primary(Some("a@x.com"), Some("123"))).unwrap();
        assert_eq!(c.id, ContactId::new(1));

        // Own writes are visible inside the transaction.
        assert_eq!(tx.find_by_id(c.id).unwrap(), Some(c.clone()));
        assert_eq!(store.len().unwrap(), 0);

        tx.commit().unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.snapshot().unwrap(), vec![c]);
    }

    #[test]
    fn rollback_discards_writes() {
        let store = InMemoryContactStore::new();
        let primary = seed(&store, Some("a@x.com"), None);

        let mut tx = store.begin().unwrap();
        tx.create(NewContact::primary(Some("b@x.com"), None)).unwrap();
        tx.update(primary.id, Some(ContactId::new(99)), LinkPrecedence::Secondary)
            .unwrap();
        tx.rollback();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].is_primary());
    }

    #[test]
    fn lock_matching_never_matches_omitted_identifier() {
        let store = InMemoryContactStore::new();
        seed(&store, Some("a@x.com"), None);
        seed(&store, None, Some("123"));

        let mut tx = store.begin().unwrap();
        let by_email = tx.lock_matching(Some("a@x.com"), None).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].email.as_deref(), Some("a@x.com"));

        let none = tx.lock_matching(None, None).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn lock_matching_orders_by_creation() {
        let store = InMemoryContactStore::new();
        let first = seed(&store, Some("a@x.com"), None);
        let second = seed(&store, None, Some("123"));
        let third = seed(&store, Some("a@x.com"), Some("456"));

        let mut tx = store.begin().unwrap();
        let ids: Vec<_> = tx
            .lock_matching(Some("a@x.com"), Some("123"))
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[test]
    fn cluster_members_follow_linkage_including_staged_relinks() {
        let store = InMemoryContactStore::new();
        let p1 = seed(&store, Some("a@x.com"), None);
        let p2 = seed(&store, Some("b@x.com"), None);

        let mut tx = store.begin().unwrap();
        tx.create(NewContact::secondary(Some("c@x.com"), None, p2.id))
            .unwrap();
        tx.update(p2.id, Some(p1.id), LinkPrecedence::Secondary).unwrap();

        let roots: BTreeSet<_> = [p1.id].into_iter().collect();
        let members: Vec<_> = tx
            .find_cluster_members(&roots)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(members, vec![p1.id, p2.id]);

        let roots: BTreeSet<_> = [p2.id].into_iter().collect();
        let err = tx.find_cluster_members(&roots).unwrap_err();
        assert!(matches!(err, StorageError::SerializationFailure(_)));
    }

    #[test]
    fn overlapping_identifier_blocks_until_commit() {
        let store = Arc::new(store_with_timeout(Duration::from_secs(5)));
        let (locked_tx, locked_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut tx = store.begin().unwrap();
                assert!(tx.lock_matching(Some("a@x.com"), None).unwrap().is_empty());
                locked_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                tx.create(NewContact::primary(Some("a@x.com"), None)).unwrap();
                tx.commit().unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut tx = store.begin().unwrap();
                tx.lock_matching(Some("a@x.com"), Some("999")).unwrap()
            })
        };
        thread::sleep(Duration::from_millis(50));
        go_tx.send(()).unwrap();

        holder.join().unwrap();
        let seen = waiter.join().unwrap();
        assert_eq!(seen.len(), 1, "waiter must observe the committed row");
    }

    #[test]
    fn lock_wait_times_out() {
        let store = store_with_timeout(Duration::from_millis(20));
        let mut first = store.begin().unwrap();
        first.lock_matching(None, Some("123")).unwrap();

        let mut second = store.begin().unwrap();
        let err = second.lock_matching(None, Some("123")).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { ref key } if key == "phone:123"));

        drop(first);
        assert!(second.lock_matching(None, Some("123")).is_ok());
    }

    #[test]
    fn from_contacts_continues_id_sequence() {
        let now = Utc::now();
        let seeded = NewContact::primary(Some("a@x.com"), None).into_contact(ContactId::new(41), now);
        let store = InMemoryContactStore::from_contacts(
            [seeded],
            Arc::new(SystemClock),
            StoreConfig::default(),
        )
        .unwrap();

        let c = seed(&store, Some("b@x.com"), None);
        assert_eq!(c.id, ContactId::new(42));
    }

    #[test]
    fn store_config_rejects_zero_timeout() {
        let cfg = StoreConfig {
            lock_timeout: Duration::ZERO,
        };
        assert!(cfg.validate().is_err());
        assert!(StoreConfig::default().validate().is_ok());
    }
}
