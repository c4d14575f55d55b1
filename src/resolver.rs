//! Cluster resolution.
//!
//! Given an email and/or phone number, [`resolve`] finds every cluster the
//! identifiers touch, elects the oldest contact as the single primary, demotes
//! any other primary into a secondary, and records new information as one new
//! secondary. All reads and writes go through the caller's transaction; this
//! module never commits.

use std::collections::BTreeSet;

use crate::contact::{Contact, ContactId, LinkPrecedence, NewContact};
use crate::error::{ReconcileError, ReconcileResult};
use crate::storage::ContactTransaction;

/// Upper bound on `linked_id` hops when searching for a cluster root.
///
/// A well-formed cluster is one hop deep.
pub const MAX_LINK_HOPS: usize = 32;

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The cluster's primary after resolution.
    pub primary_id: ContactId,
    /// Every member of the cluster, in load order, with post-resolution linkage.
    /// A newly created contact, if any, comes last.
    pub contacts: Vec<Contact>,
    /// The contact created by this resolution, if any.
    pub created: Option<ContactId>,
    /// Contacts whose linkage was rewritten, in load order.
    pub relinked: Vec<ContactId>,
}

impl Resolution {
    /// Returns true if the resolution wrote nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.created.is_none() && self.relinked.is_empty()
    }
}

/// Resolve `email`/`phone` into a single cluster, staging the needed writes.
///
/// At least one identifier must be present; callers validate before calling.
///
/// # Errors
/// - `IntegrityViolation` for a cyclic or over-long link chain, or a cluster
///   that loads empty or ends with other than one primary
/// - Storage errors from the transaction (lock timeouts surface as
///   concurrency conflicts)
pub fn resolve(
    tx: &mut dyn ContactTransaction,
    email: Option<&str>,
    phone: Option<&str>,
) -> ReconcileResult<Resolution> {
    if email.is_none() && phone.is_none() {
        return Err(ReconcileError::internal(
            "resolve called without an identifier",
        ));
    }

    let mut candidates = tx.lock_matching(email, phone)?;

    if candidates.is_empty() {
        // Re-check under lock: a concurrent request may have committed between
        // an unlocked pre-check and our lock.
        match tx.find_matching(email, phone)? {
            Some(existing) => candidates.push(existing),
            None => {
                let created = tx.create(NewContact::primary(email, phone))?;
                tracing::debug!(contact = %created.id, "created new primary");
                return Ok(Resolution {
                    primary_id: created.id,
                    created: Some(created.id),
                    contacts: vec![created],
                    relinked: Vec::new(),
                });
            }
        }
    }

    let mut roots = BTreeSet::new();
    for candidate in &candidates {
        roots.insert(find_root(tx, candidate.clone())?);
    }

    let mut cluster = tx.find_cluster_members(&roots)?;
    // Candidates sitting deeper than one hop are not linked to a root directly.
    for candidate in candidates {
        if !cluster.iter().any(|c| c.id == candidate.id) {
            cluster.push(candidate);
        }
    }
    cluster.sort_by(Contact::seniority);

    let primary_id = cluster.first().map(|c| c.id).ok_or_else(|| {
        ReconcileError::integrity(format!("no contacts loaded for cluster roots {roots:?}"))
    })?;

    // Snapshot identifiers before any mutation.
    let known_emails: BTreeSet<String> = cluster.iter().filter_map(|c| c.email.clone()).collect();
    let known_phones: BTreeSet<String> =
        cluster.iter().filter_map(|c| c.phone_number.clone()).collect();

    let mut relinked = Vec::new();
    for contact in &mut cluster {
        let (linked_id, precedence) = if contact.id == primary_id {
            (None, LinkPrecedence::Primary)
        } else {
            (Some(primary_id), LinkPrecedence::Secondary)
        };
        if contact.link_precedence == precedence && contact.linked_id == linked_id {
            continue;
        }
        tx.update(contact.id, linked_id, precedence)?;
        *contact = tx
            .find_by_id(contact.id)?
            .ok_or_else(|| ReconcileError::missing_contact(contact.id))?;
        relinked.push(contact.id);
    }
    if !relinked.is_empty() {
        tracing::info!(
            primary = %primary_id,
            relinked = relinked.len(),
            roots = roots.len(),
            "merged clusters"
        );
    }

    let new_email = email.is_some_and(|e| !e.is_empty() && !known_emails.contains(e));
    let new_phone = phone.is_some_and(|p| !p.is_empty() && !known_phones.contains(p));

    let mut created = None;
    if new_email || new_phone {
        let contact = tx.create(NewContact::secondary(email, phone, primary_id))?;
        tracing::debug!(contact = %contact.id, primary = %primary_id, "created secondary");
        created = Some(contact.id);
        cluster.push(contact);
    }

    check_single_primary(&cluster, primary_id)?;

    Ok(Resolution {
        primary_id,
        contacts: cluster,
        created,
        relinked,
    })
}

/// Walk `linked_id` until a primary or an unlinked contact.
///
/// A link to a missing contact stops at the last contact that exists.
fn find_root(tx: &mut dyn ContactTransaction, start: Contact) -> ReconcileResult<ContactId> {
    let origin = start.id;
    let mut visited = BTreeSet::new();
    let mut current = start;

    // One check per contact on the path: the start plus up to MAX_LINK_HOPS parents.
    for _ in 0..=MAX_LINK_HOPS {
        if current.is_primary() {
            return Ok(current.id);
        }
        let Some(next) = current.linked_id else {
            return Ok(current.id);
        };
        if !visited.insert(current.id) || next == current.id {
            tracing::error!(contact = %origin, "link chain contains a cycle");
            return Err(ReconcileError::integrity(format!(
                "link chain from contact {origin} contains a cycle"
            )));
        }
        match tx.find_by_id(next)? {
            Some(parent) => current = parent,
            None => {
                tracing::warn!(contact = %current.id, missing = %next, "dangling link");
                return Ok(current.id);
            }
        }
    }

    tracing::error!(contact = %origin, hops = MAX_LINK_HOPS, "link chain exceeds hop limit");
    Err(ReconcileError::integrity(format!(
        "link chain from contact {origin} exceeds {MAX_LINK_HOPS} hops"
    )))
}

fn check_single_primary(cluster: &[Contact], primary_id: ContactId) -> ReconcileResult<()> {
    for contact in cluster {
        let ok = if contact.id == primary_id {
            contact.is_primary() && contact.linked_id.is_none()
        } else {
            !contact.is_primary() && contact.linked_id == Some(primary_id)
        };
        if !ok {
            tracing::error!(contact = %contact.id, primary = %primary_id, "cluster invariant broken");
            return Err(ReconcileError::integrity(format!(
                "contact {} is {} linked to {:?} in cluster of {primary_id}",
                contact.id, contact.link_precedence, contact.linked_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use crate::storage::{ContactStore, InMemoryContactStore, StoreConfig};
    use crate::time::SteppingClock;

    fn store() -> InMemoryContactStore {
        InMemoryContactStore::with_clock(
            Arc::new(SteppingClock::new(Utc::now(), Duration::seconds(1))),
            StoreConfig::default(),
        )
    }

    fn run(store: &InMemoryContactStore, email: Option<&str>, phone: Option<&str>) -> Resolution {
        let mut tx = store.begin().unwrap();
        let res = resolve(&mut *tx, email, phone).unwrap();
        tx.commit().unwrap();
        res
    }

    fn ids(contacts: &[Contact]) -> Vec<u64> {
        contacts.iter().map(|c| c.id.get()).collect()
    }

    fn raw(
        id: u64,
        email: Option<&str>,
        phone: Option<&str>,
        linked: Option<u64>,
        precedence: LinkPrecedence,
        at: DateTime<Utc>,
    ) -> Contact {
        Contact {
            id: ContactId::new(id),
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            linked_id: linked.map(ContactId::new),
            link_precedence: precedence,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn unseen_identifiers_create_primary() {
        let store = store();
        let res = run(&store, Some("a@x.com"), Some("123"));
        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(res.created, Some(ContactId::new(1)));
        assert!(res.contacts[0].is_primary());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn exact_match_is_read_only() {
        let store = store();
        run(&store, Some("a@x.com"), Some("123"));
        let res = run(&store, Some("a@x.com"), Some("123"));
        assert!(res.is_noop());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn new_email_extends_cluster_with_one_secondary() {
        let store = store();
        run(&store, Some("a@x.com"), Some("123"));
        let res = run(&store, Some("b@x.com"), Some("123"));

        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(res.created, Some(ContactId::new(2)));
        assert_eq!(ids(&res.contacts), vec![1, 2]);
        let secondary = &res.contacts[1];
        assert_eq!(secondary.linked_id, Some(ContactId::new(1)));
        assert_eq!(secondary.email.as_deref(), Some("b@x.com"));
        assert_eq!(secondary.phone_number.as_deref(), Some("123"));
    }

    #[test]
    fn bridging_request_merges_younger_primary_under_older() {
        let store = store();
        run(&store, Some("a@x.com"), Some("111"));
        run(&store, Some("b@x.com"), Some("222"));

        let res = run(&store, Some("b@x.com"), Some("111"));
        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(res.relinked, vec![ContactId::new(2)]);
        assert!(res.created.is_none());

        let p2 = res.contacts.iter().find(|c| c.id == ContactId::new(2)).unwrap();
        assert_eq!(p2.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(p2.linked_id, Some(ContactId::new(1)));
    }

    #[test]
    fn merge_repoints_secondaries_of_deposed_primary() {
        let store = store();
        run(&store, Some("a@x.com"), Some("111"));
        run(&store, Some("b@x.com"), Some("222"));
        run(&store, Some("c@x.com"), Some("222")); // secondary 3 -> 2

        let res = run(&store, Some("a@x.com"), Some("222"));
        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(res.relinked, vec![ContactId::new(2), ContactId::new(3)]);
        for c in res.contacts.iter().filter(|c| c.id != res.primary_id) {
            assert_eq!(c.linked_id, Some(ContactId::new(1)));
        }
    }

    #[test]
    fn timestamp_tie_elects_lowest_id() {
        let at = Utc::now();
        let store = InMemoryContactStore::from_contacts(
            [
                raw(5, Some("a@x.com"), None, None, LinkPrecedence::Primary, at),
                raw(3, None, Some("123"), None, LinkPrecedence::Primary, at),
            ],
            Arc::new(SteppingClock::new(at, Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap();

        let res = run(&store, Some("a@x.com"), Some("123"));
        assert_eq!(res.primary_id, ContactId::new(3));
        assert_eq!(res.relinked, vec![ContactId::new(5)]);
    }

    #[test]
    fn deep_legacy_chain_is_flattened_onto_root() {
        let t0 = Utc::now();
        let store = InMemoryContactStore::from_contacts(
            [
                raw(1, Some("a@x.com"), None, None, LinkPrecedence::Primary, t0),
                raw(2, Some("b@x.com"), None, Some(1), LinkPrecedence::Secondary, t0 + Duration::seconds(1)),
                raw(3, Some("c@x.com"), None, Some(2), LinkPrecedence::Secondary, t0 + Duration::seconds(2)),
            ],
            Arc::new(SteppingClock::new(t0 + Duration::seconds(10), Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap();

        let res = run(&store, Some("c@x.com"), None);
        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(ids(&res.contacts), vec![1, 2, 3]);
        assert_eq!(res.relinked, vec![ContactId::new(3)]);
        assert!(res.created.is_none());
        assert_eq!(res.contacts[2].linked_id, Some(ContactId::new(1)));
    }

    #[test]
    fn unlinked_secondary_is_promoted_when_elected() {
        let t0 = Utc::now();
        let store = InMemoryContactStore::from_contacts(
            [raw(1, Some("a@x.com"), None, None, LinkPrecedence::Secondary, t0)],
            Arc::new(SteppingClock::new(t0 + Duration::seconds(1), Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap();

        let res = run(&store, Some("a@x.com"), None);
        assert_eq!(res.primary_id, ContactId::new(1));
        assert_eq!(res.relinked, vec![ContactId::new(1)]);
        assert!(res.contacts[0].is_primary());
    }

    #[test]
    fn cyclic_chain_is_integrity_violation() {
        let t0 = Utc::now();
        let store = InMemoryContactStore::from_contacts(
            [
                raw(1, Some("a@x.com"), None, Some(2), LinkPrecedence::Secondary, t0),
                raw(2, Some("b@x.com"), None, Some(1), LinkPrecedence::Secondary, t0),
            ],
            Arc::new(SteppingClock::new(t0, Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap();

        let mut tx = store.begin().unwrap();
        let err = resolve(&mut *tx, Some("a@x.com"), None).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        assert!(!err.is_retryable());
    }

    /// Contact 1 is primary; every later contact links to the one before it.
    fn chain(edges: u64) -> InMemoryContactStore {
        let t0 = Utc::now();
        let contacts = (1..=edges + 1).map(|id| {
            let (linked, precedence) = if id == 1 {
                (None, LinkPrecedence::Primary)
            } else {
                (Some(id - 1), LinkPrecedence::Secondary)
            };
            raw(id, None, None, linked, precedence, t0)
        });
        InMemoryContactStore::from_contacts(
            contacts,
            Arc::new(SteppingClock::new(t0, Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap()
    }

    fn root_of_tail(edges: u64) -> ReconcileResult<ContactId> {
        let store = chain(edges);
        let mut tx = store.begin().unwrap();
        let tail = tx.find_by_id(ContactId::new(edges + 1)).unwrap().unwrap();
        find_root(&mut *tx, tail)
    }

    #[test]
    fn chain_at_hop_limit_reaches_primary() {
        let limit = MAX_LINK_HOPS as u64;
        assert_eq!(root_of_tail(limit - 1).unwrap(), ContactId::new(1));
        assert_eq!(root_of_tail(limit).unwrap(), ContactId::new(1));
    }

    #[test]
    fn chain_past_hop_limit_is_integrity_violation() {
        let err = root_of_tail(MAX_LINK_HOPS as u64 + 1).unwrap_err();
        assert!(err.to_string().contains("hops"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn dangling_link_stops_at_last_existing_contact() {
        let t0 = Utc::now();
        let store = InMemoryContactStore::from_contacts(
            [
                raw(1, Some("a@x.com"), None, None, LinkPrecedence::Primary, t0),
                raw(2, Some("b@x.com"), None, Some(1), LinkPrecedence::Secondary, t0),
                raw(3, Some("c@x.com"), None, Some(77), LinkPrecedence::Secondary, t0),
            ],
            Arc::new(SteppingClock::new(t0, Duration::seconds(1))),
            StoreConfig::default(),
        )
        .unwrap();

        let mut tx = store.begin().unwrap();
        let mut roots = BTreeSet::new();
        let start = tx.find_by_id(ContactId::new(3)).unwrap().unwrap();
        roots.insert(find_root(&mut *tx, start).unwrap());
        assert_eq!(roots.into_iter().collect::<Vec<_>>(), vec![ContactId::new(3)]);
        tx.rollback();

        // The orphan leads its own cluster from then on.
        let res = run(&store, Some("c@x.com"), None);
        assert_eq!(res.primary_id, ContactId::new(3));
        assert_eq!(res.relinked, vec![ContactId::new(3)]);
        assert!(res.contacts[0].is_primary());
        assert!(res.contacts[0].linked_id.is_none());
    }

    #[test]
    fn missing_identifiers_are_rejected() {
        let store = store();
        let mut tx = store.begin().unwrap();
        assert!(resolve(&mut *tx, None, None).unwrap_err().is_internal());
    }
}
