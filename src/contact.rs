//! Contact records and cluster linkage.
//!
//! A contact is the only persisted entity. Clusters are never stored; they
//! are derived from `linked_id`, which on every secondary points at the
//! cluster's primary.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned contact identifier.
///
/// Ids increase with creation order, so they double as the tie-break when two
/// contacts share a `created_at`.
///
/// # Examples
///
/// ```
/// use identity_reconciler::ContactId;
///
/// assert!(ContactId::new(1) < ContactId::new(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContactId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<ContactId> for u64 {
    fn from(id: ContactId) -> Self {
        id.0
    }
}

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// The canonical, oldest member of the cluster.
    Primary,
    /// Any other member; linked to the primary.
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Unique id, monotonically increasing with creation.
    pub id: ContactId,
    /// Email address, if known.
    pub email: Option<String>,
    /// Phone number, if known.
    pub phone_number: Option<String>,
    /// The cluster primary this contact belongs to (secondaries only).
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
    /// Creation time. Never changes.
    pub created_at: DateTime<Utc>,
    /// Last time the linkage changed.
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Returns true if this contact is flagged primary.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Seniority order: earliest `created_at` first, lowest id on ties.
    #[must_use]
    pub fn seniority(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Returns true if the email matches exactly. `None` never matches.
    #[must_use]
    pub fn has_email(&self, email: Option<&str>) -> bool {
        matches!((self.email.as_deref(), email), (Some(a), Some(b)) if a == b)
    }

    /// Returns true if the phone number matches exactly. `None` never matches.
    #[must_use]
    pub fn has_phone(&self, phone: Option<&str>) -> bool {
        matches!((self.phone_number.as_deref(), phone), (Some(a), Some(b)) if a == b)
    }

    /// Returns true if either identifier matches.
    #[must_use]
    pub fn matches(&self, email: Option<&str>, phone: Option<&str>) -> bool {
        self.has_email(email) || self.has_phone(phone)
    }
}

/// Insert payload; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    /// Email address, if any.
    pub email: Option<String>,
    /// Phone number, if any.
    pub phone_number: Option<String>,
    /// Primary to link to (secondaries only).
    pub linked_id: Option<ContactId>,
    /// Primary or secondary.
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    /// A fresh primary.
    #[must_use]
    pub fn primary(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    /// A secondary of `primary`.
    #[must_use]
    pub fn secondary(email: Option<&str>, phone_number: Option<&str>, primary: ContactId) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }

    /// Materializes the record with its assigned id and creation time.
    #[must_use]
    pub fn into_contact(self, id: ContactId, now: DateTime<Utc>) -> Contact {
        Contact {
            id,
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.linked_id,
            link_precedence: self.link_precedence,
            created_at: now,
            updated_at: now,
        }
    }
}
