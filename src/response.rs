//! Externally visible cluster summary.
//!
//! The response lists every email and phone number in the cluster exactly once,
//! with the primary's values first. Ordering is part of the contract, so the
//! lists are built with insertion-ordered sets rather than hash sets.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::contact::{Contact, ContactId};
use crate::resolver::Resolution;

/// Response envelope: `{ "contact": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The resolved cluster.
    pub contact: ContactSummary,
}

/// Flattened view of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    /// Id of the cluster primary.
    pub primary_contact_id: ContactId,
    /// Distinct emails, primary's first.
    pub emails: Vec<String>,
    /// Distinct phone numbers, primary's first.
    pub phone_numbers: Vec<String>,
    /// Every non-primary member id, in load order.
    pub secondary_contact_ids: Vec<ContactId>,
}

impl IdentifyResponse {
    /// Builds the response for `primary_id` from the final contact set.
    #[must_use]
    pub fn from_cluster(primary_id: ContactId, contacts: &[Contact]) -> Self {
        let mut emails = IndexSet::new();
        let mut phone_numbers = IndexSet::new();

        if let Some(primary) = contacts.iter().find(|c| c.id == primary_id) {
            emails.extend(primary.email.iter().cloned());
            phone_numbers.extend(primary.phone_number.iter().cloned());
        }

        let mut secondary_contact_ids = Vec::with_capacity(contacts.len().saturating_sub(1));
        for contact in contacts {
            emails.extend(contact.email.iter().cloned());
            phone_numbers.extend(contact.phone_number.iter().cloned());
            if contact.id != primary_id {
                secondary_contact_ids.push(contact.id);
            }
        }

        Self {
            contact: ContactSummary {
                primary_contact_id: primary_id,
                emails: emails.into_iter().collect(),
                phone_numbers: phone_numbers.into_iter().collect(),
                secondary_contact_ids,
            },
        }
    }
}

impl From<&Resolution> for IdentifyResponse {
    fn from(resolution: &Resolution) -> Self {
        Self::from_cluster(resolution.primary_id, &resolution.contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};

    use crate::contact::NewContact;

    fn contacts() -> Vec<Contact> {
        let t0 = Utc::now();
        let primary = ContactId::new(4);
        vec![
            NewContact::secondary(Some("b@x.com"), Some("123"), primary)
                .into_contact(ContactId::new(2), t0),
            NewContact::primary(Some("a@x.com"), Some("999"))
                .into_contact(primary, t0 + Duration::seconds(1)),
            NewContact::secondary(None, Some("123"), primary)
                .into_contact(ContactId::new(7), t0 + Duration::seconds(2)),
            NewContact::secondary(Some("b@x.com"), None, primary)
                .into_contact(ContactId::new(9), t0 + Duration::seconds(3)),
        ]
    }

    #[test]
    fn primary_values_come_first_then_set_order() {
        let resp = IdentifyResponse::from_cluster(ContactId::new(4), &contacts());
        assert_eq!(resp.contact.primary_contact_id, ContactId::new(4));
        assert_eq!(resp.contact.emails, vec!["a@x.com", "b@x.com"]);
        assert_eq!(resp.contact.phone_numbers, vec!["999", "123"]);
        assert_eq!(
            resp.contact.secondary_contact_ids,
            vec![ContactId::new(2), ContactId::new(7), ContactId::new(9)]
        );
    }

    #[test]
    fn primary_without_email_contributes_nothing() {
        let t0 = Utc::now();
        let set = vec![
            NewContact::primary(None, Some("123")).into_contact(ContactId::new(1), t0),
            NewContact::secondary(Some("z@x.com"), Some("123"), ContactId::new(1))
                .into_contact(ContactId::new(2), t0),
        ];
        let resp = IdentifyResponse::from_cluster(ContactId::new(1), &set);
        assert_eq!(resp.contact.emails, vec!["z@x.com"]);
        assert_eq!(resp.contact.phone_numbers, vec!["123"]);
        assert_eq!(resp.contact.secondary_contact_ids, vec![ContactId::new(2)]);
    }

    #[test]
    fn serializes_to_wire_shape() {
        let t0 = Utc::now();
        let set = vec![NewContact::primary(Some("a@x.com"), Some("123"))
            .into_contact(ContactId::new(1), t0)];
        let json = serde_json::to_value(IdentifyResponse::from_cluster(ContactId::new(1), &set))
            .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": ["a@x.com"],
                    "phoneNumbers": ["123"],
                    "secondaryContactIds": []
                }
            })
        );
    }
}
