//! In-process store adapter.
//!
//! Mirrors the relational schema closely enough to exercise the import
//! pipeline without a database: unique keys on subscribers and message ids
//! report SQLSTATE `23505`, dangling references report `23503`. Writes are
//! visible immediately; `commit` only counts.

use crate::config::UNIQUE_VIOLATION;
use crate::error::StoreError;
use crate::models::{Address, EnvelopeFields, PartFields, Role};
use crate::store::{MailStore, StoreSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

const FOREIGN_KEY_VIOLATION: &str = "23503";
const INTERNAL_ERROR: &str = "XX000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberRow {
    pub id: i64,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeRow {
    pub id: i64,
    pub fields: EnvelopeFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeSubscriberRow {
    pub envelope_id: i64,
    pub subscriber_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRow {
    pub id: i64,
    pub fields: PartFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartEdgeRow {
    pub envelope_id: i64,
    pub part_id: i64,
    pub parent_id: i64,
}

#[derive(Debug, Default)]
struct Tables {
    subscribers: Vec<SubscriberRow>,
    envelopes: Vec<EnvelopeRow>,
    envelope_subscribers: Vec<EnvelopeSubscriberRow>,
    parts: Vec<PartRow>,
    edges: Vec<PartEdgeRow>,
    commits: usize,
    sessions: usize,
    failing_message_ids: HashSet<String>,
    failing_addresses: HashSet<String>,
    conflicting_association_addresses: HashSet<String>,
}

impl Tables {
    fn has_envelope(&self, id: i64) -> bool {
        self.envelopes.iter().any(|row| row.id == id)
    }
}

/// Shared in-memory tables. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert of an envelope with this `Message-ID` fail with a
    /// non-ignorable error.
    pub fn fail_envelope(&self, message_id: impl Into<String>) {
        self.tables.lock().failing_message_ids.insert(message_id.into());
    }

    /// Make every insert of a subscriber with this address fail with a
    /// non-ignorable error.
    pub fn fail_subscriber(&self, address: impl Into<String>) {
        self.tables.lock().failing_addresses.insert(address.into());
    }

    /// Make every association row for a subscriber with this address report
    /// a unique violation.
    pub fn conflict_associations_for(&self, address: impl Into<String>) {
        self.tables
            .lock()
            .conflicting_association_addresses
            .insert(address.into());
    }

    pub fn subscribers(&self) -> Vec<SubscriberRow> {
        self.tables.lock().subscribers.clone()
    }

    pub fn envelopes(&self) -> Vec<EnvelopeRow> {
        self.tables.lock().envelopes.clone()
    }

    pub fn envelope_subscribers(&self) -> Vec<EnvelopeSubscriberRow> {
        self.tables.lock().envelope_subscribers.clone()
    }

    pub fn parts(&self) -> Vec<PartRow> {
        self.tables.lock().parts.clone()
    }

    pub fn edges(&self) -> Vec<PartEdgeRow> {
        self.tables.lock().edges.clone()
    }

    pub fn commits(&self) -> usize {
        self.tables.lock().commits
    }

    /// Number of sessions handed out so far.
    pub fn sessions(&self) -> usize {
        self.tables.lock().sessions
    }

    pub fn envelope_by_message_id(&self, message_id: &str) -> Option<EnvelopeRow> {
        self.tables
            .lock()
            .envelopes
            .iter()
            .find(|row| row.fields.message_id.as_deref() == Some(message_id))
            .cloned()
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    type Session = MemorySession;

    async fn session(&self) -> Result<MemorySession, StoreError> {
        self.tables.lock().sessions += 1;
        Ok(MemorySession {
            tables: Arc::clone(&self.tables),
        })
    }
}

pub struct MemorySession {
    tables: Arc<Mutex<Tables>>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn insert_subscriber(&mut self, address: &Address) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock();
        if tables.failing_addresses.contains(&address.address) {
            return Err(StoreError::new(
                INTERNAL_ERROR,
                format!("injected failure for subscriber {}", address.address),
            ));
        }
        if tables.subscribers.iter().any(|row| &row.address == address) {
            return Err(StoreError::new(
                UNIQUE_VIOLATION,
                "duplicate key value violates unique constraint \"subscriber_address_name_key\"",
            ));
        }
        let id = tables.subscribers.len() as i64 + 1;
        tables.subscribers.push(SubscriberRow {
            id,
            address: address.clone(),
        });
        Ok(id)
    }

    async fn lookup_subscriber(&mut self, address: &Address) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .lock()
            .subscribers
            .iter()
            .find(|row| &row.address == address)
            .map(|row| row.id))
    }

    async fn insert_envelope(&mut self, fields: &EnvelopeFields) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(message_id) = fields.message_id.as_deref() {
            if tables.failing_message_ids.contains(message_id) {
                return Err(StoreError::new(
                    INTERNAL_ERROR,
                    format!("injected failure for envelope {}", message_id),
                ));
            }
            if tables
                .envelopes
                .iter()
                .any(|row| row.fields.message_id.as_deref() == Some(message_id))
            {
                return Err(StoreError::new(
                    UNIQUE_VIOLATION,
                    "duplicate key value violates unique constraint \"envelope_message_id_key\"",
                ));
            }
        }
        let id = tables.envelopes.len() as i64 + 1;
        tables.envelopes.push(EnvelopeRow {
            id,
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn lookup_envelope_by_message_id(
        &mut self,
        message_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .tables
            .lock()
            .envelopes
            .iter()
            .find(|row| row.fields.message_id.as_deref() == Some(message_id))
            .map(|row| row.id))
    }

    async fn insert_envelope_subscriber(
        &mut self,
        envelope_id: i64,
        subscriber_id: i64,
        role: Role,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let Some(subscriber) = tables.subscribers.iter().find(|row| row.id == subscriber_id)
        else {
            return Err(StoreError::new(
                FOREIGN_KEY_VIOLATION,
                "insert on envelope_subscriber violates foreign key constraint",
            ));
        };
        if tables
            .conflicting_association_addresses
            .contains(&subscriber.address.address)
        {
            return Err(StoreError::new(
                UNIQUE_VIOLATION,
                "duplicate key value violates unique constraint \"envelope_subscriber_pkey\"",
            ));
        }
        if !tables.has_envelope(envelope_id) {
            return Err(StoreError::new(
                FOREIGN_KEY_VIOLATION,
                "insert on envelope_subscriber violates foreign key constraint",
            ));
        }
        tables.envelope_subscribers.push(EnvelopeSubscriberRow {
            envelope_id,
            subscriber_id,
            role,
        });
        Ok(())
    }

    async fn insert_part(&mut self, fields: &PartFields) -> Result<i64, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(referenced) = fields.referenced_envelope_id {
            if !tables.has_envelope(referenced) {
                return Err(StoreError::new(
                    FOREIGN_KEY_VIOLATION,
                    "insert on part violates foreign key constraint",
                ));
            }
        }
        let id = tables.parts.len() as i64 + 1;
        tables.parts.push(PartRow {
            id,
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn insert_part_edge(
        &mut self,
        envelope_id: i64,
        part_id: i64,
        parent_id: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let part_known = tables.parts.iter().any(|row| row.id == part_id);
        if !tables.has_envelope(envelope_id) || !part_known {
            return Err(StoreError::new(
                FOREIGN_KEY_VIOLATION,
                "insert on envelope_part violates foreign key constraint",
            ));
        }
        tables.edges.push(PartEdgeRow {
            envelope_id,
            part_id,
            parent_id,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.tables.lock().commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorPolicy;
    use crate::store::EnvelopeInsert;

    fn policy() -> ErrorPolicy {
        ErrorPolicy::new([UNIQUE_VIOLATION])
    }

    fn envelope(message_id: &str) -> EnvelopeFields {
        EnvelopeFields {
            message_id: Some(message_id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscriber_insert_or_get() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let alice = Address::new("alice@example.com", "Alice");

        let first = session.insert_or_get_subscriber(&policy(), &alice).await.unwrap();
        let second = session.insert_or_get_subscriber(&policy(), &alice).await.unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(second, Some(1));

        let other_name = Address::new("alice@example.com", "");
        let third = session.insert_or_get_subscriber(&policy(), &other_name).await.unwrap();
        assert_eq!(third, Some(2));
        assert_eq!(store.subscribers().len(), 2);
    }

    #[tokio::test]
    async fn test_unique_violation_without_policy_is_fatal() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let bob = Address::new("bob@example.com", "");
        let strict = ErrorPolicy::default();

        session.insert_or_get_subscriber(&strict, &bob).await.unwrap();
        let err = session
            .insert_or_get_subscriber(&strict, &bob)
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some(UNIQUE_VIOLATION));
    }

    #[tokio::test]
    async fn test_envelope_insert_or_get() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let fields = envelope("<a@example.com>");

        let inserted = session.insert_or_get_envelope(&policy(), &fields, false).await.unwrap();
        assert!(matches!(inserted, EnvelopeInsert::Inserted(1)));

        let reused = session.insert_or_get_envelope(&policy(), &fields, true).await.unwrap();
        assert!(matches!(reused, EnvelopeInsert::Reused(1)));

        let conflict = session.insert_or_get_envelope(&policy(), &fields, false).await.unwrap();
        assert!(matches!(conflict, EnvelopeInsert::Conflict(_)));
        assert_eq!(store.envelopes().len(), 1);
    }

    #[tokio::test]
    async fn test_envelopes_without_message_id_never_conflict() {
        let store = MemoryStore::new();
        let mut session = store.session().await.unwrap();
        let fields = EnvelopeFields::default();

        session.insert_envelope(&fields).await.unwrap();
        session.insert_envelope(&fields).await.unwrap();
        assert_eq!(store.envelopes().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_and_foreign_keys() {
        let store = MemoryStore::new();
        store.fail_envelope("<bad@example.com>");
        let mut session = store.session().await.unwrap();

        let err = session.insert_envelope(&envelope("<bad@example.com>")).await.unwrap_err();
        assert!(!policy().is_ignorable(&err));

        let err = session.insert_part_edge(1, 1, 1).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some(FOREIGN_KEY_VIOLATION));

        session.commit().await.unwrap();
        assert_eq!(store.commits(), 1);
    }
}
