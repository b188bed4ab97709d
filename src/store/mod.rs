//! Persistence port.
//!
//! The import pipeline talks to the relational store only through
//! [`StoreSession`]. Every insert returns the generated key; every failure
//! carries the store's error code so the operator-configured
//! [`ErrorPolicy`] can separate expected duplicate-key conditions from fatal
//! errors.
//!
//! The optimistic insert-then-lookup strategy used for subscribers and
//! referenced envelopes is spelled out in the provided methods
//! [`StoreSession::insert_or_get_subscriber`] and
//! [`StoreSession::insert_or_get_envelope`].
//!
//! Adapters:
//! - [`PgMailStore`]: PostgreSQL via sqlx
//! - [`MemoryStore`]: in-process tables used for dry runs and tests

pub mod memory;
pub mod migration;
pub mod postgres;

use crate::error::{ErrorPolicy, StoreError};
use crate::models::{Address, EnvelopeFields, PartFields, Role};
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PgMailStore;

/// Outcome of [`StoreSession::insert_or_get_envelope`].
#[derive(Debug)]
pub enum EnvelopeInsert {
    /// A new row was written.
    Inserted(i64),
    /// The insert conflicted and the existing row was adopted.
    Reused(i64),
    /// The insert hit an ignorable conflict but reuse was not allowed.
    Conflict(StoreError),
    /// The insert conflicted and no existing row could be found.
    Missing,
}

/// One logical connection to the store, owned by a single mailbox worker.
#[async_trait]
pub trait StoreSession: Send {
    async fn insert_subscriber(&mut self, address: &Address) -> Result<i64, StoreError>;

    async fn lookup_subscriber(&mut self, address: &Address) -> Result<Option<i64>, StoreError>;

    async fn insert_envelope(&mut self, fields: &EnvelopeFields) -> Result<i64, StoreError>;

    async fn lookup_envelope_by_message_id(
        &mut self,
        message_id: &str,
    ) -> Result<Option<i64>, StoreError>;

    async fn insert_envelope_subscriber(
        &mut self,
        envelope_id: i64,
        subscriber_id: i64,
        role: Role,
    ) -> Result<(), StoreError>;

    async fn insert_part(&mut self, fields: &PartFields) -> Result<i64, StoreError>;

    async fn insert_part_edge(
        &mut self,
        envelope_id: i64,
        part_id: i64,
        parent_id: i64,
    ) -> Result<(), StoreError>;

    /// Make the writes of the current message durable.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Insert a subscriber, or find the existing row after an ignorable conflict.
    ///
    /// Returns `Ok(None)` when the conflict was ignorable but the lookup found
    /// nothing; fatal errors propagate.
    async fn insert_or_get_subscriber(
        &mut self,
        policy: &ErrorPolicy,
        address: &Address,
    ) -> Result<Option<i64>, StoreError> {
        match policy.check(self.insert_subscriber(address).await)? {
            Some(id) => Ok(Some(id)),
            None => self.lookup_subscriber(address).await,
        }
    }

    /// Insert an envelope; after an ignorable conflict adopt the existing row
    /// with the same `Message-ID` only when `reuse_existing` is set.
    async fn insert_or_get_envelope(
        &mut self,
        policy: &ErrorPolicy,
        fields: &EnvelopeFields,
        reuse_existing: bool,
    ) -> Result<EnvelopeInsert, StoreError> {
        match self.insert_envelope(fields).await {
            Ok(id) => Ok(EnvelopeInsert::Inserted(id)),
            Err(err) if policy.is_ignorable(&err) => {
                if !reuse_existing {
                    return Ok(EnvelopeInsert::Conflict(err));
                }
                let existing = match fields.message_id.as_deref() {
                    Some(message_id) => self.lookup_envelope_by_message_id(message_id).await?,
                    None => None,
                };
                Ok(existing
                    .map(EnvelopeInsert::Reused)
                    .unwrap_or(EnvelopeInsert::Missing))
            }
            Err(err) => Err(err),
        }
    }
}

/// Factory of store sessions; shared by all mailbox workers.
#[async_trait]
pub trait MailStore: Send + Sync + 'static {
    type Session: StoreSession + 'static;

    async fn session(&self) -> Result<Self::Session, StoreError>;
}
