use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use autodialer_types::{
    CallAttempt, CallStatus, NewCallAttempt, PhoneNumber, PhoneRecord, RecordId, Statistics,
};

pub mod memory;
pub use memory::InMemoryPhoneStore;

pub mod sqlite;
pub use sqlite::SqlitePhoneStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("number {0} already exists")]
    Duplicate(PhoneNumber),
    #[error("phone record {0} not found")]
    NotFound(RecordId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Phone records plus the append-only call attempt log.
///
/// Records are returned in storage (creation) order unless a method says
/// otherwise.
#[async_trait]
pub trait PhoneStore: Send + Sync {
    /// Insert a new `pending` record. Fails with `Duplicate` if the number exists.
    async fn create(&self, number: &PhoneNumber) -> Result<PhoneRecord, StoreError>;

    async fn get(&self, id: RecordId) -> Result<Option<PhoneRecord>, StoreError>;

    async fn find_by_number(
        &self,
        number: &PhoneNumber,
    ) -> Result<Option<PhoneRecord>, StoreError>;

    /// All records, most recently created first.
    async fn list_newest_first(&self) -> Result<Vec<PhoneRecord>, StoreError>;

    /// The most recently created record, if any.
    async fn most_recent(&self) -> Result<Option<PhoneRecord>, StoreError>;

    /// Up to `limit` `pending` records in creation order.
    async fn pending(&self, limit: usize) -> Result<Vec<PhoneRecord>, StoreError>;

    async fn set_status(
        &self,
        id: RecordId,
        status: CallStatus,
    ) -> Result<PhoneRecord, StoreError>;

    /// Record an accepted dispatch: reference id, call time and `completed`.
    async fn mark_dispatched(
        &self,
        id: RecordId,
        reference_id: &str,
        called_at: DateTime<Utc>,
    ) -> Result<PhoneRecord, StoreError>;

    async fn append_attempt(&self, attempt: NewCallAttempt) -> Result<CallAttempt, StoreError>;

    /// Attempts for one record, oldest first.
    async fn attempts_for(&self, id: RecordId) -> Result<Vec<CallAttempt>, StoreError>;

    async fn statistics(&self) -> Result<Statistics, StoreError>;

    /// Existing record for `number`, or a fresh `pending` one.
    ///
    /// Returns `true` alongside the record when it was created.
    async fn find_or_create(
        &self,
        number: &PhoneNumber,
    ) -> Result<(PhoneRecord, bool), StoreError> {
        if let Some(existing) = self.find_by_number(number).await? {
            return Ok((existing, false));
        }
        match self.create(number).await {
            Ok(record) => Ok((record, true)),
            // Lost a race with another writer; theirs is as good as ours.
            Err(StoreError::Duplicate(_)) => self
                .find_by_number(number)
                .await?
                .map(|r| (r, false))
                .ok_or_else(|| StoreError::Backend(format!("{number} vanished after insert"))),
            Err(e) => Err(e),
        }
    }
}
