use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use autodialer_types::{
    CallAttempt, CallStatus, NewCallAttempt, PhoneNumber, PhoneRecord, RecordId, Statistics,
};

use crate::{PhoneStore, StoreError};

/// In-memory phone store.
///
/// Used by tests and dry runs. Nothing survives a restart.
pub struct InMemoryPhoneStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Vec<PhoneRecord>,
    attempts: Vec<CallAttempt>,
    last_record_id: RecordId,
    last_attempt_id: i64,
}

impl Inner {
    fn record_mut(&mut self, id: RecordId) -> Result<&mut PhoneRecord, StoreError> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

impl InMemoryPhoneStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryPhoneStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhoneStore for InMemoryPhoneStore {
    async fn create(&self, number: &PhoneNumber) -> Result<PhoneRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.records.iter().any(|r| &r.number == number) {
            return Err(StoreError::Duplicate(number.clone()));
        }
        inner.last_record_id += 1;
        let now = Utc::now();
        let record = PhoneRecord {
            id: inner.last_record_id,
            number: number.clone(),
            status: CallStatus::Pending,
            call_reference_id: None,
            called_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: RecordId) -> Result<Option<PhoneRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_number(
        &self,
        number: &PhoneNumber,
    ) -> Result<Option<PhoneRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().find(|r| &r.number == number).cloned())
    }

    async fn list_newest_first(&self) -> Result<Vec<PhoneRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.iter().rev().cloned().collect())
    }

    async fn most_recent(&self) -> Result<Option<PhoneRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.last().cloned())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<PhoneRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| r.status == CallStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: RecordId,
        status: CallStatus,
    ) -> Result<PhoneRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(id)?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn mark_dispatched(
        &self,
        id: RecordId,
        reference_id: &str,
        called_at: DateTime<Utc>,
    ) -> Result<PhoneRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner.record_mut(id)?;
        record.status = CallStatus::Completed;
        record.call_reference_id = Some(reference_id.to_string());
        record.called_at = Some(called_at);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn append_attempt(&self, attempt: NewCallAttempt) -> Result<CallAttempt, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.record_mut(attempt.phone_record_id)?;
        inner.last_attempt_id += 1;
        let entry = CallAttempt {
            id: inner.last_attempt_id,
            phone_record_id: attempt.phone_record_id,
            status: attempt.status,
            message: attempt.message,
            started_at: attempt.started_at,
            ended_at: None,
            created_at: Utc::now(),
        };
        inner.attempts.push(entry.clone());
        Ok(entry)
    }

    async fn attempts_for(&self, id: RecordId) -> Result<Vec<CallAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.phone_record_id == id)
            .cloned()
            .collect())
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let inner = self.inner.lock().await;
        Ok(Statistics::tally(&inner.records))
    }
}
