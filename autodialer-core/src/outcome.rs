use serde::Serialize;
use thiserror::Error;

use autodialer_store::StoreError;
use autodialer_types::{CallAttempt, CallIntent, PhoneNumber, PhoneRecord, RecordId};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Call failed: {message}")]
    Gateway { id: RecordId, message: String },
    #[error("Could not find a valid Indian phone number in your prompt, and no saved numbers are available.")]
    NoDestination,
    #[error("phone record {0} not found")]
    NotFound(RecordId),
    #[error("phone record {0} is already being dialled")]
    Busy(RecordId),
    #[error("a bulk batch is already running")]
    BatchRunning,
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An accepted call.
#[derive(Clone, Debug, Serialize)]
pub struct Dispatched {
    pub record: PhoneRecord,
    pub attempt: CallAttempt,
}

/// Result of intent-driven dispatch.
#[derive(Clone, Debug, Serialize)]
pub struct TextDispatch {
    pub intent: CallIntent,
    /// The record was created for this dispatch.
    pub created: bool,
    /// No number in the text; the most recent record was used.
    pub used_fallback: bool,
    pub dispatched: Dispatched,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Nothing was pending; no call was placed.
    NoPending,
    Ran(BatchReport),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    /// Records the batch dialled. Equals `succeeded + failed`.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
    /// Selected as pending but dialled elsewhere before the batch reached
    /// them. Not counted in `attempted`.
    pub skipped: usize,
    /// Stopped early by [`crate::Dispatcher::cancel_batch`].
    pub cancelled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchFailure {
    pub id: RecordId,
    pub number: PhoneNumber,
    pub reason: String,
}

/// Result of a bulk upload.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UploadReport {
    pub created: Vec<PhoneRecord>,
    pub rejected: Vec<Rejection>,
    /// Entries past the upload limit that were not looked at.
    pub ignored: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Rejection {
    pub input: String,
    pub reason: String,
}
