//! Voice provider boundary.
//!
//! Every successful [`CallGateway::place_call`] rings a real phone and costs
//! money. Callers own retry decisions; nothing here retries.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use autodialer_types::PhoneNumber;

pub mod twilio;
pub use twilio::TwilioGateway;

pub mod twiml;

/// Provider acknowledgement of a created call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlacedCall {
    pub reference_id: String,
    /// Initial provider status, e.g. `queued`.
    pub provider_status: String,
}

/// The provider refused or failed to create the call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct GatewayError {
    pub message: String,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait CallGateway: Send + Sync {
    async fn place_call(
        &self,
        destination: &PhoneNumber,
        message: &str,
    ) -> Result<PlacedCall, GatewayError>;
}

/// Gateway that never touches the network. Opt-in only.
#[derive(Default)]
pub struct DryRunGateway {
    issued: AtomicU64,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallGateway for DryRunGateway {
    async fn place_call(
        &self,
        destination: &PhoneNumber,
        message: &str,
    ) -> Result<PlacedCall, GatewayError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(to = %destination, chars = message.chars().count(), "dry-run call");
        Ok(PlacedCall {
            reference_id: format!("DRYRUN{n:06}"),
            provider_status: "queued".into(),
        })
    }
}

/// Gateway standing in for a provider with missing credentials.
pub struct UnconfiguredGateway {
    reason: String,
}

impl UnconfiguredGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CallGateway for UnconfiguredGateway {
    async fn place_call(
        &self,
        _destination: &PhoneNumber,
        _message: &str,
    ) -> Result<PlacedCall, GatewayError> {
        Err(GatewayError::new(self.reason.clone()))
    }
}
