//! Free text to [`CallIntent`].
//!
//! Two explicit stages: [`LlmIntentParser::try_parse`] may fail,
//! [`RuleBasedParser::parse`] never does, and [`or_fallback`] composes them.
//! [`IntentParser`] is the composed, infallible entry point.

use std::sync::Arc;

use thiserror::Error;

use autodialer_infer::{LlmEngine, LlmError};
use autodialer_types::CallIntent;

pub mod llm;
pub use llm::LlmIntentParser;

pub mod rules;
pub use rules::RuleBasedParser;

/// Why the LLM stage produced nothing usable. Never leaves this crate's
/// composed parser.
#[derive(Debug, Error)]
pub enum ParseFailure {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("completion is not a JSON object: {0}")]
    Content(String),
}

/// Take the first stage's intent, or compute the fallback.
pub fn or_fallback<F>(attempt: Result<CallIntent, ParseFailure>, fallback: F) -> CallIntent
where
    F: FnOnce() -> CallIntent,
{
    match attempt {
        Ok(intent) => intent,
        Err(e) => {
            tracing::info!(reason = %e, "falling back to rule-based parsing");
            fallback()
        }
    }
}

/// LLM-first parser with the rule-based extractor behind it.
pub struct IntentParser {
    llm: Option<LlmIntentParser>,
    rules: RuleBasedParser,
}

impl IntentParser {
    /// Parser without an LLM stage.
    pub fn rule_based() -> Self {
        Self {
            llm: None,
            rules: RuleBasedParser,
        }
    }

    pub fn with_llm(engine: Arc<dyn LlmEngine>) -> Self {
        Self {
            llm: Some(LlmIntentParser::new(engine)),
            rules: RuleBasedParser,
        }
    }

    pub fn uses_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Best-effort intent. Never fails.
    pub async fn parse(&self, text: &str) -> CallIntent {
        let attempt = match &self.llm {
            Some(llm) => llm.try_parse(text).await,
            None => Err(ParseFailure::Llm(LlmError::Unconfigured)),
        };
        or_fallback(attempt, || self.rules.parse(text))
    }
}
