//! Concrete collaborators chosen from configuration.

use std::sync::Arc;

use autodialer_config::{DialerConfig, LlmConfig};
use autodialer_gateway::{CallGateway, DryRunGateway, GatewayError, TwilioGateway, UnconfiguredGateway};
use autodialer_infer::{HttpChatEngine, LlmEngine, LlmError, NullLlmEngine};
use autodialer_parser::IntentParser;
use autodialer_store::PhoneStore;

use crate::Dispatcher;

/// The real provider, the dry-run double, or a refusing stand-in when
/// credentials are missing.
pub fn call_gateway(cfg: &DialerConfig) -> Result<Arc<dyn CallGateway>, GatewayError> {
    if cfg.dispatch.dry_run {
        tracing::warn!("dry-run gateway in use; no calls will be placed");
        return Ok(Arc::new(DryRunGateway::new()));
    }
    match cfg.twilio.require_credentials() {
        Ok(()) => Ok(Arc::new(TwilioGateway::new(&cfg.twilio)?)),
        Err(e) => {
            tracing::warn!(error = %e, "voice provider not configured");
            Ok(Arc::new(UnconfiguredGateway::new(e.to_string())))
        }
    }
}

/// HTTP chat engine when a key is set.
pub fn chat_engine(cfg: &LlmConfig) -> Result<Option<Arc<dyn LlmEngine>>, LlmError> {
    let Some(key) = cfg.api_key() else {
        return Ok(None);
    };
    let engine = HttpChatEngine::new(&cfg.base_url, key, &cfg.model, cfg.timeout())?;
    Ok(Some(Arc::new(engine)))
}

/// Engine for callers that need one regardless; fails every request when
/// no key is set.
pub fn chat_engine_or_null(engine: &Option<Arc<dyn LlmEngine>>) -> Arc<dyn LlmEngine> {
    match engine {
        Some(engine) => Arc::clone(engine),
        None => Arc::new(NullLlmEngine),
    }
}

pub fn intent_parser(engine: &Option<Arc<dyn LlmEngine>>) -> IntentParser {
    match engine {
        Some(engine) => IntentParser::with_llm(Arc::clone(engine)),
        None => {
            tracing::info!("no LLM key; using rule-based parsing only");
            IntentParser::rule_based()
        }
    }
}

/// Dispatcher over `store` with everything else taken from `cfg`.
pub fn dispatcher(
    cfg: &DialerConfig,
    store: Arc<dyn PhoneStore>,
    engine: &Option<Arc<dyn LlmEngine>>,
) -> Result<Dispatcher, GatewayError> {
    Ok(Dispatcher::new(
        store,
        call_gateway(cfg)?,
        intent_parser(engine),
        &cfg.dispatch,
    ))
}
