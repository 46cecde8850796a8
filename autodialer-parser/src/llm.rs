use std::sync::Arc;

use serde_json::Value;

use autodialer_infer::{ChatMessage, ChatRequest, LlmEngine, ResponseFormat};
use autodialer_types::{sanitize_message, CallIntent, PhoneNumber};

use crate::ParseFailure;

pub const SYSTEM_PROMPT: &str = "\
You are a strict command parser for a phone autodialer.
Convert the user's instruction into strict JSON with keys:
  - phone: E.164 Indian number like \"+91XXXXXXXXXX\" (must start with +91 and 10 digits).
  - message: short text (<= 280 chars) to be spoken on the call.
Rules:
  - Always return JSON only. No prose.
  - If user gives a 10-digit Indian mobile (starting 6-9), normalize to +91XXXXXXXXXX.
  - If no valid Indian phone is found, set phone to null.
  - If no message is provided, set message to \"Hello! This is a test call from Autodialer.\"
";

/// First parsing stage: ask the model for `{phone, message}` JSON.
pub struct LlmIntentParser {
    engine: Arc<dyn LlmEngine>,
}

impl LlmIntentParser {
    pub fn new(engine: Arc<dyn LlmEngine>) -> Self {
        Self { engine }
    }

    pub async fn try_parse(&self, text: &str) -> Result<CallIntent, ParseFailure> {
        let req = ChatRequest {
            messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(text)],
            temperature: 0.0,
            max_tokens: None,
            response_format: ResponseFormat::JsonObject,
            model: None,
        };
        let content = self.engine.complete(req).await?;
        intent_from_completion(&content)
    }
}

/// Decode the model's JSON answer and re-apply our own normalization.
pub fn intent_from_completion(content: &str) -> Result<CallIntent, ParseFailure> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ParseFailure::Content(format!("{e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseFailure::Content("top level is not an object".into()))?;

    let phone = match obj.get("phone") {
        Some(Value::String(s)) => PhoneNumber::normalize(s),
        Some(Value::Number(n)) => PhoneNumber::normalize(&n.to_string()),
        _ => None,
    };
    let message = match obj.get("message") {
        Some(Value::String(s)) => sanitize_message(s),
        _ => sanitize_message(""),
    };
    Ok(CallIntent { phone, message })
}

/// Models sometimes wrap JSON in a Markdown fence despite instructions.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
