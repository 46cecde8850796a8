use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http_chat;
pub use http_chat::HttpChatEngine;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Output shape requested from the model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
}

/// Single chat-completion request handed to the engine.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub response_format: ResponseFormat,
    /// Overrides the engine's default model when set.
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no LLM engine configured")]
    Unconfigured,
    #[error("HTTP error: {0}")]
    Transport(String),
    #[error("HTTP status: {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion: {0}")]
    Decode(String),
}

/// Chat-completion endpoint. Returns the text of the first choice.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    async fn complete(&self, req: ChatRequest) -> Result<String, LlmError>;
}

/// Stand-in used when no credential is configured.
pub struct NullLlmEngine;

#[async_trait]
impl LlmEngine for NullLlmEngine {
    async fn complete(&self, _req: ChatRequest) -> Result<String, LlmError> {
        Err(LlmError::Unconfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_engine_reports_unconfigured() {
        let req = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
            max_tokens: None,
            response_format: ResponseFormat::Text,
            model: None,
        };
        let err = NullLlmEngine.complete(req).await.unwrap_err();
        assert!(matches!(err, LlmError::Unconfigured));
    }
}
