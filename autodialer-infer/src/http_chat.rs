use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ChatMessage, ChatRequest, LlmEngine, LlmError, ResponseFormat};

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    response_format: OpenAIResponseFormat,
}

#[derive(Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat engine for a Perplexity/OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpChatEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpChatEngine {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

fn request_body<'a>(model: &'a str, req: &'a ChatRequest) -> OpenAIChatRequest<'a> {
    OpenAIChatRequest {
        model,
        messages: &req.messages,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        response_format: OpenAIResponseFormat {
            kind: match req.response_format {
                ResponseFormat::Text => "text",
                ResponseFormat::JsonObject => "json_object",
            },
        },
    }
}

/// `choices[0].message.content` of a completion body.
fn first_choice_content(body: &str) -> Result<String, LlmError> {
    let parsed: ChatCompletion =
        serde_json::from_str(body).map_err(|e| LlmError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Decode("no choices".into()))?;
    Ok(choice.message.content.unwrap_or_default())
}

#[async_trait]
impl LlmEngine for HttpChatEngine {
    async fn complete(&self, req: ChatRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = req.model.as_deref().unwrap_or(&self.model);
        let body = request_body(model, &req);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            tracing::warn!(%status, model, "chat completion rejected");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        first_choice_content(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_strict_json_contract() {
        let req = ChatRequest {
            messages: vec![ChatMessage::system("rules"), ChatMessage::user("call me")],
            temperature: 0.0,
            max_tokens: None,
            response_format: ResponseFormat::JsonObject,
            model: None,
        };
        let v = serde_json::to_value(request_body("sonar", &req)).unwrap();
        assert_eq!(v["model"], "sonar");
        assert_eq!(v["temperature"], 0.0);
        assert_eq!(v["response_format"]["type"], "json_object");
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "call me");
        assert!(v.get("max_tokens").is_none());
    }

    #[test]
    fn reads_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"phone\":null}"}},{"message":{"content":"second"}}]}"#;
        assert_eq!(first_choice_content(body).unwrap(), r#"{"phone":null}"#);
    }

    #[test]
    fn empty_choices_are_malformed() {
        assert!(matches!(
            first_choice_content(r#"{"choices":[]}"#),
            Err(LlmError::Decode(_))
        ));
        assert!(matches!(
            first_choice_content("not json"),
            Err(LlmError::Decode(_))
        ));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let engine = HttpChatEngine::new(
            "https://api.perplexity.ai/",
            "key",
            "sonar",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(engine.base_url, "https://api.perplexity.ai");
        assert_eq!(engine.model(), "sonar");
    }
}
