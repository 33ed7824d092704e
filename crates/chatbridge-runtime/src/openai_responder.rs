//! `AiResponder` backed by an OpenAI-compatible chat completions endpoint.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::collaborators::{AiResponder, ConversationMessage, ResponderError};
use crate::handoff_marker::HANDOFF_MARKER;

pub const DEFAULT_RESPONDER_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_RESPONDER_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_RESPONDER_TIMEOUT_MS: u64 = 60_000;

pub fn default_system_prompt() -> String {
    format!(
        "You are the customer support assistant of a small business chatting over instant \
         messaging. Answer briefly and politely in the customer's language. When the customer \
         asks for a person, wants to complain, or needs something you cannot resolve, reply \
         normally and include the token {HANDOFF_MARKER} anywhere in your answer."
    )
}

#[derive(Debug, Clone)]
/// Public struct `OpenAiResponderConfig` used across chatbridge components.
pub struct OpenAiResponderConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub request_timeout_ms: u64,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleResponder {
    client: reqwest::Client,
    config: OpenAiResponderConfig,
}

impl OpenAiCompatibleResponder {
    pub fn new(config: OpenAiResponderConfig) -> Result<Self, ResponderError> {
        if config.api_key.trim().is_empty() {
            return Err(ResponderError::MissingApiKey);
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|error| {
                ResponderError::InvalidResponse(format!("invalid API key header: {error}"))
            })?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;
        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{base}/chat/completions")
    }

    fn build_request_body(&self, history: &[ConversationMessage]) -> Value {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(json!({"role": "system", "content": self.config.system_prompt}));
        messages.extend(history.iter().map(|message| {
            json!({"role": message.role.as_str(), "content": message.text})
        }));
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_chat_completion(raw: &str) -> Result<String, ResponderError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(raw)?;
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        ResponderError::InvalidResponse("response contained no choices".to_string())
    })?;
    let text = choice.message.content.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ResponderError::InvalidResponse(
            "response contained no text".to_string(),
        ));
    }
    Ok(text)
}

#[async_trait]
impl AiResponder for OpenAiCompatibleResponder {
    async fn generate_response(
        &self,
        history: &[ConversationMessage],
    ) -> Result<String, ResponderError> {
        let body = self.build_request_body(history);
        let response = self
            .client
            .post(self.chat_completions_url())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(ResponderError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }
        parse_chat_completion(&raw)
    }
}
