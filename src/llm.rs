//! Chat-completion providers.
//!
//! Extraction, grading and answer synthesis all reduce to "prompt in, text
//! out". [`ChatModel`] is that contract; three HTTP implementations cover
//! the providers docfusion supports:
//!
//! | Provider    | Endpoint | Credential |
//! |-------------|----------|------------|
//! | `openai`    | `POST /v1/chat/completions` | `OPENAI_API_KEY` |
//! | `anthropic` | `POST /v1/messages` | `ANTHROPIC_API_KEY` |
//! | `gemini`    | `POST /v1beta/models/{model}:generateContent` | `GOOGLE_API_KEY` |
//!
//! Every call goes through [`with_backoff`] with the provider's own
//! retry policy and request timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ChatConfig;
use crate::error::ProviderError;
use crate::retry::{send_json, with_backoff, RetryPolicy};

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// `provider/model`, for logs and reports.
    fn name(&self) -> String;

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Build the chat model a config section selects.
///
/// Fails with [`ProviderError::Auth`] when the provider's API key is not
/// in the environment.
pub fn create_chat_model(config: &ChatConfig) -> Result<Arc<dyn ChatModel>, ProviderError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ProviderError::Rejected(format!("failed to build HTTP client: {}", e)))?;

    let http = HttpChat {
        client,
        model: config.model.clone(),
        api_key: String::new(),
        url: config.url.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        policy: RetryPolicy::new(config.max_retries, config.backoff_base_ms),
    };

    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChat(HttpChat {
            api_key: require_key("OPENAI_API_KEY")?,
            ..http
        }))),
        "anthropic" => Ok(Arc::new(AnthropicChat(HttpChat {
            api_key: require_key("ANTHROPIC_API_KEY")?,
            ..http
        }))),
        "gemini" => Ok(Arc::new(GeminiChat(HttpChat {
            api_key: require_key("GOOGLE_API_KEY")?,
            ..http
        }))),
        other => Err(ProviderError::Rejected(format!(
            "unknown chat provider: {}",
            other
        ))),
    }
}

pub(crate) fn require_key(var: &str) -> Result<String, ProviderError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ProviderError::Auth(format!(
            "{} environment variable not set",
            var
        ))),
    }
}

struct HttpChat {
    client: reqwest::Client,
    model: String,
    api_key: String,
    url: Option<String>,
    temperature: f32,
    max_tokens: u32,
    policy: RetryPolicy,
}

impl HttpChat {
    fn base<'a>(&'a self, default: &'a str) -> &'a str {
        self.url.as_deref().unwrap_or(default).trim_end_matches('/')
    }
}

// ============ OpenAI ============

struct OpenAiChat(HttpChat);

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> String {
        format!("openai/{}", self.0.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let c = &self.0;
        let url = format!("{}/v1/chat/completions", c.base("https://api.openai.com"));
        let body = json!({
            "model": c.model,
            "temperature": c.temperature,
            "max_tokens": c.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let value = with_backoff(&c.policy, "openai.chat", || {
            send_json(
                "OpenAI",
                c.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", c.api_key))
                    .json(&body),
            )
        })
        .await?;

        parse_openai_chat(&value)
    }
}

fn parse_openai_chat(json: &Value) -> Result<String, ProviderError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Malformed("OpenAI response missing choices[0].message.content".into()))
}

// ============ Anthropic ============

struct AnthropicChat(HttpChat);

#[async_trait]
impl ChatModel for AnthropicChat {
    fn name(&self) -> String {
        format!("anthropic/{}", self.0.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let c = &self.0;
        let url = format!("{}/v1/messages", c.base("https://api.anthropic.com"));
        let body = json!({
            "model": c.model,
            "temperature": c.temperature,
            "max_tokens": c.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let value = with_backoff(&c.policy, "anthropic.messages", || {
            send_json(
                "Anthropic",
                c.client
                    .post(&url)
                    .header("x-api-key", &c.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body),
            )
        })
        .await?;

        parse_anthropic(&value)
    }
}

fn parse_anthropic(json: &Value) -> Result<String, ProviderError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::Malformed("Anthropic response missing content".into()))?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        return Err(ProviderError::Malformed(
            "Anthropic response has no text blocks".into(),
        ));
    }
    Ok(text)
}

// ============ Gemini ============

struct GeminiChat(HttpChat);

#[async_trait]
impl ChatModel for GeminiChat {
    fn name(&self) -> String {
        format!("gemini/{}", self.0.model)
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let c = &self.0;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            c.base("https://generativelanguage.googleapis.com"),
            c.model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": c.temperature,
                "maxOutputTokens": c.max_tokens,
            },
        });

        let value = with_backoff(&c.policy, "gemini.generate", || {
            send_json(
                "Gemini",
                c.client
                    .post(&url)
                    .header("x-goog-api-key", &c.api_key)
                    .json(&body),
            )
        })
        .await?;

        parse_gemini(&value)
    }
}

fn parse_gemini(json: &Value) -> Result<String, ProviderError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| ProviderError::Malformed("Gemini response missing candidates".into()))?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    if text.is_empty() {
        return Err(ProviderError::Malformed("Gemini response has no text".into()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_chat() {
        let v = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(parse_openai_chat(&v).unwrap(), "hi");
        assert!(parse_openai_chat(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_parse_anthropic_joins_text_blocks() {
        let v = json!({"content": [
            {"type": "text", "text": "Hello "},
            {"type": "tool_use", "id": "x"},
            {"type": "text", "text": "world"}
        ]});
        assert_eq!(parse_anthropic(&v).unwrap(), "Hello world");
        assert!(parse_anthropic(&json!({"content": []})).is_err());
    }

    #[test]
    fn test_parse_gemini() {
        let v = json!({"candidates": [{"content": {"parts": [{"text": "a"}, {"text": "b"}]}}]});
        assert_eq!(parse_gemini(&v).unwrap(), "ab");
        assert!(parse_gemini(&json!({})).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = ChatConfig {
            provider: "cohere".to_string(),
            ..ChatConfig::default()
        };
        assert!(matches!(
            create_chat_model(&config),
            Err(ProviderError::Rejected(_))
        ));
    }
}
