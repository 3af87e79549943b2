//! # AI Follow-up Client
//!
//! Thin client for an OpenAI-compatible chat-completions endpoint. Prompts
//! sent through it must already be pseudonymized: the model only ever sees
//! `{{placeholders}}`, never patient data.
//!
//! Variables:
//! - `AI_API_URL` (required; full chat-completions URL)
//! - `AI_API_KEY` (optional bearer token)
//! - `AI_MODEL` (default: `gpt-4o-mini`)
//! - `AI_TIMEOUT_SECS` (default: 30)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Secret;
use crate::upstream::{ensure_success, env_url, retry_send, ConfigError, ProviderError};

const ENDPOINT: &str = "POST chat/completions";

/// AI provider configuration.
#[derive(Clone, Debug)]
pub struct AiConfig {
    pub api_url: Url,
    pub api_key: Option<Secret>,
    pub model: String,
    pub timeout_secs: u64,
}

impl AiConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_url: env_url("AI_API_URL")?,
            api_key: std::env::var("AI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(Secret::new),
            model: std::env::var("AI_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            timeout_secs: std::env::var("AI_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Client for the configured chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct AiClient {
    http: reqwest::Client,
    config: AiConfig,
}

impl AiClient {
    pub fn new(config: AiConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Http {
                endpoint: "client_init".into(),
                source: e,
            })?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Run one completion and return the assistant text.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.4,
        };

        let resp = retry_send(|| {
            let mut req = self.http.post(self.config.api_url.clone()).json(&body);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key.expose());
            }
            req.send()
        })
        .await
        .map_err(|e| ProviderError::Http {
            endpoint: ENDPOINT.into(),
            source: e,
        })?;
        let resp = ensure_success(ENDPOINT, resp).await?;

        let parsed: ChatResponse =
            resp.json()
                .await
                .map_err(|e| ProviderError::Deserialization {
                    endpoint: ENDPOINT.into(),
                    source: e,
                })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::Protocol {
                endpoint: ENDPOINT.into(),
                reason: "no completion content".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_key() {
        let config = AiConfig {
            api_url: Url::parse("https://llm.example.org/v1/chat/completions").unwrap(),
            api_key: Some(Secret::new("sk-very-secret")),
            model: "m".into(),
            timeout_secs: 5,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(AiClient::new(config).is_ok());
    }

    #[test]
    fn response_shape_parses() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":" Hi {{patient_first_name}} "}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some(" Hi {{patient_first_name}} ")
        );
    }

    #[tokio::test]
    async fn unreachable_provider_is_an_http_error() {
        let client = AiClient::new(AiConfig {
            api_url: Url::parse("http://127.0.0.1:1/v1/chat/completions").unwrap(),
            api_key: None,
            model: "m".into(),
            timeout_secs: 1,
        })
        .unwrap();
        let err = client.complete("system", "prompt").await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { .. }));
    }
}
