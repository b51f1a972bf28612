//! LLM backends for incident explanation.
//!
//! A tagged variant per provider rather than a trait object; the discriminant
//! is the only dispatch the enricher needs. A missing API key downgrades to
//! `Disabled` at startup so the pipeline keeps notifying without
//! explanations.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::{Config, LlmProviderKind};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_MODEL: &str = "gpt-4";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm provider disabled")]
    Disabled,

    #[error("llm request timed out")]
    Timeout,

    #[error("llm transport error: {0}")]
    Transport(String),

    #[error("llm rejected credentials (status {0})")]
    Auth(u16),

    #[error("llm returned status {0}")]
    Status(u16),

    #[error("unexpected llm response shape")]
    MalformedResponse,
}

impl LlmError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Disabled | Self::Auth(_) | Self::MalformedResponse => false,
        }
    }
}

pub enum LlmBackend {
    Gemini {
        http: reqwest::Client,
        api_key: String,
        base_url: String,
    },
    OpenAi {
        http: reqwest::Client,
        api_key: String,
        base_url: String,
    },
    Disabled,
}

impl LlmBackend {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.llm_timeout_seconds))
            .build()
            .context("building llm http client")?;

        let backend = match cfg.llm_provider {
            LlmProviderKind::Gemini => match &cfg.gemini_api_key {
                Some(key) => Self::Gemini {
                    http,
                    api_key: key.clone(),
                    base_url: cfg
                        .llm_base_url
                        .clone()
                        .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
                },
                None => {
                    warn!("LLM_PROVIDER=gemini but GEMINI_API_KEY is unset; enrichment disabled");
                    Self::Disabled
                }
            },
            LlmProviderKind::OpenAi => match &cfg.openai_api_key {
                Some(key) => Self::OpenAi {
                    http,
                    api_key: key.clone(),
                    base_url: cfg
                        .llm_base_url
                        .clone()
                        .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                },
                None => {
                    warn!("LLM_PROVIDER=openai but OPENAI_API_KEY is unset; enrichment disabled");
                    Self::Disabled
                }
            },
            LlmProviderKind::None => Self::Disabled,
        };
        Ok(backend)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    /// One model call; the caller owns timeouts and retries.
    pub async fn explain(&self, prompt: &str) -> Result<String, LlmError> {
        match self {
            Self::Disabled => Err(LlmError::Disabled),
            Self::Gemini {
                http,
                api_key,
                base_url,
            } => {
                let url = format!(
                    "{base_url}/v1beta/models/{GEMINI_MODEL}:generateContent?key={api_key}"
                );
                let body = json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                    "generationConfig": {"temperature": 0.3, "maxOutputTokens": 200}
                });
                let response = http.post(&url).json(&body).send().await.map_err(map_reqwest)?;
                let value = check_status(response).await?;
                value["candidates"][0]["content"]["parts"][0]["text"]
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or(LlmError::MalformedResponse)
            }
            Self::OpenAi {
                http,
                api_key,
                base_url,
            } => {
                let url = format!("{base_url}/v1/chat/completions");
                let body = json!({
                    "model": OPENAI_MODEL,
                    "messages": [
                        {"role": "system",
                         "content": "You are a payment systems expert providing concise incident analysis."},
                        {"role": "user", "content": prompt}
                    ],
                    "temperature": 0.3,
                    "max_tokens": 200
                });
                let response = http
                    .post(&url)
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(map_reqwest)?;
                let value = check_status(response).await?;
                value["choices"][0]["message"]["content"]
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or(LlmError::MalformedResponse)
            }
        }
    }
}

fn map_reqwest(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<Value, LlmError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => response
            .json::<Value>()
            .await
            .map_err(|_| LlmError::MalformedResponse),
        401 | 403 => Err(LlmError::Auth(status)),
        other => Err(LlmError::Status(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriability_classification() {
        assert!(LlmError::Timeout.is_retriable());
        assert!(LlmError::Transport("reset".into()).is_retriable());
        assert!(LlmError::Status(503).is_retriable());
        assert!(LlmError::Status(429).is_retriable());
        assert!(!LlmError::Status(404).is_retriable());
        assert!(!LlmError::Auth(401).is_retriable());
        assert!(!LlmError::Disabled.is_retriable());
        assert!(!LlmError::MalformedResponse.is_retriable());
    }

    #[tokio::test]
    async fn test_disabled_backend_fails_fast() {
        let backend = LlmBackend::Disabled;
        let err = backend.explain("anything").await.unwrap_err();
        assert!(matches!(err, LlmError::Disabled));
    }

    #[test]
    fn test_missing_key_downgrades_to_disabled() {
        let cfg = Config::default();
        assert!(cfg.gemini_api_key.is_none());
        let backend = LlmBackend::from_config(&cfg).unwrap();
        assert!(backend.is_disabled());
    }
}
