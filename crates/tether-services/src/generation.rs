//! OpenAI-compatible chat-completions backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use tether_core::config::GenerationConfig;
use tether_core::Payload;

use crate::capability::{BackendError, Generation, TextGenerator};

/// Probed at the server root before falling back to `{base}/models`.
const HEALTH_ENDPOINTS: [&str; 4] = ["/health", "/healthz", "/live", "/ready"];
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// Error bodies are cut to this many characters.
const MAX_ERROR_BODY: usize = 500;

pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    default_max_tokens: u32,
    default_temperature: f64,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, BackendError> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            default_max_tokens: config.default_max_tokens,
            default_temperature: config.default_temperature,
            timeout,
        })
    }

    fn request_body(&self, prompt: &str, params: Option<&Payload>) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert(
            "messages".into(),
            json!([{"role": "user", "content": prompt}]),
        );
        body.insert("max_tokens".into(), Value::from(self.default_max_tokens));
        body.insert("temperature".into(), Value::from(self.default_temperature));
        if let Some(params) = params {
            for (key, value) in params {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }

    fn map_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout)
        } else {
            BackendError::Transport(e.to_string())
        }
    }

    async fn probe(&self, url: &str) -> Option<reqwest::Response> {
        match self.client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => Some(resp),
            Ok(resp) => {
                tracing::trace!(url, status = resp.status().as_u16(), "health probe rejected");
                None
            }
            Err(e) => {
                tracing::trace!(url, error = %e, "health probe failed");
                None
            }
        }
    }
}

/// `http://host:8000/v1` → `http://host:8000`.
fn server_root(base_url: &str) -> &str {
    base_url.strip_suffix("/v1").unwrap_or(base_url)
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str, params: Option<&Payload>) -> Result<Generation, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(prompt, params);
        tracing::debug!(%url, prompt_len = prompt.len(), "generation request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        let raw: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Decode(e.to_string())
            }
        })?;
        let text = raw
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Decode("response has no choices[0].message.content".into()))?
            .trim()
            .to_string();

        Ok(Generation {
            text,
            raw_response: raw,
        })
    }

    async fn health(&self) -> bool {
        let root = server_root(&self.base_url);
        for endpoint in HEALTH_ENDPOINTS {
            if self.probe(&format!("{root}{endpoint}")).await.is_some() {
                return true;
            }
        }

        let Some(resp) = self.probe(&format!("{}/models", self.base_url)).await else {
            return false;
        };
        match resp.json::<Value>().await {
            Ok(v) => v
                .get("data")
                .and_then(Value::as_array)
                .is_some_and(|models| !models.is_empty()),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}
