use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Settings;

const BASE_BACKOFF_MS: u64 = 2000;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("empty response")]
    Empty,
}

impl LlmError {
    fn retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Transport(_) => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Malformed(_) | LlmError::Empty => false,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(e.to_string())
        }
    }
}

/// A chat-style text completion service.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_retries: u32,
}

impl ChatClient {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let key = settings
            .llm_api_key
            .as_deref()
            .context("No API key: set JOBS_LLM_API_KEY or LLM_API_KEY")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key.trim()))
                .context("invalid API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.llm_timeout())
            .build()
            .context("failed to build completion HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.llm_api.trim_end_matches('/')),
            model: settings.llm_model.clone(),
            temperature: settings.llm_temperature,
            max_retries: settings.llm_max_retries,
        })
    }

    async fn send(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = resp.status();
        let text = resp.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }
        parse_response(&text)
    }
}

#[async_trait]
impl Completion for ChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        with_retries(self.max_retries, Duration::from_millis(BASE_BACKOFF_MS), move || {
            self.send(system, user)
        })
        .await
    }
}

fn parse_response(body: &str) -> Result<String, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| LlmError::Malformed(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(LlmError::Empty)
}

/// `base * 2^attempt`, capped at `MAX_BACKOFF`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

/// Run `op` up to `max_retries + 1` times, backing off exponentially after
/// retryable failures.
async fn with_retries<F, Fut, T>(max_retries: u32, base: Duration, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.retryable() && attempt < max_retries => {
                let wait = backoff(base, attempt);
                warn!(
                    "Completion failed ({}), retry {}/{} in {:?}",
                    e,
                    attempt + 1,
                    max_retries,
                    wait
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
