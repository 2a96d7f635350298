//! Upstream completion provider client
//!
//! Thin client over OpenAI-compatible chat completion APIs. The proxy
//! supports two upstreams (Venice and OpenAI) selected by configuration;
//! both speak the same wire format, so one client covers both.
//!
//! Transient upstream failures (5xx, transport) are retried with
//! exponential backoff before being surfaced; 4xx responses are not
//! retried since the request will not get better.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BASE_DELAY_MS: u64 = 200;
const MAX_RETRIES: usize = 2;

const VENICE_BASE_URL: &str = "https://api.venice.ai/api/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const DEFAULT_VENICE_MODEL: &str = "llama-3.3-70b";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// Which upstream the proxy forwards completions to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Venice,
    OpenAi,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Venice => "venice",
            Provider::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the upstream completion call
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Completion provider not configured: {0}")]
    Configuration(String),

    #[error("{provider} returned status {status}")]
    Upstream { provider: Provider, status: u16 },

    #[error("{provider} returned an unusable response: {details}")]
    InvalidResponse { provider: Provider, details: String },

    #[error("Transport error talking to provider: {0}")]
    Transport(#[from] reqwest::Error),
}

impl CompletionError {
    /// Transient failures worth retrying. Client errors are final.
    fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Upstream { status, .. } => *status >= 500,
            CompletionError::Transport(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: Option<i64>,
}

/// Result of a successful completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// Total tokens billed by the upstream; zero when the upstream omits
    /// usage data rather than failing the request.
    pub tokens_used: i64,
    pub model: String,
    pub provider: Provider,
}

/// Client for an OpenAI-compatible completion API
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    provider: Provider,
    base_url: String,
    api_key: String,
    model: String,
}

// Manual impl so the API key never reaches logs.
impl std::fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl CompletionClient {
    /// Build the client from environment variables.
    ///
    /// `AI_PROVIDER` selects the upstream (`venice` is the default); the
    /// matching `*_API_KEY` must be set.
    pub fn from_env() -> Result<Self, CompletionError> {
        let provider = match std::env::var("AI_PROVIDER").as_deref() {
            Ok("openai") => Provider::OpenAi,
            Ok("venice") | Err(_) => Provider::Venice,
            Ok(other) => {
                return Err(CompletionError::Configuration(format!(
                    "Unknown AI_PROVIDER '{}'",
                    other
                )))
            }
        };

        let (key_var, model_var, base_url, default_model) = match provider {
            Provider::Venice => (
                "VENICE_API_KEY",
                "VENICE_MODEL",
                VENICE_BASE_URL,
                DEFAULT_VENICE_MODEL,
            ),
            Provider::OpenAi => (
                "OPENAI_API_KEY",
                "OPENAI_MODEL",
                OPENAI_BASE_URL,
                DEFAULT_OPENAI_MODEL,
            ),
        };

        let api_key = std::env::var(key_var)
            .map_err(|_| CompletionError::Configuration(format!("{} must be set", key_var)))?;
        let model = std::env::var(model_var).unwrap_or_else(|_| default_model.to_string());

        Self::new(provider, base_url.to_string(), api_key, model)
    }

    pub fn new(
        provider: Provider,
        base_url: String,
        api_key: String,
        model: String,
    ) -> Result<Self, CompletionError> {
        // A client without the timeout would let one slow upstream call pin
        // a request indefinitely, so a builder failure is fatal.
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                CompletionError::Configuration(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            http,
            provider,
            base_url,
            api_key,
            model,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one chat completion for a user prompt.
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: Option<i64>,
    ) -> Result<Completion, CompletionError> {
        let strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .map(jitter)
            .take(MAX_RETRIES);

        RetryIf::spawn(
            strategy,
            || self.attempt(prompt, max_tokens),
            CompletionError::is_retryable,
        )
        .await
    }

    async fn attempt(
        &self,
        prompt: &str,
        max_tokens: Option<i64>,
    ) -> Result<Completion, CompletionError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
            max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                provider = %self.provider,
                status = status.as_u16(),
                "Completion request failed"
            );
            return Err(CompletionError::Upstream {
                provider: self.provider,
                status: status.as_u16(),
            });
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            CompletionError::InvalidResponse {
                provider: self.provider,
                details: e.to_string(),
            }
        })?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| CompletionError::InvalidResponse {
                provider: self.provider,
                details: "response carried no message content".to_string(),
            })?;

        // Missing usage data must not fail the request; the charge is 0.
        let tokens_used = body
            .usage
            .and_then(|u| u.total_tokens)
            .unwrap_or_default();

        Ok(Completion {
            content,
            tokens_used,
            model: self.model.clone(),
            provider: self.provider,
        })
    }
}
