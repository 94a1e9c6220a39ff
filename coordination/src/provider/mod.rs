//! Text-completion provider abstraction
//!
//! Every LLM call the pipeline makes goes through [`CompletionProvider`]:
//! prompt in, text plus token usage out. Errors are classified so callers can
//! tell transient failures (retry with backoff) from fatal ones (abort).

pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openai::{OpenAiCompatProvider, ProviderConfig};

/// What a completion call is for. Drives cost estimation and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Planning,
    Drafting,
    Refining,
    Evaluation,
}

impl CallKind {
    pub fn all() -> &'static [CallKind] {
        &[
            CallKind::Planning,
            CallKind::Drafting,
            CallKind::Refining,
            CallKind::Evaluation,
        ]
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Drafting => write!(f, "drafting"),
            Self::Refining => write!(f, "refining"),
            Self::Evaluation => write!(f, "evaluation"),
        }
    }
}

/// A single completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub kind: CallKind,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(kind: CallKind, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        let temperature = match kind {
            CallKind::Evaluation => 0.0,
            CallKind::Planning => 0.4,
            CallKind::Drafting | CallKind::Refining => 0.8,
        };
        Self {
            kind,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A successful completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Errors from completion providers
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Provider credentials not configured: {0}")]
    MissingCredentials(String),

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Response parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Timeouts, rate limits, 5xx and connection failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. } | Self::Connection(_)
        )
    }

    /// Credential problems cannot be fixed by retrying or moving on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::MissingCredentials(_))
    }

    /// Provider-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trait for text-completion backends
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Run one completion
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

/// Shared reference to a provider
pub type SharedProvider = Arc<dyn CompletionProvider>;
