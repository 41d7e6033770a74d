//! Top-level error types for Pals.

use crate::ContextKey;
use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ChainExhausted(#[from] ChainExhaustedError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure classes of a single provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Timeout, connection failure, 5xx, empty completion. Advance immediately.
    Transient,
    /// HTTP 429. Retry the same provider with backoff, then advance.
    RateLimit,
    /// Auth failure, unknown model, malformed request. Advance immediately.
    Permanent,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::RateLimit => write!(f, "rate_limit"),
            ProviderErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error from one attempt against one provider. Never leaves the chain on
/// its own; the chain aggregates them into [`ChainExhaustedError`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Transient, message)
    }

    pub fn rate_limit(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::RateLimit, message)
    }

    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Permanent, message)
    }
}

/// Last failure recorded for one provider during a chain run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub tier: usize,
    /// Zero when the provider was skipped for a missing api key.
    pub attempts: usize,
    pub kind: ProviderErrorKind,
    pub message: String,
}

/// Every provider in the chain failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("all providers failed ({})", summarize_failures(.failures))]
pub struct ChainExhaustedError {
    /// Last error per provider, in attempt order. Empty when no provider
    /// was usable at all.
    pub failures: Vec<ProviderFailure>,
}

fn summarize_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no usable providers configured".into();
    }
    failures
        .iter()
        .map(|failure| match failure.attempts {
            0 => format!("{}: no key", failure.provider),
            _ => format!("{}: {}", failure.provider, failure.kind),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a request was turned away at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationReason {
    /// The key's queue is at its configured depth.
    QueueFull,
    /// The author already has the maximum number of waiting requests.
    AuthorLimit,
    /// Same author and text as a request still waiting.
    Duplicate,
    /// The sequencer is shutting down.
    Closed,
}

impl std::fmt::Display for SaturationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaturationReason::QueueFull => write!(f, "queue full"),
            SaturationReason::AuthorLimit => write!(f, "too many pending requests from author"),
            SaturationReason::Duplicate => write!(f, "duplicate request"),
            SaturationReason::Closed => write!(f, "sequencer closed"),
        }
    }
}

/// Sequencer admission errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("request for {key} rejected: {reason}")]
    Saturated {
        key: ContextKey,
        reason: SaturationReason,
    },
}

impl QueueError {
    pub fn reason(&self) -> SaturationReason {
        match self {
            QueueError::Saturated { reason, .. } => *reason,
        }
    }
}

/// Messaging adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("adapter {0} not found")]
    AdapterNotFound(String),

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_exhausted_message_lists_each_provider() {
        let error = ChainExhaustedError {
            failures: vec![
                ProviderFailure {
                    provider: "a".into(),
                    tier: 0,
                    attempts: 3,
                    kind: ProviderErrorKind::RateLimit,
                    message: "429".into(),
                },
                ProviderFailure {
                    provider: "b".into(),
                    tier: 1,
                    attempts: 1,
                    kind: ProviderErrorKind::Permanent,
                    message: "401".into(),
                },
            ],
        };
        assert_eq!(
            error.to_string(),
            "all providers failed (a: rate_limit, b: permanent)"
        );
    }

    #[test]
    fn chain_exhausted_without_providers() {
        let error = ChainExhaustedError { failures: vec![] };
        assert!(error.to_string().contains("no usable providers"));
    }
}
