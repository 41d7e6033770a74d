//! Failure classification and retry backoff for provider attempts.

use crate::config::RuntimeSettings;
use crate::error::ProviderErrorKind;

use rand::Rng;

use std::time::Duration;

/// Classify an HTTP status from a provider.
///
/// 429 is the only status retried on the same provider. Request and auth
/// errors will not succeed on retry, so they advance the chain as permanent.
/// Everything else advances as transient.
pub fn classify_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimit,
        408 => ProviderErrorKind::Transient,
        400..=499 => ProviderErrorKind::Permanent,
        _ => ProviderErrorKind::Transient,
    }
}

/// Refine a status classification with the provider's error text. Some
/// providers report an unknown model or a bad key with a 5xx or a 200 body.
pub fn classify_error(status: Option<u16>, message: &str) -> ProviderErrorKind {
    if is_rate_limit_error(message) {
        return ProviderErrorKind::RateLimit;
    }
    if is_permanent_error(message) {
        return ProviderErrorKind::Permanent;
    }
    status
        .map(classify_status)
        .unwrap_or(ProviderErrorKind::Transient)
}

/// Whether an error message indicates rate limiting.
pub fn is_rate_limit_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests")
}

/// Whether an error message indicates a failure that retries won't fix.
pub fn is_permanent_error(error_message: &str) -> bool {
    let lower = error_message.to_lowercase();
    lower.contains("invalid api key")
        || lower.contains("incorrect api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("permission denied")
        || (lower.contains("model") && (lower.contains("not found") || lower.contains("does not exist")))
}

/// Per-provider retry limits, read from the current settings snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts against one provider, first try included.
    pub retry_cap: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            retry_cap: settings.provider_retry_cap.max(1),
            base_delay: Duration::from_millis(settings.provider_backoff_base_ms),
            max_delay: Duration::from_millis(settings.provider_backoff_max_ms),
        }
    }

    /// Delay before the next attempt after `attempt` failed attempts.
    /// Exponential from the base, plus jitter below one base unit, capped.
    pub fn backoff_delay(&self, attempt: usize, rng: &mut impl Rng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential = base_ms.saturating_mul(1u64 << exponent);
        let jitter = if base_ms == 0 {
            0
        } else {
            rng.random_range(0..base_ms)
        };
        let delay = Duration::from_millis(exponential.saturating_add(jitter));
        delay.min(self.max_delay)
    }
}
