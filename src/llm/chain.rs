//! Tiered provider fallback with per-provider rate-limit retries.

use super::client::{EMPTY_RESPONSE, ProviderClient};
use super::provider::{ProviderDescriptor, tier_label};
use super::routing::RetryPolicy;
use super::vision;
use crate::config::RuntimeConfig;
use crate::error::{ChainExhaustedError, ProviderError, ProviderErrorKind, ProviderFailure};
use crate::{GenerationResult, MessagePayload};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Last observed outcome for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Unknown,
    Ok,
    RateLimited,
    Timeout,
    Error,
    Permanent,
    EmptyResponse,
    NoKey,
}

impl ProviderStatus {
    fn from_error(error: &ProviderError) -> Self {
        match error.kind {
            ProviderErrorKind::RateLimit => ProviderStatus::RateLimited,
            ProviderErrorKind::Permanent => ProviderStatus::Permanent,
            ProviderErrorKind::Transient if error.message == EMPTY_RESPONSE => {
                ProviderStatus::EmptyResponse
            }
            ProviderErrorKind::Transient if error.message.starts_with("timed out") => {
                ProviderStatus::Timeout
            }
            ProviderErrorKind::Transient => ProviderStatus::Error,
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProviderStatus::Unknown => "unknown",
            ProviderStatus::Ok => "ok",
            ProviderStatus::RateLimited => "rate limited",
            ProviderStatus::Timeout => "timeout",
            ProviderStatus::Error => "error",
            ProviderStatus::Permanent => "auth/permanent",
            ProviderStatus::EmptyResponse => "empty response",
            ProviderStatus::NoKey => "no key",
        };
        f.write_str(label)
    }
}

/// One row of [`ProviderChain::status_snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusEntry {
    pub name: String,
    pub model: String,
    pub tier: usize,
    pub tier_label: String,
    pub status: ProviderStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Generates a completion by walking the provider list in tier order.
///
/// Rate limits are retried on the same provider with backoff up to the
/// retry cap. Transient and permanent failures advance to the next tier
/// immediately. Providers are never revisited within one call.
pub struct ProviderChain {
    runtime: Arc<RuntimeConfig>,
    client: Arc<dyn ProviderClient>,
    status: RwLock<HashMap<String, (ProviderStatus, DateTime<Utc>)>>,
}

impl ProviderChain {
    pub fn new(runtime: Arc<RuntimeConfig>, client: Arc<dyn ProviderClient>) -> Self {
        Self {
            runtime,
            client,
            status: RwLock::new(HashMap::new()),
        }
    }

    /// Generate a completion for `payload`, starting at `tier_override` when
    /// it names a configured tier.
    pub async fn generate(
        &self,
        payload: &MessagePayload,
        tier_override: Option<usize>,
    ) -> Result<GenerationResult, ChainExhaustedError> {
        // One snapshot per call: a reload mid-call doesn't reorder the walk
        // or pair new providers with an old retry policy.
        let snapshot = self.runtime.snapshot();
        let providers = &snapshot.providers;
        let policy = RetryPolicy::from_settings(&snapshot.settings);
        let start = providers.start_tier(tier_override);
        let started = Instant::now();

        let mut failures = Vec::new();
        let mut total_attempts = 0;

        for provider in providers.from_tier(start) {
            if !provider.is_available() {
                tracing::debug!(provider = %provider.name, "skipping provider without api key");
                self.set_status(&provider.name, ProviderStatus::NoKey);
                failures.push(ProviderFailure {
                    provider: provider.name.clone(),
                    tier: provider.tier,
                    attempts: 0,
                    kind: ProviderErrorKind::Permanent,
                    message: match &provider.key_env {
                        Some(key_env) => format!("no api key ({key_env} is unset)"),
                        None => "no api key".into(),
                    },
                });
                continue;
            }

            let prepared = vision::prepare_for(provider, payload);
            match self.attempt_with_retries(provider, &prepared, &policy).await {
                Ok((text, attempts)) => {
                    total_attempts += attempts;
                    self.set_status(&provider.name, ProviderStatus::Ok);
                    if provider.tier != start {
                        tracing::info!(
                            provider = %provider.name,
                            tier = %provider.tier_label(),
                            failed = failures.len(),
                            "fallback provider succeeded"
                        );
                    }
                    return Ok(GenerationResult {
                        text,
                        provider: provider.name.clone(),
                        model: provider.model.clone(),
                        tier: provider.tier,
                        attempts: total_attempts,
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err((error, attempts)) => {
                    total_attempts += attempts;
                    self.set_status(&provider.name, ProviderStatus::from_error(&error));
                    failures.push(ProviderFailure {
                        provider: provider.name.clone(),
                        tier: provider.tier,
                        attempts,
                        kind: error.kind,
                        message: error.message,
                    });
                }
            }
        }

        let error = ChainExhaustedError { failures };
        tracing::error!(attempts = total_attempts, %error, "provider chain exhausted");
        #[cfg(feature = "metrics")]
        crate::telemetry::Metrics::global()
            .chain_exhausted_total
            .inc();
        Err(error)
    }

    /// Attempt one provider, retrying rate limits with exponential backoff.
    /// Returns the attempt count alongside the outcome.
    async fn attempt_with_retries(
        &self,
        provider: &ProviderDescriptor,
        payload: &MessagePayload,
        policy: &RetryPolicy,
    ) -> Result<(String, usize), (ProviderError, usize)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                provider.timeout,
                self.client.complete(provider, payload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::transient(
                    &provider.name,
                    format!("timed out after {}s", provider.timeout.as_secs()),
                )),
            };

            #[cfg(feature = "metrics")]
            {
                let metrics = crate::telemetry::Metrics::global();
                let outcome_label = match &outcome {
                    Ok(_) => "ok".to_string(),
                    Err(error) => error.kind.to_string(),
                };
                metrics
                    .provider_attempts_total
                    .with_label_values(&[provider.name.as_str(), outcome_label.as_str()])
                    .inc();
                metrics
                    .provider_request_duration_seconds
                    .with_label_values(&[provider.name.as_str()])
                    .observe(started.elapsed().as_secs_f64());
            }

            let error = match outcome {
                Ok(text) => {
                    tracing::debug!(
                        provider = %provider.name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "provider completed"
                    );
                    return Ok((text, attempt));
                }
                Err(error) => error,
            };

            match error.kind {
                ProviderErrorKind::RateLimit if attempt < policy.retry_cap => {
                    let delay = policy.backoff_delay(attempt, &mut rand::rng());
                    tracing::warn!(
                        provider = %provider.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                ProviderErrorKind::RateLimit => {
                    tracing::warn!(
                        provider = %provider.name,
                        attempts = attempt,
                        "rate limit retries exhausted, falling back"
                    );
                    return Err((error, attempt));
                }
                ProviderErrorKind::Transient => {
                    tracing::warn!(provider = %provider.name, %error, "provider failed, falling back");
                    return Err((error, attempt));
                }
                ProviderErrorKind::Permanent => {
                    tracing::error!(provider = %provider.name, %error, "provider rejected request, falling back");
                    return Err((error, attempt));
                }
            }
        }
    }

    fn set_status(&self, provider: &str, status: ProviderStatus) {
        self.status
            .write()
            .insert(provider.to_string(), (status, Utc::now()));
    }

    /// Last known status of every configured provider, in tier order.
    pub fn status_snapshot(&self) -> Vec<ProviderStatusEntry> {
        let providers = self.runtime.providers();
        let status = self.status.read();
        providers
            .iter()
            .map(|provider| {
                let (current, updated_at) = match status.get(&provider.name) {
                    Some((current, at)) => (*current, Some(*at)),
                    None if !provider.is_available() => (ProviderStatus::NoKey, None),
                    None => (ProviderStatus::Unknown, None),
                };
                ProviderStatusEntry {
                    name: provider.name.clone(),
                    model: provider.model.clone(),
                    tier: provider.tier,
                    tier_label: tier_label(provider.tier),
                    status: current,
                    updated_at,
                }
            })
            .collect()
    }

    pub fn client(&self) -> &Arc<dyn ProviderClient> {
        &self.client
    }
}
