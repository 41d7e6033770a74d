//! Connectivity probes for configured providers.

use super::client::{EMPTY_RESPONSE, ProviderClient};
use super::provider::{ProviderDescriptor, ProviderSet};
use crate::error::ProviderErrorKind;
use crate::{MessagePayload, PromptMessage};

use serde::Serialize;

use std::fmt::Write as _;
use std::time::Instant;

/// Result of probing one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub tier: usize,
    pub tier_label: String,
    pub model: String,
    pub endpoint: String,
    pub supports_vision: bool,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub status: String,
    pub detail: Option<String>,
}

fn probe_payload() -> MessagePayload {
    let mut payload = MessagePayload::new(vec![PromptMessage::user("Reply with exactly: OK")]);
    payload.max_tokens = Some(16);
    payload.temperature = Some(0.0);
    payload
}

/// Send one tiny completion to a provider. Providers missing a required
/// key are reported without any network call.
pub async fn probe_provider(
    provider: &ProviderDescriptor,
    client: &dyn ProviderClient,
) -> ProbeReport {
    let mut report = ProbeReport {
        name: provider.name.clone(),
        tier: provider.tier,
        tier_label: provider.tier_label(),
        model: provider.model.clone(),
        endpoint: provider.endpoint.clone(),
        supports_vision: provider.supports_vision(),
        reachable: false,
        latency_ms: None,
        status: "no key".into(),
        detail: None,
    };

    if !provider.is_available() {
        report.detail = provider
            .key_env
            .as_ref()
            .map(|name| format!("set {name} to enable this provider"));
        return report;
    }

    let payload = probe_payload();
    let started = Instant::now();
    let outcome = tokio::time::timeout(provider.timeout, client.complete(provider, &payload)).await;
    report.latency_ms = Some(started.elapsed().as_millis() as u64);

    match outcome {
        Ok(Ok(_)) => {
            report.reachable = true;
            report.status = "ok".into();
        }
        // A reachable model that said nothing still answered the request.
        Ok(Err(error)) if error.message == EMPTY_RESPONSE => {
            report.reachable = true;
            report.status = "empty response".into();
        }
        Ok(Err(error)) => {
            report.status = match error.kind {
                ProviderErrorKind::RateLimit => "rate limited",
                ProviderErrorKind::Permanent => "auth/permanent",
                ProviderErrorKind::Transient => "error",
            }
            .into();
            // A rate limit proves the endpoint and key work.
            report.reachable = error.kind == ProviderErrorKind::RateLimit;
            report.detail = Some(error.message);
        }
        Err(_) => {
            report.status = "timeout".into();
            report.detail = Some(format!("no answer within {}s", provider.timeout.as_secs()));
        }
    }

    report
}

/// Probe every provider concurrently. Reports come back in tier order.
pub async fn probe_providers(
    providers: &ProviderSet,
    client: &dyn ProviderClient,
) -> Vec<ProbeReport> {
    let probes = providers
        .iter()
        .map(|provider| probe_provider(provider, client));
    futures::future::join_all(probes).await
}

/// Plain-text table for terminal output.
pub fn render_reports(reports: &[ProbeReport]) -> String {
    let mut output = String::new();
    if reports.is_empty() {
        output.push_str("no providers configured\n");
        return output;
    }
    for report in reports {
        let latency = report
            .latency_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".into());
        let _ = writeln!(
            output,
            "{:<10} {:<20} {:<32} {:<16} {:>8}",
            report.tier_label, report.name, report.model, report.status, latency
        );
        if let Some(detail) = &report.detail {
            let _ = writeln!(output, "           {detail}");
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderClient for ProbeClient {
        async fn complete(
            &self,
            provider: &ProviderDescriptor,
            _payload: &MessagePayload,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match provider.name.as_str() {
                "good" => Ok("OK".into()),
                "quiet" => Err(ProviderError::transient("quiet", EMPTY_RESPONSE)),
                "busy" => Err(ProviderError::rate_limit("busy", "HTTP 429")),
                _ => Err(ProviderError::permanent(provider.name.clone(), "HTTP 401: bad key")),
            }
        }
    }

    #[tokio::test]
    async fn probes_report_each_provider() {
        let mut locked = ProviderDescriptor::new("locked", "http://l", "m");
        locked.capabilities.requires_key = true;
        locked.key_env = Some("LOCKED_KEY".into());
        let set = ProviderSet::new(vec![
            ProviderDescriptor::new("good", "http://g", "m"),
            ProviderDescriptor::new("quiet", "http://q", "m"),
            ProviderDescriptor::new("busy", "http://b", "m"),
            ProviderDescriptor::new("denied", "http://d", "m"),
            locked,
        ]);
        let client = ProbeClient {
            calls: AtomicUsize::new(0),
        };

        let reports = probe_providers(&set, &client).await;
        let statuses: Vec<_> = reports.iter().map(|report| report.status.as_str()).collect();
        assert_eq!(
            statuses,
            ["ok", "empty response", "rate limited", "auth/permanent", "no key"]
        );
        assert!(reports[0].reachable && reports[1].reachable && reports[2].reachable);
        assert!(!reports[3].reachable);
        assert_eq!(reports[4].detail.as_deref(), Some("set LOCKED_KEY to enable this provider"));
        // The keyless provider never hit the network.
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);

        let rendered = render_reports(&reports);
        assert!(rendered.contains("primary"));
        assert!(rendered.contains("tier_4"));
    }
}
