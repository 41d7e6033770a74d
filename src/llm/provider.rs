//! Provider descriptors and the ordered provider snapshot.

use crate::config::{ProviderEntry, RuntimeSettings};

use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// API key resolved from the environment. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// What a provider can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_vision: bool,
    pub requires_key: bool,
}

/// One configured completion backend.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    pub model: String,
    /// Position in the chain. Lower tiers are tried first.
    pub tier: usize,
    pub key_env: Option<String>,
    pub credential: Option<ApiKey>,
    pub capabilities: Capabilities,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    pub extra_params: serde_json::Map<String, serde_json::Value>,
    pub exclude_params: Vec<String>,
}

impl ProviderDescriptor {
    /// Minimal descriptor with defaults, mostly for tests and probes.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            tier: 0,
            key_env: None,
            credential: None,
            capabilities: Capabilities {
                supports_vision: true,
                requires_key: false,
            },
            timeout: Duration::from_secs(60),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            extra_params: serde_json::Map::new(),
            exclude_params: Vec::new(),
        }
    }

    /// False when a key is required but none was resolved.
    pub fn is_available(&self) -> bool {
        !self.capabilities.requires_key || self.credential.is_some()
    }

    pub fn supports_vision(&self) -> bool {
        self.capabilities.supports_vision
    }

    pub fn tier_label(&self) -> String {
        tier_label(self.tier)
    }
}

/// Human-readable tier name: primary, secondary, fallback, then tier_N.
pub fn tier_label(tier: usize) -> String {
    match tier {
        0 => "primary".into(),
        1 => "secondary".into(),
        2 => "fallback".into(),
        n => format!("tier_{}", n + 1),
    }
}

/// Immutable, tier-ordered provider list.
#[derive(Debug, Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<ProviderDescriptor>>,
}

impl ProviderSet {
    /// Build from descriptors in the given order, renumbering tiers.
    pub fn new(providers: Vec<ProviderDescriptor>) -> Self {
        let providers = providers
            .into_iter()
            .enumerate()
            .map(|(tier, mut provider)| {
                provider.tier = tier;
                Arc::new(provider)
            })
            .collect();
        Self { providers }
    }

    /// Resolve config entries. Entries with an explicit `tier` are placed by
    /// it; the rest keep file order. `lookup` resolves credential variables.
    pub fn resolve(
        entries: &[ProviderEntry],
        settings: &RuntimeSettings,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut ordered: Vec<(usize, &ProviderEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                let usable = !entry.url.trim().is_empty() && !entry.model.trim().is_empty();
                if !usable {
                    tracing::warn!(provider = %entry.name, "provider has no url or model, skipping");
                }
                usable
            })
            .map(|(index, entry)| (entry.tier.unwrap_or(index), entry))
            .collect();
        ordered.sort_by_key(|(tier, _)| *tier);

        let descriptors = ordered
            .into_iter()
            .map(|(_, entry)| {
                let credential = entry
                    .key_env
                    .as_deref()
                    .and_then(&lookup)
                    .filter(|key| !key.trim().is_empty())
                    .map(ApiKey::new);
                if entry.requires_key && credential.is_none() {
                    tracing::warn!(
                        provider = %entry.name,
                        key_env = entry.key_env.as_deref().unwrap_or("<unset>"),
                        "provider requires an api key but none is set"
                    );
                }
                ProviderDescriptor {
                    name: entry.name.clone(),
                    endpoint: entry.url.trim_end_matches('/').to_string(),
                    model: entry.model.clone(),
                    tier: 0,
                    key_env: entry.key_env.clone(),
                    credential,
                    capabilities: Capabilities {
                        supports_vision: entry.supports_vision,
                        requires_key: entry.requires_key,
                    },
                    timeout: Duration::from_secs(
                        entry.timeout_secs.unwrap_or(settings.provider_timeout_secs),
                    ),
                    max_tokens: entry.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                    temperature: entry.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                    extra_params: entry.extra_params.clone(),
                    exclude_params: entry.exclude_params.clone(),
                }
            })
            .collect();

        Self::new(descriptors)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get(&self, tier: usize) -> Option<&Arc<ProviderDescriptor>> {
        self.providers.get(tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.iter()
    }

    /// Tier the chain starts from. An in-range override wins; otherwise the
    /// lowest available tier, or 0 when nothing is available.
    pub fn start_tier(&self, tier_override: Option<usize>) -> usize {
        match tier_override {
            Some(tier) if tier < self.providers.len() => tier,
            _ => self
                .providers
                .iter()
                .position(|provider| provider.is_available())
                .unwrap_or(0),
        }
    }

    /// Providers from `start` upward, in tier order.
    pub fn from_tier(&self, start: usize) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.iter().skip(start)
    }
}
