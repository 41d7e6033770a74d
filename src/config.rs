//! Configuration loading, validation, and hot-swappable runtime snapshots.

pub mod watcher;

use crate::error::{ConfigError, Result};
use crate::llm::provider::ProviderSet;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::Deserialize;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default config file name, looked up in the working directory first.
pub const CONFIG_FILE_NAME: &str = "pals.toml";

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live-adjustable settings. Re-read on reload.
    pub runtime: RuntimeSettings,

    /// Ordered provider list. Re-read on reload.
    pub providers: Vec<ProviderEntry>,

    /// Bot instances. Read once at startup.
    pub bots: Vec<BotEntry>,

    pub api: ApiConfig,

    pub logging: LoggingConfig,

    /// Path the config was loaded from. Not part of the file.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

/// Settings that take effect on the next event without a restart.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Maximum provider invocations in flight across all bot instances.
    pub concurrency_limit: usize,
    /// Delay per responder position when several instances answer one trigger.
    pub stagger_seconds: f64,
    /// Upper bound on the stagger delay.
    pub stagger_max_seconds: f64,

    pub bot_falloff_enabled: bool,
    pub bot_falloff_base_chance: f64,
    pub bot_falloff_decay_rate: f64,
    pub bot_falloff_min_chance: f64,
    pub bot_falloff_hard_limit: u32,
    /// After answering a bot, ignore autonomous bot triggers for this long.
    pub bot_chain_cooldown_seconds: u64,
    /// Never chime in autonomously on bot-authored messages.
    pub bot_interactions_paused: bool,
    /// Drop every request at dispatch time.
    pub global_paused: bool,
    /// Chance that a name mention turns into a candidate response.
    pub name_trigger_chance: f64,
    /// Channels where autonomous chime-ins are enabled.
    pub autonomous_channels: Vec<AutonomousChannel>,

    /// Default per-attempt timeout for providers without their own.
    pub provider_timeout_secs: u64,
    /// Total attempts against a rate-limited provider before moving on.
    pub provider_retry_cap: usize,
    pub provider_backoff_base_ms: u64,
    pub provider_backoff_max_ms: u64,

    pub queue_max_depth: usize,
    pub queue_max_pending_per_author: usize,
    pub queue_duplicate_window_ms: u64,
    pub queue_dispatch_delay_ms: u64,
    pub queue_idle_timeout_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            stagger_seconds: 1.5,
            stagger_max_seconds: 5.0,
            bot_falloff_enabled: true,
            bot_falloff_base_chance: 0.8,
            bot_falloff_decay_rate: 0.15,
            bot_falloff_min_chance: 0.05,
            bot_falloff_hard_limit: 10,
            bot_chain_cooldown_seconds: 60,
            bot_interactions_paused: false,
            global_paused: false,
            name_trigger_chance: 1.0,
            autonomous_channels: Vec::new(),
            provider_timeout_secs: 60,
            provider_retry_cap: 3,
            provider_backoff_base_ms: 1000,
            provider_backoff_max_ms: 8000,
            queue_max_depth: 10,
            queue_max_pending_per_author: 2,
            queue_duplicate_window_ms: 3000,
            queue_dispatch_delay_ms: 500,
            queue_idle_timeout_secs: 300,
        }
    }
}

impl RuntimeSettings {
    /// Autonomous configuration for a channel, if enabled there.
    pub fn autonomous_channel(&self, channel_id: u64) -> Option<&AutonomousChannel> {
        self.autonomous_channels
            .iter()
            .find(|channel| channel.channel_id == channel_id)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        let probabilities = [
            ("bot_falloff_base_chance", self.bot_falloff_base_chance),
            ("bot_falloff_min_chance", self.bot_falloff_min_chance),
            ("name_trigger_chance", self.name_trigger_chance),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if !(self.bot_falloff_decay_rate >= 0.0) {
            return Err(ConfigError::Invalid(
                "bot_falloff_decay_rate must not be negative".into(),
            ));
        }
        if self.bot_falloff_hard_limit == 0 {
            return Err(ConfigError::Invalid(
                "bot_falloff_hard_limit must be at least 1".into(),
            ));
        }
        if self.provider_retry_cap == 0 {
            return Err(ConfigError::Invalid(
                "provider_retry_cap must be at least 1".into(),
            ));
        }
        if !(self.stagger_seconds >= 0.0) || !(self.stagger_max_seconds >= 0.0) {
            return Err(ConfigError::Invalid(
                "stagger delays must not be negative".into(),
            ));
        }
        for channel in &self.autonomous_channels {
            if !(0.0..=1.0).contains(&channel.chance) {
                return Err(ConfigError::Invalid(format!(
                    "autonomous chance for channel {} must be between 0 and 1",
                    channel.channel_id
                )));
            }
        }
        Ok(())
    }
}

/// A channel with autonomous responses enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct AutonomousChannel {
    pub channel_id: u64,
    /// Chance per observed message that the bot considers chiming in.
    #[serde(default = "default_autonomous_chance")]
    pub chance: f64,
    /// Minimum time between two autonomous responses in this channel.
    #[serde(default = "default_autonomous_cooldown")]
    pub cooldown_secs: u64,
}

fn default_autonomous_chance() -> f64 {
    0.1
}

fn default_autonomous_cooldown() -> u64 {
    120
}

/// One `[[providers]]` entry as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    pub url: String,
    pub model: String,
    /// Explicit tier ordinal. Defaults to the entry's position.
    #[serde(default)]
    pub tier: Option<usize>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub key_env: Option<String>,
    #[serde(default = "default_true")]
    pub requires_key: bool,
    #[serde(default = "default_true")]
    pub supports_vision: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Merged into the request body (nested tables merge deeply).
    #[serde(default)]
    pub extra_params: serde_json::Map<String, serde_json::Value>,
    /// Top-level request keys removed after merging.
    #[serde(default)]
    pub exclude_params: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// One `[[bots]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BotEntry {
    pub name: String,
    /// Environment variable holding the Discord bot token.
    pub token_env: String,
    /// Extra names the bot answers to in autonomous channels.
    #[serde(default)]
    pub nicknames: Vec<String>,
    /// Character prompt used as the system message.
    #[serde(default)]
    pub system_prompt: String,
    /// Provider index this character starts its chain at.
    #[serde(default)]
    pub provider_tier: Option<usize>,
}

/// HTTP status/diagnostics server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".into(),
            port: 5000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files. Terminal only when unset.
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Resolve the config path: explicit flag, `PALS_CONFIG`, `./pals.toml`,
    /// then the platform config directory.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var("PALS_CONFIG") {
            return PathBuf::from(path);
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }
        dirs::config_dir()
            .map(|dir| dir.join("pals").join(CONFIG_FILE_NAME))
            .unwrap_or(local)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        let mut config = Self::parse(&content).map_err(|error| match error {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn parse(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|error| ConfigError::Parse {
            path: "<inline>".into(),
            message: error.to_string(),
        })?;
        config.runtime.validate()?;

        for (index, bot) in config.bots.iter().enumerate() {
            if bot.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("bot {} has no name", index + 1)));
            }
        }

        Ok(config)
    }

    /// Build the provider snapshot, resolving credentials from the environment.
    pub fn provider_set(&self) -> ProviderSet {
        ProviderSet::resolve(&self.providers, &self.runtime, |name| std::env::var(name).ok())
    }
}

/// Settings and providers that belong together.
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub settings: Arc<RuntimeSettings>,
    pub providers: Arc<ProviderSet>,
}

/// Live configuration shared by every component.
///
/// Settings and providers live in one immutable snapshot replaced as a
/// whole, so an in-flight operation that loaded it keeps a consistent view.
pub struct RuntimeConfig {
    path: Option<PathBuf>,
    current: ArcSwap<RuntimeSnapshot>,
}

impl RuntimeConfig {
    pub fn new(settings: RuntimeSettings, providers: ProviderSet) -> Self {
        Self {
            path: None,
            current: ArcSwap::from_pointee(RuntimeSnapshot {
                settings: Arc::new(settings),
                providers: Arc::new(providers),
            }),
        }
    }

    /// Build from a loaded config, remembering its path for reloads.
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.path.clone(),
            ..Self::new(config.runtime.clone(), config.provider_set())
        }
    }

    /// Settings and providers from the same swap.
    pub fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        self.current.load_full()
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<RuntimeSettings> {
        self.current.load().settings.clone()
    }

    /// Current provider snapshot.
    pub fn providers(&self) -> Arc<ProviderSet> {
        self.current.load().providers.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn replace_settings(&self, settings: RuntimeSettings) {
        let settings = Arc::new(settings);
        self.current.rcu(|current| RuntimeSnapshot {
            settings: settings.clone(),
            providers: current.providers.clone(),
        });
    }

    pub fn replace_providers(&self, providers: ProviderSet) {
        let providers = Arc::new(providers);
        self.current.rcu(|current| RuntimeSnapshot {
            settings: current.settings.clone(),
            providers: providers.clone(),
        });
    }

    /// Re-read the config file and swap in new snapshots. On error the
    /// previous snapshots stay active.
    pub fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .context("runtime config was not loaded from a file")?;
        let config = Config::load(path)?;
        let providers = config.provider_set();

        tracing::info!(
            path = %path.display(),
            providers = providers.len(),
            concurrency_limit = config.runtime.concurrency_limit,
            "runtime config reloaded"
        );

        self.current.store(Arc::new(RuntimeSnapshot {
            settings: Arc::new(config.runtime),
            providers: Arc::new(providers),
        }));
        Ok(())
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
