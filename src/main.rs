//! Pals CLI entry point.

use pals::api::{ApiState, start_http_server};
use pals::config::watcher::ConfigWatcher;
use pals::config::{Config, RuntimeConfig};
use pals::coordinator::GlobalConcurrencyCoordinator;
use pals::llm::diagnostics::{probe_providers, render_reports};
use pals::llm::{OpenAiCompatibleClient, ProviderChain, ProviderClient};
use pals::messaging::discord::DiscordAdapter;
use pals::messaging::{AdapterSink, MessagingManager};
use pals::orchestrator::{CoreDeps, HandleOutcome, InstanceProfile, Orchestrator};
use pals::sequencer::SequencedOutcome;
use pals::InstanceId;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pals")]
#[command(about = "Multi-character Discord chat bots sharing one LLM provider chain")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every configured bot (default)
    Run,
    /// Probe each configured provider and report connectivity
    Diagnose {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let _log_guard = pals::logging::init_tracing(cli.debug, config.logging.directory.as_deref());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Diagnose { json } => diagnose(config, json).await,
    }
}

async fn diagnose(config: Config, json: bool) -> anyhow::Result<()> {
    let providers = config.provider_set();
    let client = OpenAiCompatibleClient::new()?;
    let reports = probe_providers(&providers, &client).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print!("{}", render_reports(&reports));
    }

    if reports.iter().any(|report| report.reachable) {
        Ok(())
    } else {
        anyhow::bail!("no provider is reachable")
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        path = ?config.path,
        providers = config.providers.len(),
        bots = config.bots.len(),
        "starting pals"
    );

    let runtime = Arc::new(RuntimeConfig::from_config(&config));
    let client: Arc<dyn ProviderClient> = Arc::new(OpenAiCompatibleClient::new()?);
    let deps = CoreDeps {
        runtime: runtime.clone(),
        chain: Arc::new(ProviderChain::new(runtime.clone(), client)),
        coordinator: Arc::new(GlobalConcurrencyCoordinator::new(runtime.clone())),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let _watcher = match ConfigWatcher::spawn(runtime.clone(), shutdown_rx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            tracing::warn!(%error, "config hot reload disabled");
            None
        }
    };

    let mut manager = MessagingManager::new();
    let mut orchestrators: HashMap<InstanceId, Arc<Orchestrator>> = HashMap::new();
    for bot in &config.bots {
        let Ok(token) = std::env::var(&bot.token_env) else {
            tracing::warn!(bot = %bot.name, token_env = %bot.token_env, "bot token not set, skipping");
            continue;
        };
        let id: InstanceId = Arc::from(bot.name.as_str());
        let adapter = manager.register(id.clone(), DiscordAdapter::new(bot.name.clone(), token));

        let mut profile = InstanceProfile::new(id.clone(), bot.name.clone());
        profile.nicknames = bot.nicknames.clone();
        profile.system_prompt = bot.system_prompt.clone();
        profile.tier_override = bot.provider_tier;

        let orchestrator = Orchestrator::new(profile, deps.clone(), Arc::new(AdapterSink(adapter)));
        orchestrators.insert(id, Arc::new(orchestrator));
    }

    if orchestrators.is_empty() {
        anyhow::bail!("no bot has a token set; nothing to run");
    }

    let _api = if config.api.enabled {
        let bind: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
            .parse()
            .with_context(|| format!("invalid api bind address {}:{}", config.api.bind, config.api.port))?;
        let state = orchestrators.values().cloned().fold(
            ApiState::new(runtime.clone(), deps.chain.clone(), deps.coordinator.clone()),
            ApiState::with_orchestrator,
        );
        Some(start_http_server(bind, Arc::new(state), shutdown_rx.clone()).await?)
    } else {
        None
    };

    let mut inbound = manager.start_all().await;
    for (instance, health) in manager.health().await {
        if let Err(error) = health {
            tracing::warn!(instance = %instance, %error, "adapter unhealthy after start");
        }
    }
    tracing::info!(instances = orchestrators.len(), "pals running");

    loop {
        tokio::select! {
            received = inbound.recv() => {
                let Some((instance, event)) = received else {
                    tracing::warn!("all inbound streams closed");
                    break;
                };
                let Some(orchestrator) = orchestrators.get(&instance) else {
                    continue;
                };
                if let HandleOutcome::Enqueued(ticket) = orchestrator.handle(event).await {
                    tokio::spawn(async move {
                        let key = ticket.key().clone();
                        match ticket.wait().await {
                            SequencedOutcome::Completed(Err(error)) => {
                                tracing::error!(instance = %instance, %key, %error, "request failed");
                            }
                            SequencedOutcome::Discarded => {
                                tracing::debug!(instance = %instance, %key, "request discarded after clear");
                            }
                            SequencedOutcome::Completed(Ok(_)) | SequencedOutcome::Cancelled => {}
                        }
                    });
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    deps.coordinator.close();
    manager.shutdown_all().await;
    tracing::info!("pals stopped");
    Ok(())
}
