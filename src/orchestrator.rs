//! Per-instance glue between inbound events and the shared core.
//!
//! Classifies each observed message, feeds the bot-exchange throttle, gates
//! autonomous candidates, and queues generation requests on the sequencer.
//! The processor behind the sequencer acquires a global slot, runs the
//! provider chain, and sends the reply in order.

use crate::config::RuntimeConfig;
use crate::coordinator::GlobalConcurrencyCoordinator;
use crate::error::{ChainExhaustedError, QueueError, Result};
use crate::llm::ProviderChain;
use crate::sequencer::{InboundEventSequencer, RequestProcessor, SequencerConfig, Ticket};
use crate::throttle::{BotExchangeThrottle, Candidate, SuppressReason, ThrottleDecision};
use crate::{
    AuthorKind, ContextKey, GenerationRequest, GenerationResult, InboundEvent, InstanceId,
    MessagePayload, OutboundReply, PromptMessage, TriggerKind,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// User-visible notice when every provider failed on a direct trigger.
pub const ALL_PROVIDERS_FAILED: &str = "All providers failed to respond. Please try again in a moment.";

/// Where an instance's replies go.
#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn send(&self, key: &ContextKey, reply: OutboundReply) -> Result<()>;
}

/// Identity and defaults of one bot character.
#[derive(Debug, Clone)]
pub struct InstanceProfile {
    pub id: InstanceId,
    pub display_name: String,
    /// Extra names that count as a name trigger. Names shorter than two
    /// characters are ignored.
    pub nicknames: Vec<String>,
    pub system_prompt: String,
    pub tier_override: Option<usize>,
}

impl InstanceProfile {
    pub fn new(id: impl Into<InstanceId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            nicknames: Vec::new(),
            system_prompt: String::new(),
            tier_override: None,
        }
    }

    /// Whether `text` names this character as a whole word.
    pub fn is_named_in(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        std::iter::once(&self.display_name)
            .chain(self.nicknames.iter())
            .map(|name| name.trim().to_lowercase())
            .filter(|name| name.chars().count() >= 2)
            .any(|name| contains_word(&lower, &name))
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Process-wide components shared by every instance.
#[derive(Clone)]
pub struct CoreDeps {
    pub runtime: Arc<RuntimeConfig>,
    pub chain: Arc<ProviderChain>,
    pub coordinator: Arc<GlobalConcurrencyCoordinator>,
}

/// What the processor produced for one request.
#[derive(Debug)]
pub enum ProcessedReply {
    Generated(GenerationResult),
    Failed(ChainExhaustedError),
    /// Dropped because processing is globally paused.
    Skipped,
}

/// Result of handing an event to [`Orchestrator::handle`].
#[derive(Debug)]
pub enum HandleOutcome {
    Enqueued(Ticket<ProcessedReply>),
    Suppressed(SuppressReason),
    Rejected(QueueError),
    /// Not a trigger for this instance.
    Ignored,
}

struct GenerationProcessor {
    profile: InstanceProfile,
    deps: CoreDeps,
    throttle: Arc<BotExchangeThrottle>,
    sink: Arc<dyn ReplySink>,
}

#[async_trait]
impl RequestProcessor for GenerationProcessor {
    type Output = ProcessedReply;

    async fn process(&self, request: &GenerationRequest) -> Result<ProcessedReply> {
        if self.deps.runtime.settings().global_paused {
            tracing::debug!(instance = %self.profile.id, key = %request.key, "globally paused, skipping request");
            return Ok(ProcessedReply::Skipped);
        }

        let position = self
            .deps
            .coordinator
            .register_responder(request.trigger_message_id, &self.profile.id);
        let slot = self.deps.coordinator.acquire_slot(position).await;
        let outcome = self
            .deps
            .chain
            .generate(&request.payload, request.tier_override)
            .await;
        drop(slot);

        Ok(match outcome {
            Ok(result) => {
                tracing::info!(
                    instance = %self.profile.id,
                    key = %request.key,
                    provider = %result.provider,
                    attempts = result.attempts,
                    latency_ms = result.latency_ms,
                    "response generated"
                );
                ProcessedReply::Generated(result)
            }
            Err(error) => ProcessedReply::Failed(error),
        })
    }

    async fn apply(&self, request: &GenerationRequest, output: &ProcessedReply) -> Result<()> {
        match output {
            ProcessedReply::Generated(result) => {
                self.sink
                    .send(
                        &request.key,
                        OutboundReply::Text {
                            reply_to: request.trigger_message_id,
                            text: result.text.clone(),
                        },
                    )
                    .await?;
                // Our own reply is a bot message in this channel.
                self.throttle.observe_bot(&request.key);
                if request.author_kind == AuthorKind::Bot {
                    self.throttle.note_replied_to_bot(&request.key);
                }
            }
            ProcessedReply::Failed(error) => {
                tracing::error!(
                    instance = %self.profile.id,
                    key = %request.key,
                    trigger = %request.trigger,
                    %error,
                    "no response generated"
                );
                if request.trigger.is_direct() {
                    self.sink
                        .send(
                            &request.key,
                            OutboundReply::Error {
                                reply_to: request.trigger_message_id,
                                text: ALL_PROVIDERS_FAILED.into(),
                            },
                        )
                        .await?;
                }
            }
            ProcessedReply::Skipped => {}
        }
        Ok(())
    }
}

/// One bot instance's pipeline.
pub struct Orchestrator {
    profile: InstanceProfile,
    runtime: Arc<RuntimeConfig>,
    throttle: Arc<BotExchangeThrottle>,
    sequencer: InboundEventSequencer<GenerationProcessor>,
    /// Last autonomous response per channel.
    autonomous_fired: Mutex<HashMap<u64, Instant>>,
}

impl Orchestrator {
    pub fn new(profile: InstanceProfile, deps: CoreDeps, sink: Arc<dyn ReplySink>) -> Self {
        let throttle = Arc::new(BotExchangeThrottle::new(deps.runtime.clone()));
        Self::with_throttle(profile, deps, sink, throttle)
    }

    /// Build with a caller-supplied throttle, e.g. one with a seeded RNG.
    pub fn with_throttle(
        profile: InstanceProfile,
        deps: CoreDeps,
        sink: Arc<dyn ReplySink>,
        throttle: Arc<BotExchangeThrottle>,
    ) -> Self {
        let runtime = deps.runtime.clone();
        let config = SequencerConfig::from_settings(&runtime.settings());
        let processor = Arc::new(GenerationProcessor {
            profile: profile.clone(),
            deps,
            throttle: throttle.clone(),
            sink,
        });
        Self {
            profile,
            runtime,
            throttle,
            sequencer: InboundEventSequencer::new(processor, config),
            autonomous_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.profile.id
    }

    pub fn throttle(&self) -> &Arc<BotExchangeThrottle> {
        &self.throttle
    }

    pub fn profile(&self) -> &InstanceProfile {
        &self.profile
    }

    /// Keys with a live sequencer worker.
    pub fn active_keys(&self) -> Vec<ContextKey> {
        self.sequencer.active_keys()
    }

    pub fn queue_depth(&self, key: &ContextKey) -> usize {
        self.sequencer.queue_depth(key)
    }

    /// Observe one message and queue a response if it warrants one.
    pub async fn handle(&self, event: InboundEvent) -> HandleOutcome {
        match event.author_kind {
            AuthorKind::Human => self.throttle.observe_human(&event.key),
            AuthorKind::Bot => self.throttle.observe_bot(&event.key),
        }

        let settings = self.runtime.settings();
        let Some(trigger) = self.classify(&event) else {
            return HandleOutcome::Ignored;
        };

        let candidate = Candidate {
            trigger,
            from_bot: event.author_kind == AuthorKind::Bot,
        };
        // Bot mentions and replies are gated too, or two instances would
        // answer each other forever.
        if !trigger.is_direct() || candidate.from_bot {
            if let ThrottleDecision::Suppressed(reason) = self.throttle.decide(&event.key, candidate) {
                tracing::debug!(instance = %self.profile.id, key = %event.key, %trigger, ?reason, "response suppressed");
                return HandleOutcome::Suppressed(reason);
            }
        }
        if !trigger.is_direct() {
            self.autonomous_fired
                .lock()
                .insert(event.key.channel_id, Instant::now());
        }

        self.sequencer
            .set_config(SequencerConfig::from_settings(&settings));
        let request = self.build_request(&event, trigger);
        match self.sequencer.enqueue(event.key.clone(), request) {
            Ok(ticket) => {
                tracing::debug!(instance = %self.profile.id, key = %event.key, %trigger, "request enqueued");
                HandleOutcome::Enqueued(ticket)
            }
            Err(error) => {
                tracing::info!(instance = %self.profile.id, %error, "request rejected");
                #[cfg(feature = "metrics")]
                crate::telemetry::Metrics::global()
                    .queue_rejections_total
                    .with_label_values(&[error.reason().to_string().as_str()])
                    .inc();
                HandleOutcome::Rejected(error)
            }
        }
    }

    /// Trigger kind for this instance, or `None` when it should stay quiet.
    fn classify(&self, event: &InboundEvent) -> Option<TriggerKind> {
        if event.is_dm || event.is_command || event.mentions_self || event.replies_to_self {
            return Some(TriggerKind::Direct);
        }

        let settings = self.runtime.settings();
        let channel = settings.autonomous_channel(event.key.channel_id)?;

        if self.profile.is_named_in(&event.text) {
            return Some(TriggerKind::NameTrigger);
        }

        let cooldown = Duration::from_secs(channel.cooldown_secs);
        let cooling = self
            .autonomous_fired
            .lock()
            .get(&event.key.channel_id)
            .is_some_and(|fired| fired.elapsed() < cooldown);
        if cooling || !self.throttle.roll(channel.chance) {
            return None;
        }
        Some(TriggerKind::Autonomous)
    }

    fn build_request(&self, event: &InboundEvent, trigger: TriggerKind) -> GenerationRequest {
        let mut messages = Vec::with_capacity(2);
        if !self.profile.system_prompt.trim().is_empty() {
            messages.push(PromptMessage::system(self.profile.system_prompt.clone()));
        }
        let images = event
            .attachments
            .iter()
            .filter(|attachment| attachment.is_image())
            .cloned()
            .collect();
        messages.push(
            PromptMessage::user(format!("{}: {}", event.author_name, event.text)).with_images(images),
        );

        GenerationRequest {
            key: event.key.clone(),
            trigger_message_id: event.message_id,
            author_id: event.author_id,
            author_kind: event.author_kind,
            trigger,
            payload: MessagePayload::new(messages),
            tier_override: self.profile.tier_override,
            enqueued_at: chrono::Utc::now(),
        }
    }

    /// Drop everything queued for `key` and reset its exchange state.
    /// Returns how many waiting requests were discarded.
    pub fn clear_history(&self, key: &ContextKey) -> usize {
        let discarded = self.sequencer.cancel(key);
        self.throttle.reset(key);
        tracing::info!(instance = %self.profile.id, %key, discarded, "history cleared");
        discarded
    }
}
