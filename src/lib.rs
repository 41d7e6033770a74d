//! Pals: request orchestration core for a multi-character chat bot.
//!
//! Every inbound trigger flows through the same pipeline: it is classified,
//! gated by the bot-exchange throttle when it is autonomous, serialized per
//! conversation by the sequencer, admitted by the global concurrency
//! coordinator, and finally generated by the provider chain.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod sequencer;
#[cfg(feature = "metrics")]
pub mod telemetry;
pub mod throttle;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bot instance identifier type.
pub type InstanceId = Arc<str>;

/// Identifies a serialization domain: a channel plus an optional thread.
///
/// Requests sharing a key are processed strictly in order; different keys
/// run independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub channel_id: u64,
    pub thread_id: Option<u64>,
}

impl ContextKey {
    pub fn channel(channel_id: u64) -> Self {
        Self {
            channel_id,
            thread_id: None,
        }
    }

    pub fn thread(channel_id: u64, thread_id: u64) -> Self {
        Self {
            channel_id,
            thread_id: Some(thread_id),
        }
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.thread_id {
            Some(thread_id) => write!(f, "{}:{}", self.channel_id, thread_id),
            None => write!(f, "{}", self.channel_id),
        }
    }
}

/// How a candidate response was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Mention, reply to the bot, DM, or slash command. Always generates.
    Direct,
    /// Unprompted chime-in. Subject to the bot-exchange throttle.
    Autonomous,
    /// The bot's name or a nickname appeared in the text. Autonomous, plus
    /// the name-trigger chance.
    NameTrigger,
}

impl TriggerKind {
    pub fn is_direct(self) -> bool {
        matches!(self, TriggerKind::Direct)
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Direct => write!(f, "direct"),
            TriggerKind::Autonomous => write!(f, "autonomous"),
            TriggerKind::NameTrigger => write!(f, "name_trigger"),
        }
    }
}

/// Who authored an observed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    Human,
    Bot,
}

/// Image or file attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Conversation role of a payload message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the prompt sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub text: String,
    /// Images attached to this message. Only user messages carry images.
    #[serde(default)]
    pub images: Vec<Attachment>,
}

impl PromptMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<Attachment>) -> Self {
        self.images = images;
        self
    }
}

/// The full prompt handed to the provider chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub messages: Vec<PromptMessage>,
    /// Overrides the provider's configured temperature.
    pub temperature: Option<f32>,
    /// Overrides the provider's configured max_tokens.
    pub max_tokens: Option<u32>,
}

impl MessagePayload {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|message| !message.images.is_empty())
    }
}

/// A generation request produced by the message pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub key: ContextKey,
    /// Platform id of the message that triggered the request.
    pub trigger_message_id: u64,
    pub author_id: u64,
    pub author_kind: AuthorKind,
    pub trigger: TriggerKind,
    pub payload: MessagePayload,
    /// Index into the provider list to start the chain from.
    pub tier_override: Option<usize>,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl GenerationRequest {
    /// Trimmed text of the last user message, used for duplicate detection.
    pub fn dedupe_text(&self) -> &str {
        self.payload
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.text.trim())
            .unwrap_or("")
    }
}

/// Successful output of the provider chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub tier: usize,
    /// Total provider attempts made, including retries.
    pub attempts: usize,
    pub latency_ms: u64,
}

/// A message observed on a messaging platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: u64,
    pub key: ContextKey,
    pub author_id: u64,
    pub author_name: String,
    pub author_kind: AuthorKind,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// The message mentions this bot instance.
    pub mentions_self: bool,
    /// The message replies to one of this bot instance's messages.
    pub replies_to_self: bool,
    pub is_dm: bool,
    /// Slash command invocation (always direct).
    pub is_command: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A reply handed to the messaging layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundReply {
    /// Reply to the triggering message.
    Text { reply_to: u64, text: String },
    /// User-visible failure notice.
    Error { reply_to: u64, text: String },
}
