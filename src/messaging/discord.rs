//! Discord messaging adapter using serenity.

use crate::messaging::traits::{InboundStream, Messaging};
use crate::{Attachment, AuthorKind, ContextKey, InboundEvent, OutboundReply};

use anyhow::Context as _;
use serenity::all::{
    ChannelId, Client, Context, CreateMessage, EventHandler, GatewayIntents, Http, Message,
    MessageId, Ready, ShardManager, UserId,
};
use serenity::async_trait;
use tokio::sync::{RwLock, mpsc};

use std::sync::Arc;

/// Discord messages are limited to 2000 characters.
const MAX_MESSAGE_LENGTH: usize = 2000;

/// One Discord bot account, serving one character.
pub struct DiscordAdapter {
    name: String,
    token: String,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordAdapter {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            http: Arc::new(RwLock::new(None)),
            shard_manager: Arc::new(RwLock::new(None)),
        }
    }

    fn intents() -> GatewayIntents {
        GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
    }
}

struct Handler {
    name: String,
    inbound_tx: mpsc::Sender<InboundEvent>,
    bot_user_id: RwLock<Option<UserId>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            instance = %self.name,
            bot_name = %ready.user.name,
            guilds = ready.guilds.len(),
            "discord bot ready"
        );
        *self.bot_user_id.write().await = Some(ready.user.id);
    }

    async fn message(&self, _ctx: Context, message: Message) {
        let Some(self_id) = *self.bot_user_id.read().await else {
            return;
        };
        // Skip our own messages
        if message.author.id == self_id || is_ignored_content(&message.content) {
            return;
        }

        let event = to_inbound_event(&message, self_id);
        if let Err(error) = self.inbound_tx.send(event).await {
            tracing::warn!(instance = %self.name, %error, "failed to forward discord message (receiver dropped)");
        }
    }
}

/// Slash commands and `//` out-of-character chatter are not conversation.
fn is_ignored_content(content: &str) -> bool {
    content.starts_with('/')
}

fn to_inbound_event(message: &Message, self_id: UserId) -> InboundEvent {
    let attachments = message
        .attachments
        .iter()
        .map(|attachment| Attachment {
            filename: attachment.filename.clone(),
            mime_type: attachment
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            url: attachment.url.clone(),
        })
        .collect();

    let author_name = message
        .author
        .global_name
        .clone()
        .unwrap_or_else(|| message.author.name.clone());

    InboundEvent {
        message_id: message.id.get(),
        key: ContextKey::channel(message.channel_id.get()),
        author_id: message.author.id.get(),
        author_name,
        author_kind: if message.author.bot {
            AuthorKind::Bot
        } else {
            AuthorKind::Human
        },
        text: message.content.clone(),
        attachments,
        mentions_self: message.mentions.iter().any(|user| user.id == self_id),
        replies_to_self: message
            .referenced_message
            .as_ref()
            .is_some_and(|referenced| referenced.author.id == self_id),
        is_dm: message.guild_id.is_none(),
        is_command: false,
        timestamp: chrono::Utc::now(),
    }
}

impl Messaging for DiscordAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let handler = Handler {
            name: self.name.clone(),
            inbound_tx,
            bot_user_id: RwLock::new(None),
        };

        let mut client = Client::builder(&self.token, Self::intents())
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.http.write().await = Some(client.http.clone());
        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(instance = %name, %error, "discord client stopped");
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn respond(&self, key: &ContextKey, reply: OutboundReply) -> crate::Result<()> {
        let http = self
            .http
            .read()
            .await
            .clone()
            .context("discord client not connected")?;
        let channel = ChannelId::new(key.thread_id.unwrap_or(key.channel_id));

        let (reply_to, text) = match reply {
            OutboundReply::Text { reply_to, text } => (reply_to, text),
            OutboundReply::Error { reply_to, text } => (reply_to, format!("⚠️ {text}")),
        };

        for (index, chunk) in split_message(&text, MAX_MESSAGE_LENGTH).into_iter().enumerate() {
            let mut builder = CreateMessage::new().content(chunk);
            // Only the first chunk is threaded onto the trigger.
            if index == 0 && reply_to != 0 {
                builder = builder.reference_message((channel, MessageId::new(reply_to)));
            }
            channel
                .send_message(&http, builder)
                .await
                .context("failed to send discord message")?;
        }
        Ok(())
    }

    async fn health_check(&self) -> crate::Result<()> {
        if self.http.read().await.is_none() {
            return Err(anyhow::anyhow!("discord client not connected").into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        if let Some(shard_manager) = self.shard_manager.write().await.take() {
            shard_manager.shutdown_all().await;
        }
        *self.http.write().await = None;
        tracing::info!(instance = %self.name, "discord adapter shut down");
        Ok(())
    }
}

/// Split a message into chunks that fit within Discord's character limit.
/// Tries to split at newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text.trim();

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&index| index > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
