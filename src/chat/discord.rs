//! Discord chat adapter using serenity's REST client.
//!
//! Inbound events arrive via Discord's Interactions webhook
//! (`api::webhooks::handle_discord`), verified with Ed25519 before reaching
//! [`DiscordAdapter::ingest`] — there is no gateway connection here, only the
//! `Http` REST client for posting/editing replies.

use crate::chat::{ChatAdapter, InboundChatEvent, InboundEventStream};
use crate::error::{ChatError, Result};
use crate::{ChatPlatform, Error};

use anyhow::Context as _;
use serenity::http::Http;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct DiscordAdapter {
    http: Arc<Http>,
    inbound_tx: mpsc::Sender<InboundChatEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundChatEvent>>>,
}

impl DiscordAdapter {
    pub fn new(bot_token: impl AsRef<str>) -> Self {
        let http = Arc::new(Http::new(bot_token.as_ref()));
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Self {
            http,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Called by `api::webhooks::handle_discord` with a verified `MESSAGE_CREATE`
    /// style payload. Slash-command/interaction payloads that carry no plain
    /// text body are ignored; SPEC_FULL's chat adapter only needs the thread
    /// reply/edit/error-post surface, not interactive components.
    pub async fn ingest(&self, payload: &serde_json::Value) {
        let Some(channel_id) = payload.get("channel_id").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(message_id) = payload.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        let text = payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let Some(author) = payload.get("author") else {
            return;
        };
        let Some(user_id) = author.get("id").and_then(|v| v.as_str()) else {
            return;
        };
        if author.get("bot").and_then(|v| v.as_bool()).unwrap_or(false) {
            return;
        }
        let display_name = author
            .get("username")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let event = InboundChatEvent {
            platform: ChatPlatform::Discord,
            platform_channel_id: channel_id.to_string(),
            thread_key: channel_id.to_string(),
            platform_message_id: message_id.to_string(),
            text,
            user_auth_provider_id: user_id.to_string(),
            user_display_name: display_name,
        };

        if let Err(error) = self.inbound_tx.send(event).await {
            tracing::warn!(%error, "failed to enqueue discord inbound event");
        }
    }
}

impl ChatAdapter for DiscordAdapter {
    fn platform(&self) -> ChatPlatform {
        ChatPlatform::Discord
    }

    async fn start(&self) -> Result<InboundEventStream> {
        let rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .context("discord adapter's inbound stream was already taken")?;
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn post_thread_reply(&self, thread_key: &str, text: &str) -> Result<String> {
        let channel_id: u64 = thread_key
            .parse()
            .with_context(|| format!("malformed discord channel id in thread key: {thread_key}"))
            .map_err(|e| Error::from(ChatError::Other(e)))?;

        let message = serenity::all::ChannelId::new(channel_id)
            .say(&self.http, text)
            .await
            .map_err(|e| ChatError::PostFailed {
                thread_key: thread_key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(format!("{}:{}", channel_id, message.id.get()))
    }

    async fn edit_message(&self, posted_id: &str, text: &str) -> Result<()> {
        let (channel_id, message_id) = split_posted_id(posted_id)?;

        serenity::all::ChannelId::new(channel_id)
            .edit_message(
                &self.http,
                serenity::all::MessageId::new(message_id),
                serenity::all::EditMessage::new().content(text),
            )
            .await
            .map_err(|e| ChatError::EditFailed {
                posted_id: posted_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

fn split_posted_id(posted_id: &str) -> Result<(u64, u64)> {
    let (channel, message) = posted_id
        .split_once(':')
        .with_context(|| format!("malformed discord posted id: {posted_id}"))
        .map_err(|e| Error::from(ChatError::Other(e)))?;

    let channel_id: u64 = channel
        .parse()
        .with_context(|| format!("malformed discord channel id: {channel}"))
        .map_err(|e| Error::from(ChatError::Other(e)))?;
    let message_id: u64 = message
        .parse()
        .with_context(|| format!("malformed discord message id: {message}"))
        .map_err(|e| Error::from(ChatError::Other(e)))?;

    Ok((channel_id, message_id))
}
