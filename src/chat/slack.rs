//! Slack chat adapter using slack-morphism.
//!
//! Inbound events arrive via the Events API webhook (`api::webhooks`), not
//! Socket Mode — `start()` hands back a stream fed by [`SlackAdapter::ingest`],
//! which the webhook handler calls after signature verification. Outbound is
//! plain REST (`chat.postMessage` / `chat.update`), reusing one shared client.

use crate::chat::{ChatAdapter, InboundChatEvent, InboundEventStream};
use crate::error::{ChatError, Result};
use crate::ChatPlatform;

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct SlackAdapter {
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    inbound_tx: mpsc::Sender<InboundChatEvent>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundChatEvent>>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.into()));
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        Ok(Self {
            client,
            token,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Called by `api::webhooks::handle_slack` once a webhook payload has
    /// passed signature verification. Ignores subtype'd messages (edits,
    /// deletes, bot echoes) the same way the webhook's `message` events do.
    pub async fn ingest(&self, event: SlackEventCallbackBody) {
        let SlackEventCallbackBody::Message(msg) = event else {
            return;
        };

        if msg.subtype.is_some() {
            return;
        }

        let Some(user_id) = msg.sender.user.as_ref().map(|u| u.0.clone()) else {
            return;
        };

        let channel_id = msg
            .origin
            .channel
            .as_ref()
            .map(|c| c.0.clone())
            .unwrap_or_default();
        let ts = msg.origin.ts.0.clone();
        let thread_ts = msg
            .origin
            .thread_ts
            .as_ref()
            .map(|t| t.0.clone())
            .unwrap_or_else(|| ts.clone());
        let text = msg
            .content
            .and_then(|c| c.text)
            .unwrap_or_default();

        let event = InboundChatEvent {
            platform: ChatPlatform::Slack,
            platform_channel_id: channel_id.clone(),
            thread_key: format!("{channel_id}:{thread_ts}"),
            platform_message_id: ts,
            text,
            user_auth_provider_id: user_id,
            user_display_name: None,
        };

        if let Err(error) = self.inbound_tx.send(event).await {
            tracing::warn!(%error, "failed to enqueue slack inbound event");
        }
    }
}

impl ChatAdapter for SlackAdapter {
    fn platform(&self) -> ChatPlatform {
        ChatPlatform::Slack
    }

    async fn start(&self) -> Result<InboundEventStream> {
        let rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .context("slack adapter's inbound stream was already taken")?;
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn post_thread_reply(&self, thread_key: &str, text: &str) -> Result<String> {
        let (channel_id, thread_ts) = split_thread_key(thread_key)?;

        let req = SlackApiChatPostMessageRequest::new(
            SlackChannelId(channel_id),
            SlackMessageContent::new().with_text(text.to_string()),
        )
        .opt_thread_ts(Some(SlackTs(thread_ts)));

        let resp = self
            .session()
            .chat_post_message(&req)
            .await
            .map_err(|e| ChatError::PostFailed {
                thread_key: thread_key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(format!("{}:{}", resp.channel.0, resp.ts.0))
    }

    async fn edit_message(&self, posted_id: &str, text: &str) -> Result<()> {
        let (channel_id, ts) = split_thread_key(posted_id)?;

        let req = SlackApiChatUpdateRequest::new(
            SlackChannelId(channel_id),
            SlackMessageContent::new().with_text(text.to_string()),
            SlackTs(ts),
        );

        self.session()
            .chat_update(&req)
            .await
            .map_err(|e| ChatError::EditFailed {
                posted_id: posted_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }
}

/// Thread keys and posted-message ids both use `"{channel_id}:{ts}"` so a
/// later edit doesn't need a separate channel lookup.
fn split_thread_key(key: &str) -> Result<(String, String)> {
    key.split_once(':')
        .map(|(channel, ts)| (channel.to_string(), ts.to_string()))
        .with_context(|| format!("malformed slack thread key: {key}"))
        .map_err(|e| ChatError::Other(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_channel_and_ts_from_thread_key() {
        let (channel, ts) = split_thread_key("C123:1700000000.000100").unwrap();
        assert_eq!(channel, "C123");
        assert_eq!(ts, "1700000000.000100");
    }

    #[test]
    fn rejects_thread_key_without_separator() {
        assert!(split_thread_key("C123").is_err());
    }
}
