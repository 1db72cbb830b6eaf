//! Chat Adapter: the interface the core depends on to post into and read
//! from a chat thread. Two implementations exist (Slack, Discord); the core
//! only ever sees `ChatAdapterDyn`.

pub mod discord;
pub mod slack;

use crate::error::Result;
use crate::ChatPlatform;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

/// One inbound chat event, already normalized away from platform-specific
/// payload shapes.
#[derive(Debug, Clone)]
pub struct InboundChatEvent {
    pub platform: ChatPlatform,
    pub platform_channel_id: String,
    pub thread_key: String,
    pub platform_message_id: String,
    pub text: String,
    pub user_auth_provider_id: String,
    pub user_display_name: Option<String>,
}

pub type InboundEventStream = Pin<Box<dyn Stream<Item = InboundChatEvent> + Send>>;

/// Static trait for chat adapters. Use this for type-safe implementations.
pub trait ChatAdapter: Send + Sync + 'static {
    fn platform(&self) -> ChatPlatform;

    /// Begin listening for inbound events (webhook-fed or gateway-fed,
    /// depending on the implementation) and return the event stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundEventStream>> + Send;

    /// Post a new reply into the thread, returning the platform's id for
    /// the posted message so a later `result`/`error` frame can edit it.
    fn post_thread_reply(
        &self,
        thread_key: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    fn edit_message(
        &self,
        posted_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Dynamic trait for runtime polymorphism. Use this when storing adapters
/// of different platforms behind `Arc<dyn ChatAdapterDyn>`.
pub trait ChatAdapterDyn: Send + Sync + 'static {
    fn platform(&self) -> ChatPlatform;

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundEventStream>> + Send + 'a>>;

    fn post_thread_reply<'a>(
        &'a self,
        thread_key: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn edit_message<'a>(
        &'a self,
        posted_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: ChatAdapter> ChatAdapterDyn for T {
    fn platform(&self) -> ChatPlatform {
        ChatAdapter::platform(self)
    }

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundEventStream>> + Send + 'a>> {
        Box::pin(ChatAdapter::start(self))
    }

    fn post_thread_reply<'a>(
        &'a self,
        thread_key: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(ChatAdapter::post_thread_reply(self, thread_key, text))
    }

    fn edit_message<'a>(
        &'a self,
        posted_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(ChatAdapter::edit_message(self, posted_id, text))
    }
}

/// Registry of adapters by platform, used by the state machine to post
/// without knowing which concrete adapter backs a job's platform.
#[derive(Clone, Default)]
pub struct ChatAdapterManager {
    adapters: HashMap<ChatPlatform, Arc<dyn ChatAdapterDyn>>,
}

impl ChatAdapterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChatAdapterDyn>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: ChatPlatform) -> Option<Arc<dyn ChatAdapterDyn>> {
        self.adapters.get(&platform).cloned()
    }
}
