//! Boundary between the bot and a chat service.
//!
//! The bot only needs three things from a chat service: who it is, a way to
//! fetch new events, and a way to post a reply. Reconnection and
//! authentication stay inside the transport implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TransportError;

/// Event kind carrying a posted chat message.
pub const MESSAGE_KIND: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub kind: String,
    pub text: Option<String>,
    pub author_id: Option<String>,
    pub channel_id: String,
}

impl InboundMessage {
    pub fn message(channel_id: &str, author_id: &str, text: &str) -> Self {
        Self {
            kind: MESSAGE_KIND.to_string(),
            text: Some(text.to_string()),
            author_id: Some(author_id.to_string()),
            channel_id: channel_id.to_string(),
        }
    }

    pub fn is_message(&self) -> bool {
        self.kind == MESSAGE_KIND
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: String,
    pub name: String,
}

/// The token a message must start with to address the user or bot `id`.
pub fn mention_token(id: &str) -> String {
    format!("<@{id}>")
}

/// Invocation tokens of a message addressed to `bot_id`, or `None` when the
/// message does not start with the bot's mention. The first whitespace token
/// (the mention) is dropped.
pub fn invocation_tokens<'a>(text: &'a str, bot_id: &str) -> Option<Vec<&'a str>> {
    if !text.starts_with(&mention_token(bot_id)) {
        return None;
    }
    Some(text.split_whitespace().skip(1).collect())
}

pub trait Transport {
    fn connect(&mut self) -> Result<BotIdentity, TransportError>;

    /// Events observed since the previous poll, oldest first.
    fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError>;

    fn send(&mut self, channel_id: &str, text: &str) -> Result<(), TransportError>;
}

/// In-memory transport replaying queued batches and recording replies.
///
/// Once every queued batch has been delivered it raises the optional
/// shutdown flag, which lets a run loop drain a script and stop.
pub struct ScriptedTransport {
    identity: BotIdentity,
    batches: VecDeque<Result<Vec<InboundMessage>, String>>,
    sent: Vec<(String, String)>,
    shutdown_when_drained: Option<Arc<AtomicBool>>,
    connected: bool,
}

impl ScriptedTransport {
    pub fn new(identity: BotIdentity) -> Self {
        Self {
            identity,
            batches: VecDeque::new(),
            sent: Vec::new(),
            shutdown_when_drained: None,
            connected: false,
        }
    }

    pub fn push_batch(&mut self, batch: Vec<InboundMessage>) -> &mut Self {
        self.batches.push_back(Ok(batch));
        self
    }

    /// Queue a poll that fails with `error`.
    pub fn push_failure(&mut self, error: &str) -> &mut Self {
        self.batches.push_back(Err(error.to_string()));
        self
    }

    pub fn shutdown_when_drained(&mut self, flag: Arc<AtomicBool>) -> &mut Self {
        self.shutdown_when_drained = Some(flag);
        self
    }

    /// Replies sent so far as `(channel, text)` pairs.
    pub fn sent(&self) -> &[(String, String)] {
        &self.sent
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> Result<BotIdentity, TransportError> {
        self.connected = true;
        Ok(self.identity.clone())
    }

    fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let next = self.batches.pop_front();
        if self.batches.is_empty() {
            if let Some(flag) = &self.shutdown_when_drained {
                flag.store(true, Ordering::SeqCst);
            }
        }
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(error)) => Err(TransportError::Api {
                method: "poll".to_string(),
                error,
            }),
            None => Ok(Vec::new()),
        }
    }

    fn send(&mut self, channel_id: &str, text: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.sent.push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}
