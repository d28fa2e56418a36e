//! Passive learning from chat traffic.
//!
//! Every ordinary message is turned into a one-sentence model and merged into
//! its author's model and the aggregate [`EVERYONE`] model. Messages aimed at
//! the bot and the bot's own replies are never learned from.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::TextModel;
use crate::store::{ModelStore, Namespace, EVERYONE};
use crate::transport::{mention_token, InboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAMessage,
    NoText,
    NoAuthor,
    AddressedToBot,
    OwnMessage,
    NoTokens,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Learned { author: String },
    Skipped(SkipReason),
    Failed,
}

pub struct IngestionPipeline {
    store: Arc<ModelStore>,
    bot_id: String,
    state_size: usize,
}

impl IngestionPipeline {
    pub fn new(store: Arc<ModelStore>, bot_id: &str, state_size: usize) -> Self {
        Self {
            store,
            bot_id: bot_id.to_string(),
            state_size,
        }
    }

    /// Learn from one observed event. Failures are logged and reported as
    /// [`IngestOutcome::Failed`]; they never propagate to the caller.
    pub fn observe(&self, message: &InboundMessage) -> IngestOutcome {
        if !message.is_message() {
            return IngestOutcome::Skipped(SkipReason::NotAMessage);
        }
        let Some(text) = message.text.as_deref() else {
            return IngestOutcome::Skipped(SkipReason::NoText);
        };
        if text.starts_with(&mention_token(&self.bot_id)) {
            return IngestOutcome::Skipped(SkipReason::AddressedToBot);
        }
        let Some(author) = message.author_id.as_deref() else {
            return IngestOutcome::Skipped(SkipReason::NoAuthor);
        };
        if author == self.bot_id {
            return IngestOutcome::Skipped(SkipReason::OwnMessage);
        }

        let learned = TextModel::from_sentence(text, self.state_size);
        if learned.is_empty() {
            return IngestOutcome::Skipped(SkipReason::NoTokens);
        }

        match self.learn(author, &learned) {
            Ok(()) => {
                debug!(author, channel = %message.channel_id, "learned message");
                IngestOutcome::Learned {
                    author: author.to_string(),
                }
            }
            Err(e) => {
                warn!(author, channel = %message.channel_id, text, "failed to learn message: {e}");
                IngestOutcome::Failed
            }
        }
    }

    fn learn(&self, author: &str, learned: &TextModel) -> Result<(), StoreError> {
        self.store
            .update(author, Namespace::Chains, |old| old.merge(learned))?;
        self.store
            .update(EVERYONE, Namespace::Chains, |old| old.merge(learned))?;
        Ok(())
    }
}
