//! The polling loop: fetch a batch of events, route each one to the command
//! dispatcher or the ingestion pipeline, sleep, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{CommandDispatcher, DispatchConfig};
use crate::config::Config;
use crate::error::TransportError;
use crate::ingest::{IngestOutcome, IngestionPipeline};
use crate::store::ModelStore;
use crate::transport::{invocation_tokens, BotIdentity, InboundMessage, Transport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub polls: u64,
    pub poll_failures: u64,
    pub learned: u64,
    pub replies: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    /// Overrides the name reported by the transport in help output.
    pub name: Option<String>,
    pub poll_interval: Duration,
    pub state_size: usize,
    pub max_attempts: usize,
}

impl From<&Config> for BotSettings {
    fn from(config: &Config) -> Self {
        Self {
            name: config.bot.name.clone(),
            poll_interval: config.poll_interval(),
            state_size: config.model.state_size,
            max_attempts: config.model.max_attempts,
        }
    }
}

pub struct Bot<T: Transport> {
    transport: T,
    store: Arc<ModelStore>,
    settings: BotSettings,
}

/// Everything that depends on knowing who the bot is.
struct Session {
    identity: BotIdentity,
    dispatcher: CommandDispatcher,
    pipeline: IngestionPipeline,
}

impl<T: Transport> Bot<T> {
    pub fn new(transport: T, store: Arc<ModelStore>, settings: BotSettings) -> Self {
        Self {
            transport,
            store,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect and process events until `shutdown` is raised. Only the
    /// initial connection can fail; errors while running are logged.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<RunStats, TransportError> {
        let identity = self.transport.connect()?;
        let session = self.session(identity);
        info!(
            id = %session.identity.id,
            name = %session.dispatcher.config().bot_name,
            "listening"
        );

        let mut stats = RunStats::default();
        while !shutdown.load(Ordering::SeqCst) {
            stats.polls += 1;
            match self.transport.poll() {
                Ok(batch) => {
                    for message in &batch {
                        self.handle(&session, message, &mut stats);
                    }
                }
                Err(e) => {
                    stats.poll_failures += 1;
                    warn!("poll failed: {e}");
                }
            }
            if !shutdown.load(Ordering::SeqCst) {
                thread::sleep(self.settings.poll_interval);
            }
        }

        info!(?stats, "shutting down");
        Ok(stats)
    }

    fn session(&self, identity: BotIdentity) -> Session {
        let bot_name = self
            .settings
            .name
            .clone()
            .unwrap_or_else(|| identity.name.clone());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&self.store),
            DispatchConfig {
                bot_name,
                max_attempts: self.settings.max_attempts,
            },
        );
        let pipeline =
            IngestionPipeline::new(Arc::clone(&self.store), &identity.id, self.settings.state_size);
        Session {
            identity,
            dispatcher,
            pipeline,
        }
    }

    fn handle(&mut self, session: &Session, message: &InboundMessage, stats: &mut RunStats) {
        let author = message.author_id.as_deref();
        let own = author == Some(session.identity.id.as_str());

        let invocation = message
            .text
            .as_deref()
            .filter(|_| message.is_message() && !own)
            .and_then(|text| invocation_tokens(text, &session.identity.id));

        let Some(tokens) = invocation else {
            if let IngestOutcome::Learned { .. } = session.pipeline.observe(message) {
                stats.learned += 1;
            }
            return;
        };

        let reply = session.dispatcher.dispatch(&tokens, author);
        debug!(channel = %message.channel_id, ?tokens, "answering invocation");
        match self.transport.send(&message.channel_id, &reply) {
            Ok(()) => stats.replies += 1,
            Err(e) => {
                stats.send_failures += 1;
                warn!(channel = %message.channel_id, "failed to send reply: {e}");
            }
        }
    }
}
