//! A chat bot that learns how people talk.
//!
//! Every message seen in a channel is folded into a Markov chain for its
//! author and into one shared chain for everyone. When addressed, the bot
//! generates a sentence in the style of a participant (`impersonate`) or of a
//! reference text added by an operator (`write`).

pub mod bot;
pub mod command;
pub mod config;
pub mod corpus;
pub mod error;
pub mod ingest;
pub mod model;
pub mod slack;
pub mod store;
pub mod telemetry;
pub mod text;
pub mod transport;

pub use bot::{Bot, BotSettings, RunStats};
pub use command::{CommandDispatcher, DispatchConfig, Invocation};
pub use config::Config;
pub use error::{CommandSyntaxError, ConfigError, ModelError, StoreError, TransportError};
pub use ingest::{IngestOutcome, IngestionPipeline};
pub use model::{BuildOptions, TextModel};
pub use store::{ModelStore, Namespace, EVERYONE};
pub use transport::{BotIdentity, InboundMessage, ScriptedTransport, Transport};
