use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the Markov model itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Two chains of different order cannot be summed.
    #[error("cannot merge chains of state size {left} and {right}")]
    IncompatibleModel { left: usize, right: usize },

    #[error("corrupt model record: {0}")]
    CorruptModel(String),

    #[error("failed to encode model record: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Grammar violation in a bot invocation. Never shown verbatim to users.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandSyntaxError {
    #[error("no subcommand given")]
    MissingSubcommand,

    #[error("unknown subcommand `{0}`")]
    UnknownSubcommand(String),

    #[error("`{command}` requires at least one {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("http request to {method} failed: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} returned error `{error}`")]
    Api { method: String, error: String },

    #[error("{method} was rate limited, retry after {retry_after:?}")]
    RateLimited { method: String, retry_after: Duration },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
