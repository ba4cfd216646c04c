use std::path::PathBuf;

use thiserror::Error;

use crate::port::PortRef;

/// Everything that can go wrong while bringing a chain up or down.
///
/// `ConfigureFailed` is the only variant the orchestrator treats as
/// non-fatal; it is logged and the startup continues.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("graph daemon unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("failed to launch `{name}`: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("port `{port}` did not appear within {waited_ms} ms")]
    ReadinessTimeout { port: PortRef, waited_ms: u128 },

    #[error("control channel for `{name}` unavailable: {reason}")]
    ChannelUnavailable { name: String, reason: String },

    #[error("could not connect `{src}` -> `{dst}` after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        src: PortRef,
        dst: PortRef,
        attempts: u32,
        reason: String,
    },

    #[error("command `{command}` for `{name}` was not applied: {reason}")]
    ConfigureFailed {
        name: String,
        command: String,
        reason: String,
    },

    #[error("no managed process named `{name}`")]
    NotFound { name: String },

    #[error("invalid chain: {0}")]
    InvalidChain(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChainError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a startup sequence must abort on this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChainError::ConfigureFailed { .. })
    }
}

/// Errors reported by a [`crate::directory::PortDirectoryType`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The daemon (or the tool used to reach it) did not answer at all.
    #[error("{0}")]
    Unavailable(String),

    /// The daemon answered but refused the operation.
    #[error("{0}")]
    Failed(String),
}
