//! Supervisor for external plugin host processes: launches them, feeds
//! commands through per-host control pipes and wires their ports into a
//! signal chain through the graph daemon.

pub mod chain;
pub mod channel;
pub mod command;
pub mod config;
pub mod directory;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod port;
pub mod process;
pub mod readiness;
pub mod wirer;

pub use error::{ChainError, DirectoryError};
