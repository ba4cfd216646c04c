use std::time::Duration;

use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::{directory::PortDirectory, error::ChainError, port::PortRef};

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectOutcome {
    AlreadyConnected,
    Connected,
}

/// Idempotent connect with a bounded retry.
#[derive(Debug, Clone)]
pub struct GraphWirer {
    directory: PortDirectory,
    attempts: u32,
    backoff: Duration,
}

impl GraphWirer {
    pub fn new(directory: PortDirectory, attempts: u32, backoff: Duration) -> Self {
        Self {
            directory,
            attempts: attempts.max(1),
            backoff,
        }
    }

    async fn is_connected(&self, src: &PortRef, dst: &PortRef) -> bool {
        match self.directory.list_connections(src).await {
            Ok(peers) => peers.contains(dst),
            Err(e) => {
                debug!(%src, error = %e, "could not read connections");
                false
            }
        }
    }

    /// Connect `src` to `dst` unless they already are. Nothing else in the
    /// graph is touched.
    pub async fn connect(&self, src: &PortRef, dst: &PortRef) -> Result<ConnectOutcome, ChainError> {
        if self.is_connected(src, dst).await {
            debug!(%src, %dst, "already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.directory.connect(src, dst).await {
                Ok(()) => {
                    info!(%src, %dst, attempt, "connected");
                    return Ok(ConnectOutcome::Connected);
                }
                Err(e) => {
                    // A refusal may just mean someone else won the race.
                    if self.is_connected(src, dst).await {
                        return Ok(ConnectOutcome::AlreadyConnected);
                    }
                    warn!(%src, %dst, attempt, error = %e, "connect failed");
                    last_error = e.to_string();
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(ChainError::ConnectFailed {
            src: src.clone(),
            dst: dst.clone(),
            attempts: self.attempts,
            reason: last_error,
        })
    }

    /// Best-effort removal of one connection. Returns whether it went away.
    pub async fn disconnect(&self, src: &PortRef, dst: &PortRef) -> bool {
        if !self.is_connected(src, dst).await {
            return false;
        }
        match self.directory.disconnect(src, dst).await {
            Ok(()) => {
                debug!(%src, %dst, "disconnected");
                true
            }
            Err(e) => {
                debug!(%src, %dst, error = %e, "disconnect failed");
                false
            }
        }
    }
}
