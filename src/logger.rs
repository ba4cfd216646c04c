use std::{path::Path, time::Instant};

use anyhow::Result;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

pub const LOG_FILE: &str = "chainrig.log";
pub const STAGE_FILE: &str = "chainrig-stages.json";

/// Install the global subscriber: human-readable output on stderr, a daily
/// rolling text log and a JSON file that only receives `stage` events.
///
/// Returns `Ok(false)` when a subscriber was already installed, which
/// happens when tests initialise logging more than once.
pub fn init_tracing(log_dir: &Path, log_level: &str) -> Result<bool> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE);
    let txt_layer = fmt::layer().with_writer(txt_appender).with_ansi(false);

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, STAGE_FILE);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("stage=info"));

    Ok(Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .is_ok())
}

/// Times one orchestrator stage and reports it on the `stage` target.
#[derive(Debug)]
pub struct StageTimer {
    chain: String,
    stage: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn start(chain: &str, stage: &'static str) -> Self {
        Self {
            chain: chain.to_string(),
            stage,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn ok(self) {
        info!(
            target: "stage",
            chain = %self.chain,
            stage = self.stage,
            duration_ms = self.elapsed_ms(),
            outcome = "ok"
        );
    }

    pub fn failed(self, err: &dyn std::fmt::Display) {
        error!(
            target: "stage",
            chain = %self.chain,
            stage = self.stage,
            duration_ms = self.elapsed_ms(),
            outcome = "failed",
            error = %err
        );
    }
}
