use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod schema;
pub mod send;
pub mod start;
pub mod status;
pub mod stop;

use schema::SchemaArgs;
use send::SendArgs;
use start::StartArgs;
use status::StatusArgs;

use chainrig::{
    chain::{ChainFile, ChainPlan},
    config::Settings,
    directory::{JackPortDirectory, PortDirectory},
    orchestrator::ChainOrchestrator,
    process::{ProcessSupervisor, RunLayout},
};

#[derive(Parser, Debug)]
#[command(
    name = "chainrig",
    about = "Launch plugin hosts, drive their control pipes and wire them into a chain",
    version = "0.1.0"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Chain file to use
    #[arg(long, global = true, default_value = "chain.yaml")]
    pub chain: PathBuf,

    /// Directory for control pipes, logs and process records
    #[arg(long, global = true)]
    pub run_dir: Option<PathBuf>,

    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Optional .env file with CHAINRIG_* settings
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch, configure and wire the chain (default)
    Start(StartArgs),

    /// Tear the chain down
    Stop,

    /// Show managed hosts and declared connections
    Status(StatusArgs),

    /// Send one command to a running host
    Send(SendArgs),

    /// Print the chain file JSON schema
    Schema(SchemaArgs),
}

pub struct CliContext {
    pub settings: Settings,
    pub chain: PathBuf,
}

impl CliContext {
    pub fn new(settings: Settings, chain: PathBuf) -> Self {
        Self { settings, chain }
    }

    pub fn supervisor(&self) -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(
            RunLayout::new(&self.settings.run_dir),
            self.settings.stop_grace,
        ))
    }

    pub fn directory(&self) -> PortDirectory {
        PortDirectory(JackPortDirectory::new(
            self.settings.jack_lsp.clone(),
            self.settings.jack_connect.clone(),
            self.settings.jack_disconnect.clone(),
            self.settings.query_timeout,
        ))
    }

    pub fn has_chain(&self) -> bool {
        self.chain.exists()
    }

    pub fn load_chain(&self) -> anyhow::Result<(ChainFile, ChainPlan)> {
        let file = ChainFile::load(&self.chain)
            .with_context(|| format!("could not load chain file {}", self.chain.display()))?;
        let plan = file
            .plan()
            .with_context(|| format!("chain file {} is not valid", self.chain.display()))?;
        Ok((file, plan))
    }

    pub fn orchestrator(&self, plan: ChainPlan, supervisor: Arc<ProcessSupervisor>) -> ChainOrchestrator {
        let label = self
            .chain
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chain".to_string());
        ChainOrchestrator::new(label, plan, supervisor, self.directory(), &self.settings)
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Start(args) => start::execute(args, context).await,
        Commands::Stop => stop::execute(context).await,
        Commands::Status(args) => status::execute(args, context).await,
        Commands::Send(args) => send::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Start(StartArgs::default())
}
