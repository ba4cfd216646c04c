use std::process;

use clap::Parser;
use tracing::error;

mod cli;

use chainrig::{
    config::{ConfigManager, EnvConfigManager, Settings},
    logger::init_tracing,
};
use cli::{Cli, CliContext, default_command, execute};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let cli = Cli::parse();

    let config = ConfigManager(EnvConfigManager::new(Some(cli.env_file.clone())));
    let mut settings = Settings::resolve(&config).await;
    if let Some(run_dir) = cli.run_dir {
        settings.run_dir = run_dir;
    }

    if let Err(e) = init_tracing(&settings.run_dir.join("logs"), &cli.log_level) {
        eprintln!("could not set up logging in {}: {e:#}", settings.run_dir.display());
    }
    settings.report();

    let context = CliContext::new(settings, cli.chain);
    let command = cli.command.unwrap_or_else(default_command);
    if let Err(e) = execute(&context, command).await {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
