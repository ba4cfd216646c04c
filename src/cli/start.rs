use anyhow::bail;
use clap::Args;
use tokio::signal;
use tracing::{info, warn};

use super::CliContext;
use chainrig::orchestrator::{ChainOrchestrator, ChainReport};

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Stay attached and tear the chain down on Ctrl-C
    #[arg(long)]
    pub foreground: bool,
}

pub async fn execute(args: StartArgs, context: &CliContext) -> anyhow::Result<()> {
    let (_, plan) = context.load_chain()?;
    let mut orchestrator = context.orchestrator(plan, context.supervisor());

    let outcome = tokio::select! {
        result = orchestrator.start() => Some(result),
        _ = signal::ctrl_c() => None,
    };
    let report = match outcome {
        Some(result) => result?,
        None => {
            warn!("interrupted during startup");
            orchestrator.teardown().await;
            bail!("startup interrupted");
        }
    };
    print_report(&report);

    if args.foreground {
        println!("chain running; press Ctrl-C to stop");
        signal::ctrl_c().await?;
        info!("shutting down");
        shutdown(&mut orchestrator).await;
    }
    Ok(())
}

fn print_report(report: &ChainReport) {
    for process in &report.processes {
        let note = if process.fresh { "started" } else { "already running" };
        println!("{:<24} pid {:<8} {note}", process.name, process.pid);
    }
    for (connection, outcome) in &report.connections {
        println!("{connection}  [{outcome}]");
    }
    for failure in &report.configure_failures {
        println!("warning: {failure}");
    }
}

async fn shutdown(orchestrator: &mut ChainOrchestrator) {
    let report = orchestrator.teardown().await;
    for (name, outcome) in &report.stopped {
        println!("{name:<24} {outcome}");
    }
}
