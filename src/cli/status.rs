use clap::Args;

use super::CliContext;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Skip the connection check against the graph daemon
    #[arg(long)]
    pub no_connections: bool,
}

pub async fn execute(args: StatusArgs, context: &CliContext) -> anyhow::Result<()> {
    let supervisor = context.supervisor();
    let processes = supervisor.list();
    if processes.is_empty() {
        println!("no managed hosts in {}", context.settings.run_dir.display());
    }
    for process in &processes {
        println!(
            "{:<24} pid {:<8} {:<9} since {}  log {}",
            process.name,
            process.pid,
            process.state,
            process.started_at.format("%Y-%m-%d %H:%M:%S"),
            process.log.display()
        );
    }

    if args.no_connections || !context.has_chain() {
        return Ok(());
    }
    let (_, plan) = context.load_chain()?;
    let orchestrator = context.orchestrator(plan, supervisor);
    match orchestrator.connection_status().await {
        Ok(connections) => {
            for (connection, present) in connections {
                let mark = if present { "connected" } else { "missing" };
                println!("{connection}  [{mark}]");
            }
        }
        Err(e) => println!("connections unknown: {e}"),
    }
    Ok(())
}
