use tracing::{info, warn};

use super::CliContext;

/// Tear down the chain from the chain file, or every host found in the run
/// directory when there is no chain file.
pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    let supervisor = context.supervisor();

    if context.has_chain() {
        let (_, plan) = context.load_chain()?;
        let mut orchestrator = context.orchestrator(plan, supervisor);
        let report = orchestrator.teardown().await;
        for (name, outcome) in &report.stopped {
            println!("{name:<24} {outcome}");
        }
        if report.stopped.is_empty() {
            println!("nothing was running");
        }
        return Ok(());
    }

    info!(chain = %context.chain.display(), "no chain file, stopping every managed host");
    let mut names = supervisor.names();
    if names.is_empty() {
        println!("nothing was running");
    }
    names.reverse();
    for name in names {
        match supervisor.stop(&name).await {
            Ok(outcome) => println!("{name:<24} {outcome}"),
            Err(e) => warn!(name = %name, error = %e, "stop failed"),
        }
    }
    Ok(())
}
