use anyhow::bail;
use clap::Args;
use tracing::info;

use super::CliContext;
use chainrig::command::HostCommand;

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Host name, either as declared in the chain file or the full client name
    pub name: String,

    /// Command words, joined with single spaces
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn execute(args: SendArgs, context: &CliContext) -> anyhow::Result<()> {
    let supervisor = context.supervisor();
    let name = if supervisor.handle(&args.name).is_none() && context.has_chain() {
        let (file, _) = context.load_chain()?;
        file.client_name(&args.name)
    } else {
        args.name
    };
    if supervisor.handle(&name).is_none() {
        bail!("no managed host named `{name}`");
    }

    let command = HostCommand::Raw(args.command.join(" "));
    supervisor.send(&name, &command)?;
    info!(name = %name, %command, "command sent");
    println!("sent `{command}` to {name}");
    Ok(())
}
