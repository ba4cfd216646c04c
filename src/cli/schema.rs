use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Args;

use chainrig::chain::ChainFile;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = ChainFile::schema_json()?;
    match args.out {
        Some(path) => {
            fs::write(&path, schema).with_context(|| format!("could not write {}", path.display()))?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{schema}"),
    }
    Ok(())
}
