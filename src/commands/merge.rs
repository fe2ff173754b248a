use std::{fs::File, io::BufReader, path::PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use resultdbx::{DataStoreFactory, FieldIndex, config::load_or_default};

use super::{load_table, print_json, render_tree};

#[derive(Args)]
pub struct MergeArgs {
    /// Table definition the payloads were produced with
    #[arg(long)]
    pub table: PathBuf,

    /// Payload files written by `run --payload-out`
    #[arg(required = true)]
    pub payloads: Vec<PathBuf>,
}

pub fn execute(config_path: Option<PathBuf>, args: MergeArgs) -> Result<()> {
    let config = load_or_default(config_path)?;
    let settings = load_table(&args.table)?;
    let factory = DataStoreFactory::open(config)?;

    let mut index = FieldIndex::new();
    let store = factory.create("cli", "merge", &settings, &mut index, None)?;

    for path in &args.payloads {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let wants_more = store
            .read_payload(&mut BufReader::new(file))
            .with_context(|| format!("failed to read payload {}", path.display()))?;
        info!(path = %path.display(), "merged payload");
        if !wants_more {
            break;
        }
    }

    store.complete();
    store.await_completion()?;
    print_json(&render_tree(&store)?)?;
    store.clear()?;
    Ok(())
}
