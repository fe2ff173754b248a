use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use resultdbx::{DataStoreFactory, FieldIndex, Sizes, config::load_or_default};

use super::{load_table, parse_row, print_json, render_tree};

#[derive(Args)]
pub struct RunArgs {
    /// Table definition (TOML, or JSON with a .json extension)
    #[arg(long)]
    pub table: PathBuf,

    /// JSON lines input; reads stdin when omitted
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Per-depth result limits such as "100,10,1"
    #[arg(long, value_name = "SIZES")]
    pub max_results: Option<Sizes>,

    /// Write the final payload to this file after printing the results
    #[arg(long)]
    pub payload_out: Option<PathBuf>,
}

pub fn execute(config_path: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let config = load_or_default(config_path)?;
    let settings = load_table(&args.table)?;
    let factory = DataStoreFactory::open(config)?;

    let mut index = FieldIndex::new();
    let store = factory.create("cli", "run", &settings, &mut index, args.max_results)?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut accepted = 0usize;
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let row = match parse_row(&line, &index) {
            Ok(row) => row,
            Err(err) => {
                warn!("skipping line {}: {err:#}", number + 1);
                continue;
            }
        };
        store.add(&row)?;
        accepted += 1;
        if store.has_enough_data() {
            info!("result limit reached after {accepted} rows");
            break;
        }
    }

    store.complete();
    store.await_completion()?;
    print_json(&render_tree(&store)?)?;

    if let Some(path) = &args.payload_out {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        store.write_payload(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), "wrote payload");
    }

    store.clear()?;
    Ok(())
}
