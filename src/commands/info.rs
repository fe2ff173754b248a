use std::path::PathBuf;

use anyhow::Result;

use resultdbx::{DataStoreFactory, config::load_or_default};

use super::print_json;

pub fn execute(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_or_default(config_path)?;
    let factory = DataStoreFactory::open(config)?;
    print_json(&factory.environment().info())
}
