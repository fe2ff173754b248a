use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};

use resultdbx::{DataStore, FieldIndex, Key, TableSettings, Val};

pub mod info;
pub mod merge;
pub mod run;

/// Reads a table definition. `.json` files are parsed as JSON, anything else
/// as TOML.
pub(crate) fn load_table(path: &Path) -> Result<TableSettings> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read table definition {}", path.display()))?;
    let settings = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => serde_json::from_str(&contents)
            .with_context(|| format!("invalid table definition {}", path.display()))?,
        _ => toml::from_str(&contents)
            .with_context(|| format!("invalid table definition {}", path.display()))?,
    };
    Ok(settings)
}

/// Converts one JSON line into a row laid out by `index`. Objects are read by
/// field name, arrays by position.
pub(crate) fn parse_row(line: &str, index: &FieldIndex) -> Result<Vec<Val>> {
    let value: Value = serde_json::from_str(line).context("row is not valid JSON")?;
    let mut row = vec![Val::Null; index.len()];
    match value {
        Value::Object(fields) => {
            for (name, value) in &fields {
                if let Some(position) = index.get(name) {
                    row[position] = Val::from_json(value);
                }
            }
        }
        Value::Array(values) => {
            for (slot, value) in row.iter_mut().zip(&values) {
                *slot = Val::from_json(value);
            }
        }
        other => anyhow::bail!("expected a JSON object or array, found {other}"),
    }
    Ok(row)
}

#[derive(Debug, Serialize)]
pub(crate) struct TreeNode {
    key: String,
    values: JsonMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<TreeNode>,
}

/// Walks the store from the root, resolving every field of every item.
pub(crate) fn render_tree(store: &DataStore) -> Result<Vec<TreeNode>> {
    let names = store.field_names();
    collect(store, &Key::root(), &names)
}

fn collect(store: &DataStore, parent: &Key, names: &[String]) -> Result<Vec<TreeNode>> {
    let mut nodes = Vec::new();
    for item in &store.get(parent)? {
        let mut values = JsonMap::new();
        for (position, name) in names.iter().enumerate() {
            values.insert(name.clone(), item.value(position)?.to_json());
        }
        nodes.push(TreeNode {
            key: item.key().to_string(),
            values,
            children: collect(store, item.key(), names)?,
        });
    }
    Ok(nodes)
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
