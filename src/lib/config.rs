use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    env::EnvironmentConfig,
    error::{Result, StoreError},
};

const CONFIG_DIR: &str = "resultdbx";
const CONFIG_FILE: &str = "config.toml";

/// Per-depth limits written as `"1000000,100,10,1"`. Depths past the last
/// entry reuse the last value; an empty list means no limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sizes(Vec<usize>);

impl Sizes {
    pub fn unlimited() -> Self {
        Self(Vec::new())
    }

    pub fn new(sizes: Vec<usize>) -> Self {
        Self(sizes)
    }

    pub fn size(&self, depth: usize) -> usize {
        self.0
            .get(depth)
            .or_else(|| self.0.last())
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Depth-wise minimum of two limits.
    pub fn min(&self, other: &Sizes) -> Sizes {
        let depths = self.0.len().max(other.0.len());
        Sizes((0..depths).map(|depth| self.size(depth).min(other.size(depth))).collect())
    }

    pub fn is_unlimited(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Sizes {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(Self::unlimited());
        }
        value
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|err| StoreError::Config(format!("invalid size '{part}': {err}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Sizes)
    }
}

impl fmt::Display for Sizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl Serialize for Sizes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sizes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            List(Vec<usize>),
            Single(usize),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::List(sizes) => Ok(Sizes(sizes)),
            Repr::Single(size) => Ok(Sizes(vec![size])),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_readers")]
    pub max_readers: usize,
    #[serde(default)]
    pub readers_blocked_by_writer: bool,
    /// Inserts per automatic commit; zero leaves commits to the transfer
    /// loop's timer.
    #[serde(default)]
    pub commit_batch_size: usize,
    /// Byte budget for incremental payloads; zero means unbounded.
    #[serde(default)]
    pub payload_limit: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub max_results: Sizes,
    #[serde(default = "default_store_size")]
    pub store_size: Sizes,
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join(CONFIG_DIR)
}

fn default_max_readers() -> usize {
    126
}

fn default_queue_capacity() -> usize {
    1_000_000
}

fn default_store_size() -> Sizes {
    Sizes(vec![1_000_000, 100, 10, 1])
}

impl Default for ResultStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_readers: default_max_readers(),
            readers_blocked_by_writer: false,
            commit_batch_size: 0,
            payload_limit: 0,
            queue_capacity: default_queue_capacity(),
            max_results: Sizes::unlimited(),
            store_size: default_store_size(),
        }
    }
}

impl ResultStoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_readers == 0 {
            return Err(StoreError::Config("max_readers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StoreError::Config("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn environment(&self) -> EnvironmentConfig {
        EnvironmentConfig {
            path: self.data_dir.clone(),
            max_readers: self.max_readers,
            readers_blocked_by_writer: self.readers_blocked_by_writer,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Loads the given file, or the per-user default when it exists, falling back
/// to built-in defaults.
pub fn load_or_default(path: Option<PathBuf>) -> Result<ResultStoreConfig> {
    match path {
        Some(path) => ResultStoreConfig::load(&path),
        None => match default_config_path() {
            Some(path) if path.exists() => ResultStoreConfig::load(&path),
            _ => Ok(ResultStoreConfig::default()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_reuse_the_last_depth() {
        let sizes: Sizes = "100,10,1".parse().expect("sizes parse");
        assert_eq!(sizes.size(0), 100);
        assert_eq!(sizes.size(2), 1);
        assert_eq!(sizes.size(7), 1);
        assert_eq!(Sizes::unlimited().size(3), usize::MAX);
        assert!("10,x".parse::<Sizes>().is_err());
    }

    #[test]
    fn sizes_take_the_smaller_limit() {
        let store = Sizes::new(vec![1_000_000, 100, 10, 1]);
        let results = Sizes::new(vec![50]);
        let combined = store.min(&results);
        assert_eq!(combined.size(0), 50);
        assert_eq!(combined.size(1), 50);
        assert_eq!(combined.size(3), 1);
        assert_eq!(Sizes::unlimited().min(&results).size(4), 50);
    }

    #[test]
    fn config_reads_strings_or_lists() {
        let config: ResultStoreConfig = toml::from_str(
            r#"
            max_readers = 4
            max_results = "100,10"
            store_size = [5, 1]
            "#,
        )
        .expect("config parses");
        assert_eq!(config.max_readers, 4);
        assert_eq!(config.max_results, Sizes::new(vec![100, 10]));
        assert_eq!(config.store_size, Sizes::new(vec![5, 1]));
        assert_eq!(config.queue_capacity, 1_000_000);
        assert!(!config.readers_blocked_by_writer);
    }

    #[test]
    fn load_rejects_zero_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_readers = 0\n").unwrap();
        assert!(matches!(
            ResultStoreConfig::load(&path),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "commit_batch_size = 25\n").unwrap();
        let config = load_or_default(Some(path)).expect("config loads");
        assert_eq!(config.commit_batch_size, 25);
        assert_eq!(config.store_size.size(0), 1_000_000);
    }
}
