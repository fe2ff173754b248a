use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("{operation} failed for environment {path}: {source}")]
    Transaction {
        operation: &'static str,
        path: String,
        #[source]
        source: Box<StoreError>,
    },
    #[error("interrupted: {0}")]
    Interrupted(String),
    #[error("unexpected state: {0}")]
    UnexpectedState(String),
    #[error("environment is still open: {0}")]
    StillOpen(String),
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Wraps a failure raised inside a transaction. Interrupts pass through
    /// untouched so callers can still recognise them.
    pub fn in_transaction(self, operation: &'static str, path: &str) -> Self {
        match self {
            err @ Self::Interrupted(_) => err,
            err @ Self::Transaction { .. } => err,
            other => Self::Transaction {
                operation,
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted(_) => true,
            Self::Transaction { source, .. } => source.is_interrupted(),
            _ => false,
        }
    }

    pub fn is_unexpected_state(&self) -> bool {
        match self {
            Self::UnexpectedState(_) => true,
            Self::Transaction { source, .. } => source.is_unexpected_state(),
            _ => false,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<regex::Error> for StoreError {
    fn from(err: regex::Error) -> Self {
        Self::InvalidExpression(err.to_string())
    }
}
