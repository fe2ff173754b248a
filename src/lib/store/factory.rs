use std::sync::Arc;

use uuid::Uuid;

use super::DataStore;
use crate::{
    compile::{CompiledTable, TableSettings},
    config::{ResultStoreConfig, Sizes},
    env::Environment,
    error::Result,
    expression::FieldIndex,
    observability,
};

/// Per-store limits resolved from configuration and the request.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_results: Sizes,
    pub store_size: Sizes,
    pub payload_limit: usize,
    pub commit_batch_size: usize,
    pub queue_capacity: usize,
}

impl StoreOptions {
    pub fn from_config(config: &ResultStoreConfig) -> Self {
        Self {
            max_results: config.max_results.clone(),
            store_size: config.store_size.clone(),
            payload_limit: config.payload_limit,
            commit_batch_size: config.commit_batch_size,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Creates result stores inside one shared environment.
pub struct DataStoreFactory {
    env: Arc<Environment>,
    config: ResultStoreConfig,
}

impl DataStoreFactory {
    /// Opens the environment named by `config`.
    pub fn open(config: ResultStoreConfig) -> Result<Self> {
        observability::describe();
        config.validate()?;
        let env = Environment::open(&config.environment())?;
        Ok(Self { env, config })
    }

    pub fn new(env: Arc<Environment>, config: ResultStoreConfig) -> Self {
        observability::describe();
        Self { env, config }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn config(&self) -> &ResultStoreConfig {
        &self.config
    }

    /// Compiles `settings` and creates a store in a fresh table. Field names
    /// referenced by the table's expressions are registered in `index`, which
    /// fixes the layout rows passed to [`DataStore::add`] must follow.
    /// `max_results` overrides the configured limit for this store.
    pub fn create(
        &self,
        query_key: &str,
        component_id: &str,
        settings: &TableSettings,
        index: &mut FieldIndex,
        max_results: Option<Sizes>,
    ) -> Result<DataStore> {
        let compiled = CompiledTable::compile(settings, index)?;
        let mut options = StoreOptions::from_config(&self.config);
        if let Some(max_results) = max_results {
            options.max_results = max_results;
        }
        let table_name = format!("{query_key}_{component_id}_{}", Uuid::new_v4());
        DataStore::new(Arc::clone(&self.env), table_name, compiled, options)
    }
}
