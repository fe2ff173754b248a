mod permits;
mod txn;

use std::{
    collections::{BTreeSet, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rocksdb::{MultiThreaded, Options, TransactionDB, TransactionDBOptions};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use permits::{Permit, ReadPermits};
pub use txn::{BatchingWriteTxn, ReadTxn, WriteTxn};

use crate::error::{Result, StoreError};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_LOG_INTERVAL: Duration = Duration::from_secs(1);

static OPEN_ENVIRONMENTS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub path: PathBuf,
    pub max_readers: usize,
    pub readers_blocked_by_writer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub path: String,
    pub max_readers: usize,
    pub available_read_permits: usize,
    pub readers_blocked_by_writer: bool,
    pub tables: Vec<String>,
    pub size_on_disk: u64,
}

/// Handle to one table (column family) inside an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Table {
    name: String,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An on-disk store shared by many result tables: one writer at a time and a
/// bounded number of concurrent readers.
pub struct Environment {
    path: PathBuf,
    db: TransactionDB<MultiThreaded>,
    // Dropped after `db`, so the files are closed before they are removed.
    _dir: EnvDir,
    write_lock: RwLock<()>,
    read_permits: ReadPermits,
    max_readers: usize,
    readers_blocked_by_writer: bool,
    tables: Mutex<BTreeSet<String>>,
    cancel: CancellationToken,
}

impl Environment {
    /// Opens a fresh environment in its own directory under `config.path`.
    /// Nothing already under `config.path` is touched, and the private
    /// directory is removed again when the environment closes.
    pub fn open(config: &EnvironmentConfig) -> Result<Arc<Self>> {
        if config.max_readers == 0 {
            return Err(StoreError::Config("max_readers must be at least 1".into()));
        }
        let dir = config.path.join(format!("env-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        let path = canonical(&dir)?;
        let dir = EnvDir { path: path.clone() };

        {
            let mut open = OPEN_ENVIRONMENTS.lock();
            if !open.insert(path.clone()) {
                return Err(StoreError::StillOpen(path.display().to_string()));
            }
        }

        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let db = match TransactionDB::open(&options, &TransactionDBOptions::default(), &path) {
            Ok(db) => db,
            Err(err) => {
                OPEN_ENVIRONMENTS.lock().remove(&path);
                return Err(
                    StoreError::from(err).in_transaction("open", &path.display().to_string())
                );
            }
        };

        info!(
            path = %path.display(),
            max_readers = config.max_readers,
            readers_blocked_by_writer = config.readers_blocked_by_writer,
            "opened result environment"
        );

        Ok(Arc::new(Self {
            path,
            db,
            _dir: dir,
            write_lock: RwLock::new(()),
            read_permits: ReadPermits::new(config.max_readers),
            max_readers: config.max_readers,
            readers_blocked_by_writer: config.readers_blocked_by_writer,
            tables: Mutex::new(BTreeSet::new()),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    /// Environment-wide cancellation. Stores derive child tokens from it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Interrupts every wait on this environment and on stores created in it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn create_table(&self, name: &str, cancel: &CancellationToken) -> Result<Table> {
        let _guard = self.lock_write(cancel)?;
        if self.db.cf_handle(name).is_none() {
            self.db
                .create_cf(name, &Options::default())
                .map_err(|err| {
                    StoreError::from(err).in_transaction("create table", &self.display_path())
                })?;
            info!(table = name, "created result table");
        }
        self.tables.lock().insert(name.to_string());
        Ok(Table {
            name: name.to_string(),
        })
    }

    /// Drops the table and reclaims its storage. Dropping a missing table is
    /// not an error.
    pub fn drop_table(&self, table: &Table, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_write(cancel)?;
        if self.db.cf_handle(table.name()).is_some() {
            self.db.drop_cf(table.name()).map_err(|err| {
                StoreError::from(err).in_transaction("drop table", &self.display_path())
            })?;
            info!(table = table.name(), "dropped result table");
        }
        self.tables.lock().remove(table.name());
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().iter().cloned().collect()
    }

    fn lock_write(&self, cancel: &CancellationToken) -> Result<RwLockWriteGuard<'_, ()>> {
        let started = Instant::now();
        let mut last_log = started;
        loop {
            if let Some(guard) = self.write_lock.try_write_for(LOCK_POLL_INTERVAL) {
                let waited = started.elapsed();
                if waited >= LOCK_LOG_INTERVAL {
                    debug!(waited_ms = waited.as_millis() as u64, "acquired write lock");
                }
                return Ok(guard);
            }
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted("waiting for the write lock".into()));
            }
            if last_log.elapsed() >= LOCK_LOG_INTERVAL {
                debug!(
                    path = %self.path.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "waiting for the write lock"
                );
                last_log = Instant::now();
            }
        }
    }

    fn lock_read(&self, cancel: &CancellationToken) -> Result<Option<RwLockReadGuard<'_, ()>>> {
        if !self.readers_blocked_by_writer {
            return Ok(None);
        }
        let started = Instant::now();
        let mut last_log = started;
        loop {
            if let Some(guard) = self.write_lock.try_read_for(LOCK_POLL_INTERVAL) {
                return Ok(Some(guard));
            }
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted(
                    "waiting for the writer to finish".into(),
                ));
            }
            if last_log.elapsed() >= LOCK_LOG_INTERVAL {
                debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "reader waiting for the writer to finish"
                );
                last_log = Instant::now();
            }
        }
    }

    /// Opens an explicit write handle. The lock is held until it drops.
    pub fn open_write_txn(&self, cancel: &CancellationToken) -> Result<WriteTxn<'_>> {
        let guard = self.lock_write(cancel)?;
        Ok(WriteTxn::new(self, guard))
    }

    pub fn open_batching_write_txn(
        &self,
        cancel: &CancellationToken,
        batch_size: usize,
    ) -> Result<BatchingWriteTxn<'_>> {
        Ok(BatchingWriteTxn::new(self.open_write_txn(cancel)?, batch_size))
    }

    /// Runs `work` in a single write transaction and commits it. Nothing is
    /// committed when `work` fails.
    pub fn with_write_txn<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut txn = self.open_write_txn(cancel)?;
        let value =
            work(&mut txn).map_err(|err| err.in_transaction("write", &self.display_path()))?;
        txn.commit()?;
        Ok(value)
    }

    pub fn open_read_txn(&self, cancel: &CancellationToken) -> Result<ReadTxn<'_>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Interrupted("opening a read transaction".into()));
        }
        let permit = self.read_permits.acquire(cancel)?;
        let guard = self.lock_read(cancel)?;
        Ok(ReadTxn::new(self, permit, guard))
    }

    pub fn with_read_txn<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T>,
    {
        let txn = self.open_read_txn(cancel)?;
        work(&txn).map_err(|err| err.in_transaction("read", &self.display_path()))
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    pub fn available_read_permits(&self) -> usize {
        self.read_permits.available()
    }

    pub fn size_on_disk(&self) -> u64 {
        directory_size(&self.path)
    }

    pub fn info(&self) -> EnvironmentInfo {
        EnvironmentInfo {
            path: self.display_path(),
            max_readers: self.max_readers,
            available_read_permits: self.available_read_permits(),
            readers_blocked_by_writer: self.readers_blocked_by_writer,
            tables: self.table_names(),
            size_on_disk: self.size_on_disk(),
        }
    }

    /// Closes the environment and removes its files. Fails while other
    /// handles to it are still alive.
    pub fn delete(self: Arc<Self>) -> Result<()> {
        let path = self.path.clone();
        match Arc::try_unwrap(self) {
            Ok(env) => {
                drop(env);
                Self::destroy(&path)
            }
            Err(_) => Err(StoreError::StillOpen(path.display().to_string())),
        }
    }

    /// Removes the files of a closed environment.
    pub fn destroy(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let path = canonical(path)?;
        if OPEN_ENVIRONMENTS.lock().contains(&path) {
            return Err(StoreError::StillOpen(path.display().to_string()));
        }
        fs::remove_dir_all(&path)?;
        info!(path = %path.display(), "deleted result environment");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.cancel.cancel();
        OPEN_ENVIRONMENTS.lock().remove(&self.path);
        debug!(path = %self.path.display(), "closed result environment");
    }
}

/// Owns an environment's private directory.
struct EnvDir {
    path: PathBuf,
}

impl Drop for EnvDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed environment directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.path.display(),
                "failed to remove environment directory: {err}"
            ),
        }
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    Ok(fs::canonicalize(path)?)
}

fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => directory_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
