use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Instant,
};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use rocksdb::{
    BoundColumnFamily, Direction, IteratorMode, MultiThreaded, SnapshotWithThreadMode,
    Transaction, TransactionDB,
};
use tracing::trace;

use super::{Environment, Table, permits::Permit};
use crate::{
    error::{Result, StoreError},
    observability::record_store_op,
};

type Db = TransactionDB<MultiThreaded>;

/// Exclusive write access to an environment. The underlying transaction is
/// opened on first use and rolled back unless committed; the write lock is
/// released when the handle drops.
pub struct WriteTxn<'env> {
    txn: Option<Transaction<'env, Db>>,
    env: &'env Environment,
    _guard: RwLockWriteGuard<'env, ()>,
}

impl<'env> WriteTxn<'env> {
    pub(super) fn new(env: &'env Environment, guard: RwLockWriteGuard<'env, ()>) -> Self {
        Self {
            txn: None,
            env,
            _guard: guard,
        }
    }

    fn txn(&mut self) -> &Transaction<'env, Db> {
        self.txn.get_or_insert_with(|| self.env.db.transaction())
    }

    fn column_family(&self, table: &Table) -> Result<Arc<BoundColumnFamily<'env>>> {
        self.env.db.cf_handle(table.name()).ok_or_else(|| {
            StoreError::Storage(format!("table {} does not exist", table.name()))
        })
    }

    pub fn put(&mut self, table: &Table, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.column_family(table)?;
        self.txn().put_cf(&cf, key, value)?;
        Ok(())
    }

    /// Stores the value only when the key is absent. Returns whether it was
    /// written.
    pub fn put_if_absent(&mut self, table: &Table, key: &[u8], value: &[u8]) -> Result<bool> {
        let cf = self.column_family(table)?;
        let txn = self.txn();
        if txn.get_pinned_cf(&cf, key)?.is_some() {
            return Ok(false);
        }
        txn.put_cf(&cf, key, value)?;
        Ok(true)
    }

    pub fn get(&mut self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.column_family(table)?;
        Ok(self.txn().get_cf(&cf, key)?)
    }

    pub fn delete(&mut self, table: &Table, key: &[u8]) -> Result<()> {
        let cf = self.column_family(table)?;
        self.txn().delete_cf(&cf, key)?;
        Ok(())
    }

    /// Visits entries from `start` onwards until `visit` returns false.
    pub fn scan_from<F>(&mut self, table: &Table, start: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let cf = self.column_family(table)?;
        let iter = self
            .txn()
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Commits staged writes while keeping the write lock.
    pub(super) fn commit_pending(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let started = Instant::now();
        let result = txn.commit().map_err(|err| {
            StoreError::from(err).in_transaction("commit", &self.env.display_path())
        });
        record_store_op(
            "commit",
            if result.is_ok() { "ok" } else { "err" },
            started.elapsed().as_secs_f64(),
        );
        trace!(path = %self.env.display_path(), "committed write transaction");
        result
    }

    pub(super) fn rollback_pending(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Err(err) = txn.rollback() {
                tracing::warn!("failed to roll back write transaction: {err}");
            }
        }
    }

    pub fn commit(mut self) -> Result<()> {
        self.commit_pending()
    }

    pub fn abort(mut self) {
        self.rollback_pending();
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.rollback_pending();
    }
}

/// A write handle that keeps the lock across several commits, committing
/// automatically every `batch_size` units of work. A batch size of zero only
/// commits when asked.
pub struct BatchingWriteTxn<'env> {
    inner: WriteTxn<'env>,
    batch_size: usize,
    batch_count: usize,
}

impl<'env> BatchingWriteTxn<'env> {
    pub(super) fn new(inner: WriteTxn<'env>, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size,
            batch_count: 0,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn increment_batch_count(&mut self) {
        self.batch_count += 1;
    }

    /// Counts one unit of work and commits once the batch is full. Returns
    /// whether a commit happened.
    pub fn commit_if_required(&mut self) -> Result<bool> {
        self.increment_batch_count();
        if self.batch_size > 0 && self.batch_count >= self.batch_size {
            self.commit()?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn commit(&mut self) -> Result<()> {
        self.batch_count = 0;
        self.inner.commit_pending()
    }

    pub fn abort(&mut self) {
        self.batch_count = 0;
        self.inner.rollback_pending();
    }
}

impl<'env> Deref for BatchingWriteTxn<'env> {
    type Target = WriteTxn<'env>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BatchingWriteTxn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Snapshot read access holding one reader permit, and in
/// readers-blocked-by-writer mode the shared side of the write lock.
pub struct ReadTxn<'env> {
    snapshot: SnapshotWithThreadMode<'env, Db>,
    env: &'env Environment,
    _guard: Option<RwLockReadGuard<'env, ()>>,
    _permit: Permit<'env>,
}

impl<'env> ReadTxn<'env> {
    pub(super) fn new(
        env: &'env Environment,
        permit: Permit<'env>,
        guard: Option<RwLockReadGuard<'env, ()>>,
    ) -> Self {
        Self {
            snapshot: env.db.snapshot(),
            env,
            _guard: guard,
            _permit: permit,
        }
    }

    pub fn get(&self, table: &Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(cf) = self.env.db.cf_handle(table.name()) else {
            return Ok(None);
        };
        Ok(self.snapshot.get_cf(&cf, key)?)
    }

    /// Visits entries from `start` onwards until `visit` returns false. A
    /// dropped table reads as empty.
    pub fn scan_from<F>(&self, table: &Table, start: &[u8], mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        let Some(cf) = self.env.db.cf_handle(table.name()) else {
            return Ok(());
        };
        let iter = self
            .snapshot
            .iterator_cf(&cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !visit(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}
