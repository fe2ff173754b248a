mod completion;
mod factory;
mod items;
mod payload;
mod transfer;

use std::{
    io::{Read, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, SyncSender},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use factory::{DataStoreFactory, StoreOptions};
pub use items::{Item, Items, RawKey};

use self::completion::CompletionLatch;
use crate::{
    codec::{ItemSerialiser, RowKey, RowValue},
    compile::CompiledTable,
    env::{Environment, Table},
    error::{Result, StoreError},
    expression::Generator,
    key::{Key, KeyPart},
    observability::{self, record_store_op},
    val::Val,
};

/// Receives result rows from a search.
pub trait ValuesConsumer {
    fn add(&self, values: &[Val]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct QueueItem {
    pub(crate) row_key: RowKey,
    pub(crate) row_value: RowValue,
}

pub(crate) enum QueueMessage {
    Insert(QueueItem),
    Complete,
}

/// State shared between a store handle, its transfer worker and the items
/// it hands out.
pub(crate) struct Shared {
    pub(crate) env: Arc<Environment>,
    pub(crate) table: Table,
    pub(crate) compiled: CompiledTable,
    pub(crate) serialiser: ItemSerialiser,
    pub(crate) root_key_bytes: Vec<u8>,
    pub(crate) trimmed_sizes: crate::config::Sizes,
    pub(crate) early_limit: Option<u64>,
    pub(crate) payload_limit: usize,
    pub(crate) commit_batch_size: usize,
    pub(crate) total_result_count: AtomicU64,
    pub(crate) result_count: AtomicU64,
    unique_id: AtomicU64,
    pub(crate) has_enough_data: AtomicBool,
    pub(crate) drop_requested: AtomicBool,
    pub(crate) create_payload: AtomicBool,
    complete_requested: AtomicBool,
    dropped: Mutex<bool>,
    pub(crate) current_payload: Mutex<Option<Vec<u8>>>,
    pub(crate) failure: Mutex<Option<String>>,
    pub(crate) completion: CompletionLatch,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn next_unique_id(&self) -> u64 {
        self.unique_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drops the table once. Uses the environment's token so a store that
    /// was interrupted can still release its storage.
    pub(crate) fn drop_table(&self) -> Result<()> {
        let mut dropped = self.dropped.lock();
        if *dropped {
            return Ok(());
        }
        let started = Instant::now();
        let result = self
            .env
            .drop_table(&self.table, self.env.cancellation());
        record_store_op(
            "drop",
            if result.is_ok() { "ok" } else { "err" },
            started.elapsed().as_secs_f64(),
        );
        self.result_count.store(0, Ordering::Release);
        self.total_result_count.store(0, Ordering::Release);
        *dropped = true;
        observability::store_closed();
        result
    }

    pub(crate) fn is_cleared(&self) -> bool {
        self.drop_requested.load(Ordering::Acquire)
    }

    fn failure_error(&self) -> Option<StoreError> {
        self.failure
            .lock()
            .as_ref()
            .map(|message| StoreError::UnexpectedState(format!("transfer failed: {message}")))
    }
}

/// A disk-backed grouped result set for one query component.
///
/// Rows passed to [`DataStore::add`] are split into one keyed item per tree
/// depth and queued for a background worker that merges them into the
/// store's table. Readers call [`DataStore::get`] to fetch the sorted,
/// trimmed children of any key.
pub struct DataStore {
    shared: Arc<Shared>,
    sender: SyncSender<QueueMessage>,
}

impl DataStore {
    pub(crate) fn new(
        env: Arc<Environment>,
        table_name: String,
        compiled: CompiledTable,
        options: StoreOptions,
    ) -> Result<Self> {
        let cancel = env.cancellation().child_token();
        let table = env.create_table(&table_name, &cancel)?;
        let serialiser = ItemSerialiser::new(compiled.fields().len());
        let root_key_bytes = serialiser.key_bytes(&Key::root())?;

        let early_limit = if !compiled.has_sort()
            && !compiled.depths().has_group()
            && !options.max_results.is_unlimited()
        {
            Some(options.max_results.size(0) as u64)
        } else {
            None
        };

        let shared = Arc::new(Shared {
            env,
            table,
            compiled,
            serialiser,
            root_key_bytes,
            trimmed_sizes: options.max_results.min(&options.store_size),
            early_limit,
            payload_limit: options.payload_limit,
            commit_batch_size: options.commit_batch_size,
            total_result_count: AtomicU64::new(0),
            result_count: AtomicU64::new(0),
            unique_id: AtomicU64::new(0),
            has_enough_data: AtomicBool::new(false),
            drop_requested: AtomicBool::new(false),
            create_payload: AtomicBool::new(false),
            complete_requested: AtomicBool::new(false),
            dropped: Mutex::new(false),
            current_payload: Mutex::new(None),
            failure: Mutex::new(None),
            completion: CompletionLatch::new(),
            cancel,
        });

        observability::store_opened();
        let (sender, receiver) = mpsc::sync_channel(options.queue_capacity.max(1));
        let worker = Arc::clone(&shared);
        if let Err(err) = thread::Builder::new()
            .name("resultdbx-transfer".into())
            .spawn(move || transfer::run(worker, receiver))
        {
            if let Err(drop_err) = shared.drop_table() {
                warn!(table = shared.table.name(), "failed to drop result table: {drop_err}");
            }
            return Err(StoreError::Io(err));
        }
        debug!(table = shared.table.name(), "started result store");

        Ok(Self { shared, sender })
    }

    pub fn table_name(&self) -> &str {
        self.shared.table.name()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.shared
            .compiled
            .fields()
            .iter()
            .map(|field| field.name.clone())
            .collect()
    }

    /// Splits one row into its per-depth items and queues them.
    pub fn add(&self, values: &[Val]) -> Result<()> {
        let shared = &self.shared;
        if shared.has_enough_data.load(Ordering::Acquire)
            || shared.drop_requested.load(Ordering::Acquire)
        {
            return Ok(());
        }
        observability::record_rows_added(1);

        let fields = shared.compiled.fields();
        let mut key = Key::root();
        let mut parent_key_bytes = shared.root_key_bytes.clone();

        for (depth, plan) in shared.compiled.depths().plans().iter().enumerate() {
            let mut generators: Vec<Option<Generator>> = vec![None; fields.len()];
            let mut group_values = Vec::with_capacity(plan.group_fields.len());

            for (position, field) in fields.iter().enumerate() {
                let mut generator = None;
                let mut value = None;

                if depth == 0 {
                    if let Some(filter) = &field.filter {
                        let created = field.expression.create_generator(values);
                        let evaluated = created.eval();
                        if !filter.matches(&evaluated.to_string()) {
                            trace!(field = %field.name, "row excluded by filter");
                            return Ok(());
                        }
                        generator = Some(created);
                        value = Some(evaluated);
                    }
                }

                if plan.group_fields.binary_search(&position).is_ok() {
                    let value = match value.take() {
                        Some(value) => value,
                        None => {
                            let created = field.expression.create_generator(values);
                            let evaluated = created.eval();
                            generator = Some(created);
                            evaluated
                        }
                    };
                    group_values.push(value);
                }

                if plan.value_fields.binary_search(&position).is_ok() {
                    generators[position] = Some(match generator {
                        Some(generator) => generator,
                        None => field.expression.create_generator(values),
                    });
                }
            }

            let generator_bytes = shared.serialiser.generator_bytes(&generators)?;
            if plan.grouped {
                key = key.resolve(KeyPart::Group(group_values));
                let key_bytes = shared.serialiser.key_bytes(&key)?;
                let row_key = RowKey::grouped(depth, &parent_key_bytes, &key_bytes);
                let row_value = RowValue::new(&key_bytes, &generator_bytes);
                self.put(QueueItem { row_key, row_value })?;
                parent_key_bytes = key_bytes;
            } else {
                let unique_id = shared.next_unique_id();
                key = key.resolve(KeyPart::Ungrouped(unique_id));
                let key_bytes = shared.serialiser.key_bytes(&key)?;
                let row_key = RowKey::ungrouped(depth, &parent_key_bytes, unique_id);
                let row_value = RowValue::new(&key_bytes, &generator_bytes);
                self.put(QueueItem { row_key, row_value })?;
                parent_key_bytes = key_bytes;
            }
        }
        Ok(())
    }

    /// Queues one item, stopping early for unsorted, ungrouped stores that
    /// already hold enough rows.
    pub(crate) fn put(&self, item: QueueItem) -> Result<()> {
        let shared = &self.shared;
        if shared.cancel.is_cancelled()
            || shared.has_enough_data.load(Ordering::Acquire)
            || shared.drop_requested.load(Ordering::Acquire)
        {
            return Ok(());
        }

        let total = shared.total_result_count.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = shared.early_limit {
            if total >= limit {
                shared.has_enough_data.store(true, Ordering::Release);
            }
        }

        self.send(QueueMessage::Insert(item))
    }

    fn send(&self, message: QueueMessage) -> Result<()> {
        if self.sender.send(message).is_ok() {
            return Ok(());
        }
        // The worker has exited.
        if let Some(err) = self.shared.failure_error() {
            return Err(err);
        }
        if self.shared.cancel.is_cancelled() {
            return Err(StoreError::Interrupted(
                "result store no longer accepts rows".into(),
            ));
        }
        Ok(())
    }

    /// Signals that no more rows will be added. The worker commits what it
    /// holds and exits.
    pub fn complete(&self) {
        if self.shared.complete_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.sender.send(QueueMessage::Complete).is_err() {
            trace!(table = self.table_name(), "transfer already stopped");
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.completion.is_released()
    }

    /// Waits for the transfer worker to finish, surfacing any failure it hit.
    pub fn await_completion(&self) -> Result<()> {
        if let Err(err) = self.shared.completion.wait(&self.shared.cancel) {
            return Err(self.shared.failure_error().unwrap_or(err));
        }
        match self.shared.failure_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn await_completion_timeout(&self, timeout: Duration) -> bool {
        self.shared.completion.wait_timeout(timeout)
    }

    /// Interrupts the transfer worker and every wait made on behalf of this
    /// store.
    pub fn interrupt(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn has_enough_data(&self) -> bool {
        self.shared.has_enough_data.load(Ordering::Acquire)
    }

    /// Discards all results and releases the table. Safe to call repeatedly.
    /// The store reads as empty from the moment this returns, even while the
    /// worker is still winding down.
    pub fn clear(&self) -> Result<()> {
        self.shared.drop_requested.store(true, Ordering::Release);
        self.complete();
        if self.shared.completion.is_released() {
            self.shared.drop_table()?;
        }
        Ok(())
    }

    /// Number of distinct entries stored.
    pub fn size(&self) -> u64 {
        if self.shared.is_cleared() {
            return 0;
        }
        self.shared.result_count.load(Ordering::Acquire)
    }

    /// Number of items offered to the store before merging.
    pub fn total_size(&self) -> u64 {
        if self.shared.is_cleared() {
            return 0;
        }
        self.shared.total_result_count.load(Ordering::Acquire)
    }

    /// Children of `parent`, sorted and trimmed for their depth.
    pub fn get(&self, parent: &Key) -> Result<Items> {
        let started = Instant::now();
        let result = items::get(&self.shared, parent);
        record_store_op(
            "get",
            if result.is_ok() { "ok" } else { "err" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Like [`DataStore::get`] for a key taken from an earlier item; `None`
    /// addresses the root.
    pub fn get_raw(&self, parent: Option<&RawKey>) -> Result<Items> {
        let parent = match parent {
            Some(raw) => self.shared.serialiser.to_key(raw.as_bytes())?,
            None => Key::root(),
        };
        self.get(&parent)
    }

    pub fn write_payload<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let started = Instant::now();
        let result = payload::write_payload(&self.shared, writer);
        record_store_op(
            "write_payload",
            if result.is_ok() { "ok" } else { "err" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    /// Merges a payload produced by another store of the same shape. Returns
    /// whether this store still wants more data.
    pub fn read_payload<R: Read + ?Sized>(&self, reader: &mut R) -> Result<bool> {
        let started = Instant::now();
        let result = payload::read_payload(self, reader);
        record_store_op(
            "read_payload",
            if result.is_ok() { "ok" } else { "err" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl ValuesConsumer for DataStore {
    fn add(&self, values: &[Val]) -> Result<()> {
        DataStore::add(self, values)
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            warn!(table = self.table_name(), "failed to clear result store: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::write_entry,
        compile::{FieldSettings, TableSettings},
        config::{ResultStoreConfig, Sizes},
        expression::FieldIndex,
    };
    use tempfile::tempdir;

    fn settings(group: Option<usize>) -> TableSettings {
        TableSettings {
            fields: vec![FieldSettings {
                name: "value".into(),
                group,
                ..FieldSettings::default()
            }],
            show_detail: false,
        }
    }

    #[test]
    fn duplicate_ungrouped_rows_fail_the_transfer() {
        let temp = tempdir().unwrap();
        let config = ResultStoreConfig {
            data_dir: temp.path().join("env"),
            ..ResultStoreConfig::default()
        };
        let factory = DataStoreFactory::open(config).expect("open factory");
        let mut index = FieldIndex::new();
        let store = factory
            .create("q", "c", &settings(None), &mut index, None)
            .expect("create store");

        let shared = store.shared();
        let key_bytes = shared
            .serialiser
            .key_bytes(&Key::root().resolve(KeyPart::Ungrouped(1)))
            .unwrap();
        let generators = shared
            .serialiser
            .generator_bytes(&[Some(Generator::Value(Val::Long(1)))])
            .unwrap();
        let item = QueueItem {
            row_key: RowKey::ungrouped(0, &shared.root_key_bytes, 1),
            row_value: RowValue::new(&key_bytes, &generators),
        };

        store.put(item.clone()).expect("first put");
        // A send after the worker stops reports its failure.
        let _ = store.put(item);
        store.complete();

        let err = store.await_completion().unwrap_err();
        assert!(err.is_unexpected_state(), "unexpected error: {err}");
        assert!(store.is_complete());
    }

    #[test]
    fn collided_entries_count_once_each() {
        let temp = tempdir().unwrap();
        let config = ResultStoreConfig {
            data_dir: temp.path().join("env"),
            ..ResultStoreConfig::default()
        };
        let factory = DataStoreFactory::open(config).expect("open factory");
        let mut index = FieldIndex::new();
        let store = factory
            .create("q", "c", &settings(Some(0)), &mut index, None)
            .expect("create store");

        let shared = store.shared();
        let group = |name: &str| {
            let key = Key::root().resolve(KeyPart::Group(vec![Val::from(name)]));
            let key_bytes = shared.serialiser.key_bytes(&key).unwrap();
            let generators = shared
                .serialiser
                .generator_bytes(&[Some(Generator::Value(Val::from(name)))])
                .unwrap();
            (key_bytes, generators)
        };
        let (a_key, a_generators) = group("A");
        let (b_key, b_generators) = group("B");

        // Both entries share A's row key, as a hash collision would.
        let mut collided = Vec::new();
        write_entry(&mut collided, &a_key, &a_generators);
        write_entry(&mut collided, &b_key, &b_generators);
        let row_key = RowKey::grouped(0, &shared.root_key_bytes, &a_key);
        store
            .put(QueueItem {
                row_key: row_key.clone(),
                row_value: RowValue::from_bytes(collided),
            })
            .expect("collided put");
        store
            .put(QueueItem {
                row_key,
                row_value: RowValue::new(&a_key, &a_generators),
            })
            .expect("merging put");
        store.complete();
        store.await_completion().expect("transfer succeeds");

        assert_eq!(store.size(), 2);
        assert_eq!(store.get(&Key::root()).unwrap().len(), 2);
    }

    #[test]
    fn early_termination_only_applies_without_groups_or_sorting() {
        let temp = tempdir().unwrap();
        let config = ResultStoreConfig {
            data_dir: temp.path().join("env"),
            ..ResultStoreConfig::default()
        };
        let factory = DataStoreFactory::open(config).expect("open factory");
        let limit = Some(Sizes::new(vec![5]));

        let mut index = FieldIndex::new();
        let flat = factory
            .create("q", "flat", &settings(None), &mut index, limit.clone())
            .expect("create flat store");
        assert_eq!(flat.shared().early_limit, Some(5));

        let mut index = FieldIndex::new();
        let grouped = factory
            .create("q", "grouped", &settings(Some(0)), &mut index, limit)
            .expect("create grouped store");
        assert_eq!(grouped.shared().early_limit, None);

        let mut index = FieldIndex::new();
        let unlimited = factory
            .create("q", "unlimited", &settings(None), &mut index, None)
            .expect("create unlimited store");
        assert_eq!(unlimited.shared().early_limit, None);
    }

    #[test]
    fn trimmed_sizes_take_the_smaller_limit_per_depth() {
        let temp = tempdir().unwrap();
        let config = ResultStoreConfig {
            data_dir: temp.path().join("env"),
            store_size: Sizes::new(vec![50, 5]),
            ..ResultStoreConfig::default()
        };
        let factory = DataStoreFactory::open(config).expect("open factory");
        let mut index = FieldIndex::new();
        let store = factory
            .create(
                "q",
                "c",
                &settings(Some(0)),
                &mut index,
                Some(Sizes::new(vec![100, 2])),
            )
            .expect("create store");

        let trimmed = &store.shared().trimmed_sizes;
        assert_eq!(trimmed.size(0), 50);
        assert_eq!(trimmed.size(1), 2);
        assert_eq!(trimmed.size(7), 2);
    }
}
