use std::{
    sync::{
        Arc,
        atomic::Ordering,
        mpsc::{Receiver, RecvTimeoutError},
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, trace};

use super::{QueueItem, QueueMessage, Shared, payload};
use crate::{
    codec::{ValueEntries, write_entry},
    env::{BatchingWriteTxn, WriteTxn},
    error::{Result, StoreError},
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const COMMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// Body of a store's transfer thread: drains the queue into the table until
/// the store completes or is interrupted, then releases the completion latch.
pub(crate) fn run(shared: Arc<Shared>, receiver: Receiver<QueueMessage>) {
    let table = shared.table.name().to_string();
    match transfer(&shared, &receiver) {
        Ok(()) => debug!(table = %table, "transfer complete"),
        Err(err) if err.is_interrupted() => debug!(table = %table, "transfer interrupted"),
        Err(err) => {
            error!(table = %table, "transfer failed: {err}");
            *shared.failure.lock() = Some(err.to_string());
        }
    }
    drop(receiver);

    if shared.drop_requested.load(Ordering::Acquire) {
        drop_quietly(&shared);
    }
    shared.completion.release();
    // clear() may have raced the release above.
    if shared.drop_requested.load(Ordering::Acquire) {
        drop_quietly(&shared);
    }
}

fn drop_quietly(shared: &Shared) {
    if let Err(err) = shared.drop_table() {
        error!(table = shared.table.name(), "failed to drop result table: {err}");
    }
}

fn transfer(shared: &Shared, receiver: &Receiver<QueueMessage>) -> Result<()> {
    let env = &shared.env;
    let mut batch: Option<BatchingWriteTxn<'_>> = None;
    let mut last_commit = Instant::now();

    loop {
        if shared.cancel.is_cancelled() {
            return Err(StoreError::Interrupted("transferring rows".into()));
        }

        let mut complete = false;
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(QueueMessage::Insert(item)) => {
                if !shared.drop_requested.load(Ordering::Acquire) {
                    if batch.is_none() {
                        batch = Some(
                            env.open_batching_write_txn(&shared.cancel, shared.commit_batch_size)?,
                        );
                    }
                    if let Some(txn) = batch.as_mut() {
                        insert(shared, txn, &item)?;
                        txn.commit_if_required()?;
                    }
                }
            }
            Ok(QueueMessage::Complete) | Err(RecvTimeoutError::Disconnected) => complete = true,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let payload_wanted = shared.create_payload.load(Ordering::Acquire)
            && shared.current_payload.lock().is_none();

        if complete || payload_wanted || last_commit.elapsed() >= COMMIT_INTERVAL {
            // Dropping the batch releases the write lock.
            if let Some(mut txn) = batch.take() {
                txn.commit()?;
            }
            last_commit = Instant::now();

            if payload_wanted && !shared.drop_requested.load(Ordering::Acquire) {
                let created = payload::create_payload(shared, shared.payload_limit)?;
                trace!(bytes = created.len(), "buffered payload");
                *shared.current_payload.lock() = Some(created);
            }
            if complete {
                return Ok(());
            }
        }
    }
}

/// Adds one item to the table, merging it into any entry already stored
/// under the same key.
pub(crate) fn insert(shared: &Shared, txn: &mut WriteTxn<'_>, item: &QueueItem) -> Result<()> {
    let key = item.row_key.as_bytes();
    let value = item.row_value.as_bytes();
    if txn.put_if_absent(&shared.table, key, value)? {
        // Values from payloads may already hold several collided entries.
        let entries = item.row_value.entries().count() as u64;
        shared.result_count.fetch_add(entries, Ordering::AcqRel);
        return Ok(());
    }
    if !item.row_key.is_group() {
        return Err(StoreError::UnexpectedState(format!(
            "ungrouped row {} is already stored",
            item.row_key
        )));
    }

    let existing = txn.get(&shared.table, key)?.ok_or_else(|| {
        StoreError::UnexpectedState(format!("row {} vanished during merge", item.row_key))
    })?;
    let (merged, appended) = merge_values(shared, &existing, value)?;
    txn.put(&shared.table, key, &merged)?;
    if appended > 0 {
        shared.result_count.fetch_add(appended, Ordering::AcqRel);
    }
    Ok(())
}

/// Folds each incoming entry into the stored entry with the same full key,
/// appending entries whose key hashed to the same row without matching.
/// Returns the new value and the number of appended entries.
fn merge_values(shared: &Shared, existing: &[u8], incoming: &[u8]) -> Result<(Vec<u8>, u64)> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = ValueEntries::new(existing)
        .map(|entry| entry.map(|entry| (entry.full_key.to_vec(), entry.generators.to_vec())))
        .collect::<Result<_>>()?;

    let mut appended = 0;
    for entry in ValueEntries::new(incoming) {
        let entry = entry?;
        match entries
            .iter_mut()
            .find(|(full_key, _)| full_key.as_slice() == entry.full_key)
        {
            Some((_, generators)) => {
                *generators = combine(shared, generators, entry.generators)?;
            }
            None => {
                trace!("row key collision, appending entry");
                entries.push((entry.full_key.to_vec(), entry.generators.to_vec()));
                appended += 1;
            }
        }
    }

    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for (full_key, generators) in &entries {
        write_entry(&mut merged, full_key, generators);
    }
    Ok((merged, appended))
}

fn combine(shared: &Shared, existing: &[u8], incoming: &[u8]) -> Result<Vec<u8>> {
    let mut current = shared.serialiser.read_generators(existing)?;
    let incoming = shared.serialiser.read_generators(incoming)?;
    for (slot, other) in current.iter_mut().zip(incoming) {
        let Some(other) = other else {
            continue;
        };
        match slot {
            Some(generator) => generator.merge(&other),
            None => *slot = Some(other),
        }
    }
    shared.serialiser.generator_bytes(&current)
}
