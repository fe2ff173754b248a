//! Moving a store's contents between processes.
//!
//! A payload stream is an `i32` count followed by that many `{len, blob}`
//! blocks. Each blob is a run of `{keyLen, rowKey, valLen, rowValue}`
//! records copied straight out of the table.

use std::{
    io::{self, Read, Write},
    sync::atomic::Ordering,
    time::Instant,
};

use tracing::debug;

use super::{DataStore, QueueItem, Shared};
use crate::{
    codec::{
        RowKey, RowValue, read_block, read_i32, read_record, write_block, write_entry,
        write_record,
    },
    error::{Result, StoreError},
    observability::record_store_op,
};

/// Moves rows out of the table into a blob. With a byte `limit` rows are
/// taken until the limit is reached; otherwise the table is emptied.
pub(crate) fn create_payload(shared: &Shared, limit: usize) -> Result<Vec<u8>> {
    let started = Instant::now();
    let result = shared.env.with_write_txn(&shared.cancel, |txn| {
        let mut blob = Vec::new();
        let mut emitted = Vec::new();
        let mut size = 0usize;
        txn.scan_from(&shared.table, &[], |key, value| {
            if limit > 0 && size >= limit {
                return Ok(false);
            }
            size += key.len() + value.len();
            write_record(&mut blob, key, value)?;
            emitted.push(key.to_vec());
            Ok(true)
        })?;
        for key in &emitted {
            txn.delete(&shared.table, key)?;
        }
        debug!(
            table = shared.table.name(),
            rows = emitted.len(),
            bytes = blob.len(),
            "created payload"
        );
        Ok(blob)
    });
    record_store_op(
        "create_payload",
        if result.is_ok() { "ok" } else { "err" },
        started.elapsed().as_secs_f64(),
    );
    result
}

pub(crate) fn write_payload<W: Write + ?Sized>(shared: &Shared, writer: &mut W) -> Result<()> {
    let complete = shared.completion.is_released();
    shared.create_payload.store(true, Ordering::Release);

    let mut payloads = Vec::with_capacity(2);
    if let Some(payload) = shared.current_payload.lock().take() {
        payloads.push(payload);
    }
    if complete {
        payloads.push(create_payload(shared, 0)?);
    }

    writer.write_all(&(payloads.len() as i32).to_be_bytes())?;
    for payload in &payloads {
        write_block(writer, payload)?;
    }
    Ok(())
}

pub(crate) fn read_payload<R: Read + ?Sized>(store: &DataStore, reader: &mut R) -> Result<bool> {
    let shared = store.shared();
    let count = read_i32(reader)?;
    if count < 0 {
        return Err(StoreError::Serialization(format!(
            "negative payload count {count}"
        )));
    }

    for _ in 0..count {
        let blob = read_block(reader)?;
        let mut cursor = io::Cursor::new(blob.as_slice());
        while let Some((key, value)) = read_record(&mut cursor)? {
            let mut row_key = RowKey::from_bytes(&key)?;
            let mut row_value = RowValue::from_bytes(value);
            if !row_key.is_group() {
                let unique_id = shared.next_unique_id();
                row_key = row_key.make_unique(unique_id);
                row_value = renumber(shared, &row_value, unique_id)?;
            }
            store.put(QueueItem { row_key, row_value })?;
        }
    }

    Ok(!shared.cancel.is_cancelled() && !shared.has_enough_data.load(Ordering::Acquire))
}

/// Rewrites the full keys of an ungrouped value so they carry the id of
/// the row key they are stored under.
fn renumber(shared: &Shared, value: &RowValue, unique_id: u64) -> Result<RowValue> {
    let mut bytes = Vec::with_capacity(value.as_bytes().len());
    for entry in value.entries() {
        let entry = entry?;
        let key = shared
            .serialiser
            .to_key(entry.full_key)?
            .with_unique_id(unique_id);
        write_entry(&mut bytes, &shared.serialiser.key_bytes(&key)?, entry.generators);
    }
    Ok(RowValue::from_bytes(bytes))
}
