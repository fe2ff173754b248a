use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;

static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Registers descriptions for the metrics this crate emits. Safe to call
/// more than once; a recorder must be installed by the host for the values
/// to go anywhere.
pub fn describe() {
    DESCRIBED.get_or_init(|| {
        describe_counter!(
            "resultdbx_store_operations_total",
            "Total number of operations executed against result stores."
        );
        describe_histogram!(
            "resultdbx_store_operation_duration_seconds",
            "Duration of operations executed against result stores."
        );
        describe_counter!(
            "resultdbx_rows_added_total",
            "Total number of rows offered to result stores."
        );
        describe_gauge!(
            "resultdbx_open_stores",
            "Number of result stores whose tables have not been dropped."
        );
    });
}

pub fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("resultdbx_store_operations_total", &labels).increment(1);
    histogram!("resultdbx_store_operation_duration_seconds", &labels).record(duration);
}

pub fn record_rows_added(rows: u64) {
    counter!("resultdbx_rows_added_total").increment(rows);
}

pub fn store_opened() {
    gauge!("resultdbx_open_stores").increment(1.0);
}

pub fn store_closed() {
    gauge!("resultdbx_open_stores").decrement(1.0);
}
