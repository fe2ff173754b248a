use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, StoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Counting semaphore bounding the number of open read transactions.
#[derive(Debug)]
pub struct ReadPermits {
    available: Mutex<usize>,
    released: Condvar,
}

impl ReadPermits {
    pub fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    /// Blocks until a permit is free. Waits are logged periodically and only
    /// end early when `cancel` fires.
    pub fn acquire(&self, cancel: &CancellationToken) -> Result<Permit<'_>> {
        let started = Instant::now();
        let mut last_log = started;
        let mut available = self.available.lock();
        while *available == 0 {
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted(
                    "waiting for a read permit".into(),
                ));
            }
            self.released.wait_for(&mut available, POLL_INTERVAL);
            if last_log.elapsed() >= LOG_INTERVAL {
                debug!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still waiting for a read permit"
                );
                last_log = Instant::now();
            }
        }
        *available -= 1;
        Ok(Permit { permits: self })
    }
}

/// Returns its permit when dropped.
#[derive(Debug)]
pub struct Permit<'a> {
    permits: &'a ReadPermits,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut available = self.permits.available.lock();
        *available += 1;
        self.permits.released.notify_one();
    }
}
