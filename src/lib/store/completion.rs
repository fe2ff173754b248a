use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StoreError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One-shot signal released when a store's transfer loop has exited.
#[derive(Debug, Default)]
pub(crate) struct CompletionLatch {
    released: Mutex<bool>,
    signal: Condvar,
}

impl CompletionLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.signal.notify_all();
    }

    pub(crate) fn is_released(&self) -> bool {
        *self.released.lock()
    }

    pub(crate) fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut released = self.released.lock();
        while !*released {
            if cancel.is_cancelled() {
                return Err(StoreError::Interrupted(
                    "waiting for the store to complete".into(),
                ));
            }
            self.signal.wait_for(&mut released, POLL_INTERVAL);
        }
        Ok(())
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut released = self.released.lock();
        while !*released {
            if self.signal.wait_until(&mut released, deadline).timed_out() {
                return *released;
            }
        }
        true
    }
}
