//! Outbound buffer and batch-mode bookkeeping
//!
//! Every transport owns one `BatchController`. `write()` only appends here;
//! the transport drains it on a real transmission.

use std::time::Duration;

/// Outcome of `BatchController::begin_send`
#[derive(Debug, PartialEq, Eq)]
pub enum SendPlan {
    /// Batch mode: wait recorded, nothing to transmit now
    Deferred,
    /// Transmit the pending bytes, then settle
    Transmit,
}

/// Outbound buffer + batch flag + accumulated batch wait
#[derive(Debug, Default)]
pub struct BatchController {
    buf: Vec<u8>,
    batch_mode: bool,
    batch_wait: Duration,
}

impl BatchController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the outbound buffer
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_batch_mode(&self) -> bool {
        self.batch_mode
    }

    /// Pacing debt accumulated while batching
    pub fn batch_wait(&self) -> Duration {
        self.batch_wait
    }

    /// Switching batch mode off drops the accumulated wait
    pub fn set_batch_mode(&mut self, enabled: bool) {
        self.batch_mode = enabled;
        if !enabled {
            self.batch_wait = Duration::ZERO;
        }
    }

    /// First step of every `send()`
    pub fn begin_send(&mut self, extra_wait: Duration) -> SendPlan {
        if self.batch_mode {
            self.batch_wait += extra_wait;
            tracing::trace!(
                buffered = self.buf.len(),
                batch_wait_ms = self.batch_wait.as_millis() as u64,
                "Batch mode: buffering"
            );
            SendPlan::Deferred
        } else {
            SendPlan::Transmit
        }
    }

    /// Take the pending bytes for transmission
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Put bytes back at the front after a failed transmission
    pub fn restore(&mut self, mut payload: Vec<u8>) {
        payload.extend_from_slice(&self.buf);
        self.buf = payload;
    }

    /// Leave batch mode for one flush; returns (previous flag, owed wait)
    pub fn suspend(&mut self) -> (bool, Duration) {
        let was = self.batch_mode;
        let wait = std::mem::take(&mut self.batch_wait);
        self.batch_mode = false;
        (was, wait)
    }

    /// Restore the flag saved by `suspend`, with the wait still owed
    /// when the flush did not go out
    pub fn resume(&mut self, was_batch_mode: bool, owed: Duration) {
        self.batch_mode = was_batch_mode;
        self.batch_wait = owed;
    }

    /// Drop everything (disconnect)
    pub fn clear(&mut self) {
        self.buf.clear();
        self.batch_wait = Duration::ZERO;
    }
}
