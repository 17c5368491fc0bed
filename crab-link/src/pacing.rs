//! Chunking and settle-time parameters
//!
//! Printers have no flow control for "the cutter is still moving", so every
//! transmission is followed by a settle delay made of the caller's declared
//! wait plus an implied cost proportional to the payload size.

use std::time::Duration;

/// Transport pacing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Max bytes per physical write (0 = no chunking)
    pub chunk_size: usize,
    /// Delay between two chunks
    pub chunk_delay: Duration,
    /// Assumed device throughput (0 = no implied settle time)
    pub bytes_per_ms: u32,
}

impl Pacing {
    /// Raw TCP (port 9100): reliable and flow-controlled, send in one go
    pub const fn tcp() -> Self {
        Self {
            chunk_size: 0,
            chunk_delay: Duration::ZERO,
            bytes_per_ms: 16,
        }
    }

    /// Bluetooth Classic SPP: smaller chunks, longer gaps
    pub const fn rfcomm() -> Self {
        Self {
            chunk_size: 200,
            chunk_delay: Duration::from_millis(20),
            bytes_per_ms: 8,
        }
    }

    /// BLE GATT: chunk size is replaced by the negotiated MTU at connect
    pub const fn ble() -> Self {
        Self {
            chunk_size: 20,
            chunk_delay: Duration::from_millis(50),
            bytes_per_ms: 2,
        }
    }

    /// USB bulk: one transfer, only the declared wait
    pub const fn usb() -> Self {
        Self {
            chunk_size: 0,
            chunk_delay: Duration::ZERO,
            bytes_per_ms: 0,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_bytes_per_ms(mut self, bytes_per_ms: u32) -> Self {
        self.bytes_per_ms = bytes_per_ms;
        self
    }

    /// Delay owed after sending `len` bytes: declared wait + implied cost
    pub fn settle_time(&self, len: usize, extra_wait: Duration) -> Duration {
        let implied = if self.bytes_per_ms == 0 {
            0
        } else {
            (len / self.bytes_per_ms as usize) as u64
        };
        extra_wait + Duration::from_millis(implied)
    }

    /// Split a payload into physical writes
    pub fn chunks<'a>(&self, payload: &'a [u8]) -> Vec<&'a [u8]> {
        split_chunks(payload, self.chunk_size)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            chunk_delay: Duration::from_millis(10),
            bytes_per_ms: 16,
        }
    }
}

/// Split `payload` into `chunk_size` pieces; `0` or a short payload gives one piece
pub fn split_chunks(payload: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if payload.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 || payload.len() <= chunk_size {
        return vec![payload];
    }
    payload.chunks(chunk_size).collect()
}
