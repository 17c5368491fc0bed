//! Uniform connection contract
//!
//! One trait, four transports (TCP, Bluetooth Classic, BLE GATT, USB bulk).
//! Callers `write()` any number of times, then `send()` once per logical
//! print unit. `send()` transmits, drains the buffer and sleeps for the
//! settle time the device needs (see [`Pacing`]).

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchController;
use crate::error::{PrintError, PrintResult};
use crate::pacing::Pacing;

/// Physical transport behind a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    Bluetooth,
    Ble,
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Ble => "ble",
            TransportKind::Usb => "usb",
        };
        f.write_str(name)
    }
}

/// Cancellation primitive shared between a connection and its callers
///
/// `trigger()` releases every wait currently parked on the connection
/// (read polls, GATT rendezvous). `connect()` re-arms it.
#[derive(Debug, Clone, Default)]
pub struct DisconnectSignal {
    current: Arc<Mutex<CancellationToken>>,
}

impl DisconnectSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for the current connect cycle
    pub fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    pub fn trigger(&self) {
        self.lock().cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Replace a fired token with a fresh one
    pub fn rearm(&self) {
        let mut token = self.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run `fut` unless the token fires first
pub(crate) async fn until_cancelled<T, F>(token: &CancellationToken, fut: F) -> PrintResult<T>
where
    F: Future<Output = PrintResult<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(PrintError::Cancelled),
        result = fut => result,
    }
}

/// Sleep, skipping zero durations
pub(crate) async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

/// Contract every printer transport implements
///
/// A connection is owned by exactly one caller (usually a
/// [`PrinterWorker`](crate::PrinterWorker)), which serializes all calls.
#[async_trait]
pub trait Connection: Send {
    /// Which transport this is
    fn kind(&self) -> TransportKind;

    /// Human-readable address (host:port, device id, ...)
    fn describe(&self) -> String;

    /// True iff the transport handle is open
    fn is_connected(&self) -> bool;

    /// Open the transport. No-op when already connected.
    async fn connect(&mut self) -> PrintResult<()>;

    /// Release the transport. Never fails; repeated calls are no-ops.
    async fn disconnect(&mut self);

    /// Transmit the buffer (or record the wait in batch mode), then settle
    async fn send(&mut self, extra_wait: Duration) -> PrintResult<()>;

    /// Wait up to `timeout` for inbound bytes; empty on timeout.
    /// A zero timeout returns only what is already waiting.
    async fn read(&mut self, timeout: Duration) -> PrintResult<Vec<u8>>;

    /// Whether `read()` can ever return data on this transport
    fn can_read(&self) -> bool;

    fn batch(&self) -> &BatchController;

    fn batch_mut(&mut self) -> &mut BatchController;

    fn pacing(&self) -> Pacing;

    fn set_pacing(&mut self, pacing: Pacing);

    /// Handle that cancels pending waits from another task
    fn disconnect_signal(&self) -> DisconnectSignal;

    /// Append bytes to the outbound buffer. Pure in-memory.
    fn write(&mut self, bytes: &[u8]) {
        self.batch_mut().write(bytes);
    }

    fn set_batch_mode(&mut self, enabled: bool) {
        self.batch_mut().set_batch_mode(enabled);
    }

    fn is_batch_mode(&self) -> bool {
        self.batch().is_batch_mode()
    }

    /// One real transmission of everything buffered, honoring the
    /// accumulated batch wait, then back to the previous batch flag
    async fn flush_batch(&mut self) -> PrintResult<()> {
        if self.batch().is_empty() {
            return Ok(());
        }
        let (was_batch_mode, wait) = self.batch_mut().suspend();
        tracing::debug!(
            transport = %self.kind(),
            bytes = self.batch().len(),
            wait_ms = wait.as_millis() as u64,
            "Flushing batch"
        );
        let result = self.send(wait).await;
        let owed = if result.is_err() { wait } else { Duration::ZERO };
        self.batch_mut().resume(was_batch_mode, owed);
        result
    }
}
