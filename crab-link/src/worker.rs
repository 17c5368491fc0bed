//! Printer worker
//!
//! One task per connection. Every operation goes through its command
//! channel, so two transmissions to the same device never overlap and
//! status queries are ordered with print data.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::LinkConfig;
use crate::connection::{Connection, DisconnectSignal, TransportKind};
use crate::error::{PrintError, PrintResult};
use crate::status::{PrinterStatus, query_status};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<T>;

/// One step of a [`PrintJob`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobStep {
    Write(Vec<u8>),
    Send(Duration),
}

/// A logical print job, transmitted as one batch
///
/// ```ignore
/// let job = PrintJob::new()
///     .write(b"Hello\n")
///     .send(Duration::ZERO)
///     .write(&[0x1D, 0x56, 0x00]) // cut
///     .send(Duration::from_millis(300));
/// handle.print(job).await?;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrintJob {
    steps: Vec<JobStep>,
}

impl PrintJob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, bytes: &[u8]) -> Self {
        self.steps.push(JobStep::Write(bytes.to_vec()));
        self
    }

    /// End of a print unit; `extra_wait` is the settle time it needs
    pub fn send(mut self, extra_wait: Duration) -> Self {
        self.steps.push(JobStep::Send(extra_wait));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

enum Command {
    Connect(Reply<PrintResult<()>>),
    Disconnect(Reply<()>),
    IsConnected(Reply<bool>),
    Write(Vec<u8>),
    Send(Duration, Reply<PrintResult<()>>),
    SetBatchMode(bool),
    FlushBatch(Reply<PrintResult<()>>),
    Read(Duration, Reply<PrintResult<Vec<u8>>>),
    QueryStatus(Reply<PrintResult<PrinterStatus>>),
    Print(PrintJob, Reply<PrintResult<()>>),
}

/// Owns one connection and serializes everything done to it
pub struct PrinterWorker {
    conn: Box<dyn Connection>,
    status_timeout: Duration,
}

impl PrinterWorker {
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            conn,
            status_timeout: LinkConfig::default().status_timeout(),
        }
    }

    /// Per-bank status response timeout
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Start the worker task
    pub fn spawn(self) -> PrinterHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = PrinterHandle {
            tx,
            signal: self.conn.disconnect_signal(),
            kind: self.conn.kind(),
            address: self.conn.describe(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    /// Run until every handle is dropped
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!(transport = %self.conn.kind(), addr = %self.conn.describe(), "Printer worker started");

        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }

        self.conn.disconnect().await;
        tracing::info!(addr = %self.conn.describe(), "Printer handles dropped, worker stopping");
    }

    async fn handle(&mut self, command: Command) {
        // a dropped reply receiver just means the caller stopped waiting
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.conn.connect().await);
            }
            Command::Disconnect(reply) => {
                self.conn.disconnect().await;
                let _ = reply.send(());
            }
            Command::IsConnected(reply) => {
                let _ = reply.send(self.conn.is_connected());
            }
            Command::Write(bytes) => self.conn.write(&bytes),
            Command::Send(extra_wait, reply) => {
                let _ = reply.send(self.conn.send(extra_wait).await);
            }
            Command::SetBatchMode(enabled) => self.conn.set_batch_mode(enabled),
            Command::FlushBatch(reply) => {
                let _ = reply.send(self.conn.flush_batch().await);
            }
            Command::Read(timeout, reply) => {
                let _ = reply.send(self.conn.read(timeout).await);
            }
            Command::QueryStatus(reply) => {
                let _ = reply.send(query_status(self.conn.as_mut(), self.status_timeout).await);
            }
            Command::Print(job, reply) => {
                let _ = reply.send(self.print(job).await);
            }
        }
    }

    async fn print(&mut self, job: PrintJob) -> PrintResult<()> {
        let was_batch_mode = self.conn.is_batch_mode();
        self.conn.set_batch_mode(true);

        let mut result = Ok(());
        for step in job.steps {
            match step {
                JobStep::Write(bytes) => self.conn.write(&bytes),
                JobStep::Send(extra_wait) => {
                    result = self.conn.send(extra_wait).await;
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
        if result.is_ok() {
            result = self.conn.flush_batch().await;
        }

        self.conn.set_batch_mode(was_batch_mode);
        if let Err(e) = &result {
            // a half-sent job must not leak into the next one
            self.conn.batch_mut().clear();
            tracing::error!(addr = %self.conn.describe(), error = %e, "Print job failed");
        }
        result
    }
}

/// Cloneable front end of a [`PrinterWorker`]
#[derive(Clone)]
pub struct PrinterHandle {
    tx: mpsc::Sender<Command>,
    signal: DisconnectSignal,
    kind: TransportKind,
    address: String,
}

fn worker_gone() -> PrintError {
    PrintError::Connection("Printer worker stopped".to_string())
}

impl PrinterHandle {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> PrintResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())
    }

    pub async fn connect(&self) -> PrintResult<()> {
        self.call(Command::Connect).await?
    }

    /// Release the device, aborting any wait in progress first
    pub async fn disconnect(&self) -> PrintResult<()> {
        self.signal.trigger();
        self.call(Command::Disconnect).await
    }

    pub async fn is_connected(&self) -> bool {
        self.call(Command::IsConnected).await.unwrap_or(false)
    }

    /// Queue bytes; ordered with every other call on this printer
    pub async fn write(&self, bytes: &[u8]) -> PrintResult<()> {
        self.tx
            .send(Command::Write(bytes.to_vec()))
            .await
            .map_err(|_| worker_gone())
    }

    pub async fn send(&self, extra_wait: Duration) -> PrintResult<()> {
        self.call(|reply| Command::Send(extra_wait, reply)).await?
    }

    pub async fn set_batch_mode(&self, enabled: bool) -> PrintResult<()> {
        self.tx
            .send(Command::SetBatchMode(enabled))
            .await
            .map_err(|_| worker_gone())
    }

    pub async fn flush_batch(&self) -> PrintResult<()> {
        self.call(Command::FlushBatch).await?
    }

    pub async fn read(&self, timeout: Duration) -> PrintResult<Vec<u8>> {
        self.call(|reply| Command::Read(timeout, reply)).await?
    }

    pub async fn query_status(&self) -> PrintResult<PrinterStatus> {
        self.call(Command::QueryStatus).await?
    }

    /// Run a whole job in batch mode, uninterrupted by other callers
    pub async fn print(&self, job: PrintJob) -> PrintResult<()> {
        if job.is_empty() {
            return Ok(());
        }
        self.call(|reply| Command::Print(job, reply)).await?
    }
}
