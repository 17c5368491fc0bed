//! Real-time status (DLE EOT n)
//!
//! Four independent banks, one byte each. A bank that did not answer keeps
//! its flags at their defaults and reports `queried = false`; callers that
//! care about a flag must check that bank was actually read.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{PrintError, PrintResult};

pub const DLE: u8 = 0x10;
pub const EOT: u8 = 0x04;

/// Reads spent discarding stale bytes before a request
const MAX_DRAIN_READS: usize = 8;

/// Status bank selected by the `n` of DLE EOT n
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusBank {
    Printer = 1,
    Offline = 2,
    Error = 3,
    Paper = 4,
}

impl StatusBank {
    pub const ALL: [StatusBank; 4] = [
        StatusBank::Printer,
        StatusBank::Offline,
        StatusBank::Error,
        StatusBank::Paper,
    ];

    pub const fn selector(self) -> u8 {
        self as u8
    }

    /// Request bytes for this bank
    pub const fn request(self) -> [u8; 3] {
        [DLE, EOT, self.selector()]
    }
}

impl fmt::Display for StatusBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusBank::Printer => "printer",
            StatusBank::Offline => "offline",
            StatusBank::Error => "error",
            StatusBank::Paper => "paper",
        };
        f.write_str(name)
    }
}

/// Raw answers per bank (`None` = not queried)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BankResponses {
    pub printer: Option<Vec<u8>>,
    pub offline: Option<Vec<u8>>,
    pub error: Option<Vec<u8>>,
    pub paper: Option<Vec<u8>>,
}

impl BankResponses {
    pub fn get(&self, bank: StatusBank) -> Option<&[u8]> {
        match bank {
            StatusBank::Printer => self.printer.as_deref(),
            StatusBank::Offline => self.offline.as_deref(),
            StatusBank::Error => self.error.as_deref(),
            StatusBank::Paper => self.paper.as_deref(),
        }
    }

    fn slot(&mut self, bank: StatusBank) -> &mut Option<Vec<u8>> {
        match bank {
            StatusBank::Printer => &mut self.printer,
            StatusBank::Offline => &mut self.offline,
            StatusBank::Error => &mut self.error,
            StatusBank::Paper => &mut self.paper,
        }
    }
}

/// Decoded printer status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterStatus {
    // printer bank
    pub online: bool,
    pub drawer_open: bool,
    // offline bank
    pub cover_open: bool,
    pub paper_feed_active: bool,
    pub paper_end_error: bool,
    pub error_occurred: bool,
    // error bank
    pub recoverable_error: bool,
    pub autocutter_error: bool,
    pub unrecoverable_error: bool,
    pub auto_recoverable_error: bool,
    // paper bank
    pub paper_near_end: bool,
    pub paper_end: bool,

    pub raw: BankResponses,
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self {
            online: true,
            drawer_open: false,
            cover_open: false,
            paper_feed_active: false,
            paper_end_error: false,
            error_occurred: false,
            recoverable_error: false,
            autocutter_error: false,
            unrecoverable_error: false,
            auto_recoverable_error: false,
            paper_near_end: false,
            paper_end: false,
            raw: BankResponses::default(),
        }
    }
}

impl PrinterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one bank answer; an empty answer leaves the bank unqueried
    pub fn apply(&mut self, bank: StatusBank, response: &[u8]) {
        let Some(&status) = response.first() else {
            return;
        };
        *self.raw.slot(bank) = Some(response.to_vec());

        match bank {
            StatusBank::Printer => {
                self.drawer_open = status & 0x04 != 0;
                self.online = status & 0x08 == 0;
            }
            StatusBank::Offline => {
                self.cover_open = status & 0x04 != 0;
                self.paper_feed_active = status & 0x08 != 0;
                self.paper_end_error = status & 0x20 != 0;
                self.error_occurred = status & 0x40 != 0;
            }
            StatusBank::Error => {
                self.recoverable_error = status & 0x04 != 0;
                self.autocutter_error = status & 0x08 != 0;
                self.unrecoverable_error = status & 0x20 != 0;
                self.auto_recoverable_error = status & 0x40 != 0;
            }
            StatusBank::Paper => {
                self.paper_near_end = status & 0x0C != 0;
                self.paper_end = status & 0x60 != 0;
            }
        }
    }

    /// Decode from up to four raw answers, in bank order
    pub fn from_responses(printer: &[u8], offline: &[u8], error: &[u8], paper: &[u8]) -> Self {
        let mut status = Self::new();
        for (bank, response) in StatusBank::ALL.into_iter().zip([printer, offline, error, paper]) {
            status.apply(bank, response);
        }
        status
    }

    pub fn was_queried(&self, bank: StatusBank) -> bool {
        self.raw.get(bank).is_some()
    }

    pub fn has_any_status(&self) -> bool {
        StatusBank::ALL.iter().any(|b| self.was_queried(*b))
    }

    /// Online, cover closed, paper present, no error
    pub fn is_ready(&self) -> bool {
        self.online && !self.cover_open && !self.paper_end && !self.error_occurred && !self.unrecoverable_error
    }
}

impl fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_any_status() {
            return f.write_str("no status (printer did not answer)");
        }
        write!(
            f,
            "online={} drawer_open={} cover_open={} paper_near_end={} paper_end={} \
             error_occurred={} recoverable_error={} unrecoverable_error={} autocutter_error={} ready={}",
            self.online,
            self.drawer_open,
            self.cover_open,
            self.paper_near_end,
            self.paper_end,
            self.error_occurred,
            self.recoverable_error,
            self.unrecoverable_error,
            self.autocutter_error,
            self.is_ready()
        )
    }
}

/// Transmit what is buffered without leaving batch mode
async fn transmit<C: Connection + ?Sized>(conn: &mut C) -> PrintResult<()> {
    if conn.is_batch_mode() {
        conn.flush_batch().await
    } else {
        conn.send(Duration::ZERO).await
    }
}

/// Discard bytes already waiting, e.g. a late answer to an earlier query
async fn drain_inbound<C: Connection + ?Sized>(conn: &mut C) -> PrintResult<()> {
    for _ in 0..MAX_DRAIN_READS {
        let stale = conn.read(Duration::ZERO).await?;
        if stale.is_empty() {
            break;
        }
        debug!(bytes = stale.len(), "Discarding stale inbound bytes");
    }
    Ok(())
}

/// Ask one bank; `None` when the printer stays silent
pub async fn query_bank<C: Connection + ?Sized>(
    conn: &mut C,
    bank: StatusBank,
    timeout: Duration,
) -> PrintResult<Option<Vec<u8>>> {
    drain_inbound(conn).await?;
    conn.write(&bank.request());
    transmit(conn).await?;

    let response = conn.read(timeout).await?;
    debug!(%bank, bytes = response.len(), "Status response");
    Ok((!response.is_empty()).then_some(response))
}

/// Query all four banks independently
///
/// Fails only when the connection is down (or cancelled); a bank that
/// errors or times out is left unqueried.
pub async fn query_status<C: Connection + ?Sized>(conn: &mut C, timeout: Duration) -> PrintResult<PrinterStatus> {
    if !conn.is_connected() {
        return Err(PrintError::NotConnected);
    }
    let mut status = PrinterStatus::new();
    if !conn.can_read() {
        debug!(transport = %conn.kind(), "Transport cannot read, status unavailable");
        return Ok(status);
    }

    // keep print data ahead of the requests
    transmit(conn).await?;

    for bank in StatusBank::ALL {
        match query_bank(conn, bank, timeout).await {
            Ok(Some(response)) => status.apply(bank, &response),
            Ok(None) => debug!(%bank, "No status response"),
            Err(PrintError::Cancelled) => return Err(PrintError::Cancelled),
            Err(e) => warn!(%bank, error = %e, "Status query failed"),
        }
    }
    Ok(status)
}
