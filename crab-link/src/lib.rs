//! # crab-link
//!
//! ESC/POS printer transport layer - moving bytes, not building them.
//!
//! ## Scope
//!
//! This crate handles HOW bytes reach a printer:
//! - Raw TCP (port 9100)
//! - Bluetooth Classic SPP (`rfcomm` feature, Linux/BlueZ)
//! - Bluetooth LE GATT (`ble` feature)
//! - USB bulk (`usb` feature)
//! - Real-time status queries (DLE EOT)
//!
//! Command building (text, cut, barcode, image) stays with the caller; here
//! payloads are opaque.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use crab_link::{PrintJob, PrinterWorker, TcpConnection};
//!
//! let conn = TcpConnection::tcp("192.168.1.100", 9100)?;
//! let printer = PrinterWorker::new(Box::new(conn)).spawn();
//! printer.connect().await?;
//!
//! let job = PrintJob::new()
//!     .write(b"Table 12\n")
//!     .send(Duration::ZERO)
//!     .write(&[0x1D, 0x56, 0x00])
//!     .send(Duration::from_millis(300));
//! printer.print(job).await?;
//!
//! let status = printer.query_status().await?;
//! println!("{status}");
//! ```

mod batch;
pub mod bluetooth;
mod config;
mod connection;
mod error;
pub mod gatt;
mod pacing;
mod status;
mod stream;
pub mod usb;
mod worker;

// Re-exports
pub use batch::{BatchController, SendPlan};
pub use config::LinkConfig;
pub use connection::{Connection, DisconnectSignal, TransportKind};
pub use error::{PrintError, PrintResult};
pub use gatt::{GattConfig, GattPhase, GattTransport, WriteTypePolicy};
pub use pacing::{Pacing, split_chunks};
pub use status::{BankResponses, PrinterStatus, StatusBank, query_bank, query_status};
pub use stream::{DEFAULT_TCP_PORT, StreamDialer, StreamTransport, TcpConnection, TcpDialer};
pub use usb::{BulkDevice, BulkTransport};
pub use worker::{PrintJob, PrinterHandle, PrinterWorker};

#[cfg(feature = "ble")]
pub use gatt::{BleConnection, scan_printers};

#[cfg(feature = "usb")]
pub use usb::{UsbConnection, list_usb_printers};

#[cfg(all(feature = "rfcomm", target_os = "linux"))]
pub use bluetooth::{BluetoothConnection, list_paired_printers};
