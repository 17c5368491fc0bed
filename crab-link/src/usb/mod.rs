//! USB bulk printer transport
//!
//! The device handle is synchronous (libusb), so every transfer runs on the
//! blocking pool. Interface and endpoint choice is delegated to an
//! [`InterfaceClassifier`].

#[cfg(feature = "usb")]
mod libusb;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{BatchController, SendPlan};
use crate::config::LinkConfig;
use crate::connection::{Connection, DisconnectSignal, TransportKind, pause};
use crate::error::{PrintError, PrintResult};
use crate::pacing::Pacing;

#[cfg(feature = "usb")]
pub use libusb::{RusbDevice, UsbConnection, UsbPrinterInfo, list_usb_printers};

/// USB printer class
pub const CLASS_PRINTER: u8 = 0x07;
/// Vendor specific class
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;
/// Device class "defined per interface"
pub const CLASS_PER_INTERFACE: u8 = 0x00;
/// Miscellaneous (interface association) device class
pub const CLASS_MISCELLANEOUS: u8 = 0xEF;

/// Max bytes returned by one `read()`
const READ_BUF_SIZE: usize = 1024;
/// Shortest bulk IN poll handed to the device
const MIN_READ_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbEndpointInfo {
    pub address: u8,
    pub direction: EndpointDirection,
    pub bulk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInterfaceInfo {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<UsbEndpointInfo>,
}

impl UsbInterfaceInfo {
    fn bulk_endpoint(&self, direction: EndpointDirection) -> Option<u8> {
        self.endpoints
            .iter()
            .find(|e| e.bulk && e.direction == direction)
            .map(|e| e.address)
    }
}

/// Interface + endpoints a connection talks through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbPath {
    pub interface: u8,
    pub out_endpoint: u8,
    pub in_endpoint: Option<u8>,
}

/// Whether a device looks like a printer from its class codes
pub fn is_printer_device(device_class: u8, interface_classes: &[u8]) -> bool {
    match device_class {
        CLASS_PRINTER => true,
        CLASS_PER_INTERFACE | CLASS_MISCELLANEOUS => interface_classes.contains(&CLASS_PRINTER),
        _ => false,
    }
}

/// Chooses the interface print data goes through
pub trait InterfaceClassifier: Send + Sync {
    fn select(&self, interfaces: &[UsbInterfaceInfo]) -> Option<UsbPath>;
}

/// Printer class, then vendor specific, then any interface with a bulk OUT
#[derive(Debug, Clone, Copy, Default)]
pub struct PrinterInterfaceClassifier;

impl InterfaceClassifier for PrinterInterfaceClassifier {
    fn select(&self, interfaces: &[UsbInterfaceInfo]) -> Option<UsbPath> {
        let path = |iface: &UsbInterfaceInfo| {
            iface.bulk_endpoint(EndpointDirection::Out).map(|out| UsbPath {
                interface: iface.number,
                out_endpoint: out,
                in_endpoint: iface.bulk_endpoint(EndpointDirection::In),
            })
        };

        [Some(CLASS_PRINTER), Some(CLASS_VENDOR_SPECIFIC), None]
            .into_iter()
            .find_map(|wanted| {
                interfaces
                    .iter()
                    .filter(|i| wanted.is_none_or(|class| i.class == class))
                    .find_map(path)
            })
    }
}

/// Synchronous bulk-transfer device
pub trait BulkDevice: Send + Sync + 'static {
    fn describe(&self) -> String;

    fn interfaces(&self) -> PrintResult<Vec<UsbInterfaceInfo>>;

    fn claim(&self, interface: u8) -> PrintResult<()>;

    fn release(&self, interface: u8) -> PrintResult<()>;

    /// Bytes accepted by the device; `PrintError::Timeout` when nothing moved
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> PrintResult<usize>;

    /// Bytes received; `PrintError::Timeout` when nothing arrived
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> PrintResult<usize>;
}

async fn blocking<T, F>(f: F) -> PrintResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PrintResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PrintError::Connection(format!("USB worker failed: {}", e)))?
}

/// Write all of `data`, looping over partial transfers
fn write_all<D: BulkDevice + ?Sized>(device: &D, endpoint: u8, data: &[u8], timeout: Duration) -> PrintResult<()> {
    let mut offset = 0;
    while offset < data.len() {
        let n = device.write_bulk(endpoint, &data[offset..], timeout)?;
        if n == 0 {
            return Err(PrintError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "USB device accepted no data",
            )));
        }
        offset += n;
        trace!(sent = offset, total = data.len(), "Bulk transfer");
    }
    Ok(())
}

/// Connection to a USB printer through any [`BulkDevice`]
pub struct BulkTransport<D: BulkDevice> {
    device: Arc<D>,
    classifier: Arc<dyn InterfaceClassifier>,
    transfer_timeout: Duration,
    read_poll: Duration,
    path: Option<UsbPath>,
    batch: BatchController,
    pacing: Pacing,
    signal: DisconnectSignal,
}

impl<D: BulkDevice> BulkTransport<D> {
    pub fn new(device: D) -> Self {
        let config = LinkConfig::default();
        Self {
            device: Arc::new(device),
            classifier: Arc::new(PrinterInterfaceClassifier),
            transfer_timeout: config.usb_transfer_timeout(),
            read_poll: config.read_poll_interval(),
            path: None,
            batch: BatchController::new(),
            pacing: Pacing::usb(),
            signal: DisconnectSignal::new(),
        }
    }

    pub fn with_config(mut self, config: &LinkConfig) -> Self {
        self.transfer_timeout = config.usb_transfer_timeout();
        self.read_poll = config.read_poll_interval();
        self
    }

    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: InterfaceClassifier + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Claimed interface and endpoints, while connected
    pub fn path(&self) -> Option<UsbPath> {
        self.path
    }
}

#[async_trait]
impl<D: BulkDevice> Connection for BulkTransport<D> {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn describe(&self) -> String {
        self.device.describe()
    }

    fn is_connected(&self) -> bool {
        self.path.is_some()
    }

    async fn connect(&mut self) -> PrintResult<()> {
        if self.is_connected() {
            debug!(device = %self.describe(), "Already connected");
            return Ok(());
        }
        self.signal.rearm();
        info!(device = %self.describe(), "Opening USB printer");

        let device = self.device.clone();
        let classifier = self.classifier.clone();
        let opened = blocking(move || {
            let interfaces = device.interfaces()?;
            let path = classifier.select(&interfaces).ok_or_else(|| {
                PrintError::Connection("No USB interface with a bulk OUT endpoint".to_string())
            })?;
            device.claim(path.interface)?;
            Ok(path)
        })
        .await;

        match opened {
            Ok(path) => {
                info!(
                    device = %self.describe(),
                    interface = path.interface,
                    out = format_args!("0x{:02X}", path.out_endpoint),
                    readable = path.in_endpoint.is_some(),
                    "USB printer claimed"
                );
                self.path = Some(path);
                self.batch.clear();
                Ok(())
            }
            Err(e) => {
                error!(device = %self.describe(), error = %e, "USB connect failed");
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.signal.trigger();
        self.batch.clear();

        let Some(path) = self.path.take() else {
            return;
        };
        let device = self.device.clone();
        if let Err(e) = blocking(move || device.release(path.interface)).await {
            warn!(device = %self.describe(), error = %e, "Error releasing USB interface");
        }
        info!(device = %self.describe(), "USB disconnected");
    }

    async fn send(&mut self, extra_wait: Duration) -> PrintResult<()> {
        if self.batch.begin_send(extra_wait) == SendPlan::Deferred {
            return Ok(());
        }
        let Some(path) = self.path else {
            error!(device = %self.describe(), "Send failed: not connected");
            return Err(PrintError::NotConnected);
        };

        let payload = self.batch.take();
        debug!(bytes = payload.len(), endpoint = path.out_endpoint, "Sending over USB");

        let chunks: Vec<Vec<u8>> = self.pacing.chunks(&payload).into_iter().map(<[u8]>::to_vec).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let device = self.device.clone();
            let timeout = self.transfer_timeout;
            if let Err(e) = blocking(move || write_all(device.as_ref(), path.out_endpoint, &chunk, timeout)).await {
                error!(error = %e, "USB send failed");
                self.batch.restore(payload);
                return Err(e);
            }
            if i + 1 < count {
                pause(self.pacing.chunk_delay).await;
            }
        }

        pause(self.pacing.settle_time(payload.len(), extra_wait)).await;
        debug!(bytes = payload.len(), "USB send complete");
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> PrintResult<Vec<u8>> {
        let Some(endpoint) = self.path.and_then(|p| p.in_endpoint) else {
            return Ok(Vec::new());
        };
        let token = self.signal.token();
        let deadline = Instant::now() + timeout;
        let mut polled = false;

        // short polls so a disconnect is noticed between transfers
        loop {
            if token.is_cancelled() {
                return Err(PrintError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && polled {
                return Ok(Vec::new());
            }
            polled = true;

            let device = self.device.clone();
            // libusb reads 0 as "wait forever"
            let poll = remaining.min(self.read_poll).max(MIN_READ_POLL);
            let result = blocking(move || {
                let mut buf = vec![0u8; READ_BUF_SIZE];
                let n = device.read_bulk(endpoint, &mut buf, poll)?;
                buf.truncate(n);
                Ok(buf)
            })
            .await;

            match result {
                Ok(data) if !data.is_empty() => return Ok(data),
                Ok(_) => pause(poll).await,
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn can_read(&self) -> bool {
        self.path.is_some_and(|p| p.in_endpoint.is_some())
    }

    fn batch(&self) -> &BatchController {
        &self.batch
    }

    fn batch_mut(&mut self) -> &mut BatchController {
        &mut self.batch
    }

    fn pacing(&self) -> Pacing {
        self.pacing
    }

    fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
    }

    fn disconnect_signal(&self) -> DisconnectSignal {
        self.signal.clone()
    }
}
