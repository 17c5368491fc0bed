//! libusb device access through rusb

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{BulkDevice, BulkTransport, EndpointDirection, UsbEndpointInfo, UsbInterfaceInfo, is_printer_device};
use crate::error::{PrintError, PrintResult};

/// USB printer connection through libusb
pub type UsbConnection = BulkTransport<RusbDevice>;

impl UsbConnection {
    /// First device matching vendor / product id
    pub fn open(vendor_id: u16, product_id: u16) -> PrintResult<Self> {
        Ok(Self::new(RusbDevice::open(vendor_id, product_id)?))
    }
}

fn usb_err(e: rusb::Error) -> PrintError {
    match e {
        rusb::Error::Timeout => PrintError::Timeout("USB transfer timeout".to_string()),
        rusb::Error::NoDevice => PrintError::Connection("USB device unplugged".to_string()),
        rusb::Error::Access => PrintError::Connection("USB permission denied".to_string()),
        other => PrintError::Connection(format!("USB: {}", other)),
    }
}

/// A printer-class device found on the bus
#[derive(Debug, Clone, Serialize)]
pub struct UsbPrinterInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

fn interface_classes(device: &Device<GlobalContext>) -> Vec<u8> {
    let Ok(config) = device.active_config_descriptor().or_else(|_| device.config_descriptor(0)) else {
        return Vec::new();
    };
    config
        .interfaces()
        .flat_map(|i| i.descriptors().map(|d| d.class_code()).collect::<Vec<_>>())
        .collect()
}

/// Enumerate attached printers (class 7, or a composite with a printer interface)
pub fn list_usb_printers() -> PrintResult<Vec<UsbPrinterInfo>> {
    let mut printers = Vec::new();
    for device in rusb::devices().map_err(usb_err)?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if !is_printer_device(desc.class_code(), &interface_classes(&device)) {
            continue;
        }

        // strings need an open handle; missing permissions just leave them empty
        let (manufacturer, product) = match device.open() {
            Ok(handle) => (
                handle.read_manufacturer_string_ascii(&desc).ok(),
                handle.read_product_string_ascii(&desc).ok(),
            ),
            Err(e) => {
                debug!(error = %e, "Cannot open device for descriptor strings");
                (None, None)
            }
        };

        printers.push(UsbPrinterInfo {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            manufacturer,
            product,
        });
    }
    info!(count = printers.len(), "USB printers found");
    Ok(printers)
}

/// [`BulkDevice`] backed by a libusb handle
pub struct RusbDevice {
    device: Device<GlobalContext>,
    handle: Mutex<DeviceHandle<GlobalContext>>,
    label: String,
}

impl RusbDevice {
    pub fn open(vendor_id: u16, product_id: u16) -> PrintResult<Self> {
        for device in rusb::devices().map_err(usb_err)?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
                return Self::from_device(device);
            }
        }
        Err(PrintError::Connection(format!(
            "USB device {:04x}:{:04x} not found",
            vendor_id, product_id
        )))
    }

    pub fn from_device(device: Device<GlobalContext>) -> PrintResult<Self> {
        let label = match device.device_descriptor() {
            Ok(desc) => format!(
                "{:04x}:{:04x} (bus {} addr {})",
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address()
            ),
            Err(_) => format!("bus {} addr {}", device.bus_number(), device.address()),
        };
        let mut handle = device.open().map_err(usb_err)?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // unsupported on macOS / Windows
            debug!(error = %e, "Kernel driver auto-detach unavailable");
        }
        Ok(Self {
            device,
            handle: Mutex::new(handle),
            label,
        })
    }

    fn handle(&self) -> MutexGuard<'_, DeviceHandle<GlobalContext>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BulkDevice for RusbDevice {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn interfaces(&self) -> PrintResult<Vec<UsbInterfaceInfo>> {
        let config = self
            .device
            .active_config_descriptor()
            .or_else(|_| self.device.config_descriptor(0))
            .map_err(usb_err)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            // first alternate setting only
            let Some(desc) = interface.descriptors().next() else {
                continue;
            };
            let endpoints = desc
                .endpoint_descriptors()
                .map(|e| UsbEndpointInfo {
                    address: e.address(),
                    direction: match e.direction() {
                        Direction::In => EndpointDirection::In,
                        Direction::Out => EndpointDirection::Out,
                    },
                    bulk: e.transfer_type() == TransferType::Bulk,
                })
                .collect();
            interfaces.push(UsbInterfaceInfo {
                number: desc.interface_number(),
                class: desc.class_code(),
                endpoints,
            });
        }
        Ok(interfaces)
    }

    fn claim(&self, interface: u8) -> PrintResult<()> {
        self.handle().claim_interface(interface).map_err(usb_err)
    }

    fn release(&self, interface: u8) -> PrintResult<()> {
        let result = self.handle().release_interface(interface);
        if let Err(rusb::Error::NoDevice) = result {
            warn!(device = %self.label, "Device gone before release");
            return Ok(());
        }
        result.map_err(usb_err)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> PrintResult<usize> {
        self.handle().write_bulk(endpoint, data, timeout).map_err(usb_err)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> PrintResult<usize> {
        self.handle().read_bulk(endpoint, buf, timeout).map_err(usb_err)
    }
}
