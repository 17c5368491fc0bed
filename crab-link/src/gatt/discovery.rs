//! Writable characteristic resolution
//!
//! Printers rarely advertise a standard service, so the characteristic we
//! print to is found heuristically: known chipset services first, then any
//! characteristic that accepts writes.

use uuid::Uuid;

use super::link::{GattCharacteristic, GattService};

/// Printer services of common BLE chipset families
pub const PRINTER_SERVICE_UUIDS: [Uuid; 5] = [
    Uuid::from_u128(0x0000FF00_0000_1000_8000_00805F9B34FB), // generic Chinese printers
    Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455), // Microchip / ISSC
    Uuid::from_u128(0xE7810A71_73AE_499D_8C15_FAA9AEF0C3F2),
    Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E), // Nordic UART
    Uuid::from_u128(0x000018F0_0000_1000_8000_00805F9B34FB),
];

/// Write characteristics of the same families
pub const WRITE_CHARACTERISTIC_UUIDS: [Uuid; 5] = [
    Uuid::from_u128(0x0000FF02_0000_1000_8000_00805F9B34FB),
    Uuid::from_u128(0x49535343_8841_43F4_A8D4_ECBE34729BB3),
    Uuid::from_u128(0xBEF8D6C9_9C21_4C9E_B632_BD58C1009F9F),
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E), // Nordic UART TX
    Uuid::from_u128(0x0000FF01_0000_1000_8000_00805F9B34FB),
];

pub fn is_known_printer_service(uuid: &Uuid) -> bool {
    PRINTER_SERVICE_UUIDS.contains(uuid)
}

/// Chooses the characteristic print data is written to
pub trait CharacteristicClassifier: Send + Sync {
    fn select(&self, services: &[GattService]) -> Option<GattCharacteristic>;
}

/// Allowlist first, then (optionally) any writable characteristic
#[derive(Debug, Clone)]
pub struct KnownPrinterClassifier {
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    scan_unknown_services: bool,
}

impl Default for KnownPrinterClassifier {
    fn default() -> Self {
        Self {
            services: PRINTER_SERVICE_UUIDS.to_vec(),
            characteristics: WRITE_CHARACTERISTIC_UUIDS.to_vec(),
            scan_unknown_services: true,
        }
    }
}

impl KnownPrinterClassifier {
    pub fn new(services: Vec<Uuid>, characteristics: Vec<Uuid>) -> Self {
        Self {
            services,
            characteristics,
            scan_unknown_services: true,
        }
    }

    /// Disable the "any writable characteristic on any service" fallback
    pub fn strict(mut self) -> Self {
        self.scan_unknown_services = false;
        self
    }

    fn pick_in(&self, service: &GattService) -> Option<GattCharacteristic> {
        for uuid in &self.characteristics {
            if let Some(c) = service
                .characteristics
                .iter()
                .find(|c| c.uuid == *uuid && c.properties.is_writable())
            {
                tracing::info!(characteristic = %c.uuid, "Found known write characteristic");
                return Some(c.clone());
            }
        }

        let found = service
            .characteristics
            .iter()
            .find(|c| c.properties.is_writable())
            .cloned();
        if let Some(c) = &found {
            tracing::info!(characteristic = %c.uuid, "Found writable characteristic");
        }
        found
    }
}

impl CharacteristicClassifier for KnownPrinterClassifier {
    fn select(&self, services: &[GattService]) -> Option<GattCharacteristic> {
        tracing::debug!(count = services.len(), "Resolving write characteristic");

        for uuid in &self.services {
            if let Some(service) = services.iter().find(|s| s.uuid == *uuid) {
                tracing::info!(service = %uuid, "Found known printer service");
                if let Some(c) = self.pick_in(service) {
                    return Some(c);
                }
            }
        }

        if !self.scan_unknown_services {
            return None;
        }

        services.iter().find_map(|service| {
            tracing::debug!(service = %service.uuid, "Scanning service");
            self.pick_in(service)
        })
    }
}
