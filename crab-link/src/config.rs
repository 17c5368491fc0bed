use std::time::Duration;

use serde::Deserialize;

use crate::gatt::WriteTypePolicy;

/// Printer link configuration
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | PRINTER_TCP_CONNECT_TIMEOUT_MS | 5000 | TCP dial timeout |
/// | PRINTER_BLE_LINK_TIMEOUT_MS | 10000 | wait for the GATT link |
/// | PRINTER_BLE_DISCOVERY_TIMEOUT_MS | 10000 | wait for service discovery |
/// | PRINTER_BLE_WRITE_ACK_TIMEOUT_MS | 2000 | soft timeout of a confirmed write |
/// | PRINTER_BLE_REQUESTED_MTU | 512 | MTU asked for after connect |
/// | PRINTER_BLE_WRITE_POLICY | opportunistic | `opportunistic` or `strict` |
/// | PRINTER_USB_TRANSFER_TIMEOUT_MS | 5000 | bulk transfer timeout |
/// | PRINTER_STATUS_TIMEOUT_MS | 1000 | wait for one status bank reply |
/// | PRINTER_READ_POLL_MS | 10 | poll interval of USB reads |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub tcp_connect_timeout_ms: u64,
    pub ble_link_timeout_ms: u64,
    pub ble_discovery_timeout_ms: u64,
    pub ble_write_ack_timeout_ms: u64,
    pub ble_requested_mtu: u16,
    pub ble_write_policy: WriteTypePolicy,
    pub usb_transfer_timeout_ms: u64,
    pub status_timeout_ms: u64,
    pub read_poll_ms: u64,
}

impl LinkConfig {
    /// Load from environment variables, defaults for anything unset
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (tests, settings stores)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            tcp_connect_timeout_ms: num("PRINTER_TCP_CONNECT_TIMEOUT_MS", 5000),
            ble_link_timeout_ms: num("PRINTER_BLE_LINK_TIMEOUT_MS", 10_000),
            ble_discovery_timeout_ms: num("PRINTER_BLE_DISCOVERY_TIMEOUT_MS", 10_000),
            ble_write_ack_timeout_ms: num("PRINTER_BLE_WRITE_ACK_TIMEOUT_MS", 2000),
            ble_requested_mtu: lookup("PRINTER_BLE_REQUESTED_MTU")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(512),
            ble_write_policy: lookup("PRINTER_BLE_WRITE_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            usb_transfer_timeout_ms: num("PRINTER_USB_TRANSFER_TIMEOUT_MS", 5000),
            status_timeout_ms: num("PRINTER_STATUS_TIMEOUT_MS", 1000),
            read_poll_ms: num("PRINTER_READ_POLL_MS", 10),
        }
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }

    pub fn usb_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_transfer_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms.max(1))
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
