//! btleplug-backed GATT link
//!
//! btleplug exposes blocking-style async calls rather than callbacks, so each
//! completed request is echoed onto the event channel. Disconnects are
//! picked up from the adapter event stream.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::discovery::is_known_printer_service;
use super::link::{CharProps, GattCharacteristic, GattEvent, GattEventSender, GattLink, GattService, WriteKind};
use super::{GattConfig, GattTransport};
use crate::error::{PrintError, PrintResult};

/// btleplug cannot query the ATT MTU; 185 is what iOS/macOS and most
/// BlueZ setups settle on
pub const ASSUMED_MTU: u16 = 185;

/// BLE printer connection through the platform stack
pub type BleConnection = GattTransport<BtleplugLink>;

fn ble_err(e: btleplug::Error) -> PrintError {
    PrintError::Connection(format!("BLE: {}", e))
}

#[derive(Default)]
struct LinkState {
    events: Option<GattEventSender>,
    characteristics: Vec<Characteristic>,
    watcher: Option<JoinHandle<()>>,
}

impl LinkState {
    fn emit(&self, event: GattEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// [`GattLink`] over one btleplug peripheral
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    assumed_mtu: u16,
    state: Mutex<LinkState>,
}

impl BtleplugLink {
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
            assumed_mtu: ASSUMED_MTU,
            state: Mutex::new(LinkState::default()),
        }
    }

    /// MTU reported back after `request_mtu`
    pub fn with_assumed_mtu(mut self, mtu: u16) -> Self {
        self.assumed_mtu = mtu;
        self
    }

    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    async fn spawn_watcher(&self, events: GattEventSender) -> PrintResult<JoinHandle<()>> {
        let mut stream = self.adapter.events().await.map_err(ble_err)?;
        let id = self.peripheral.id();
        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                    let _ = events.send(GattEvent::Disconnected);
                    break;
                }
            }
        }))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn describe(&self) -> String {
        self.peripheral.id().to_string()
    }

    async fn open(&self, events: GattEventSender) -> PrintResult<()> {
        let watcher = self.spawn_watcher(events.clone()).await?;
        {
            let mut state = self.state.lock().await;
            if let Some(old) = state.watcher.replace(watcher) {
                old.abort();
            }
            state.events = Some(events.clone());
            state.characteristics.clear();
        }

        match self.peripheral.connect().await {
            Ok(()) => {
                let _ = events.send(GattEvent::Connected);
                Ok(())
            }
            Err(e) => {
                let _ = events.send(GattEvent::Disconnected);
                Err(ble_err(e))
            }
        }
    }

    async fn request_mtu(&self, mtu: u16) -> PrintResult<()> {
        let effective = mtu.min(self.assumed_mtu);
        debug!(requested = mtu, effective, "MTU not negotiable through btleplug");
        self.state.lock().await.emit(GattEvent::MtuChanged(effective));
        Ok(())
    }

    async fn discover_services(&self) -> PrintResult<()> {
        self.peripheral.discover_services().await.map_err(ble_err)?;

        let services: Vec<GattService> = self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        service_uuid: c.service_uuid,
                        properties: CharProps::from_bits(c.properties.bits()),
                    })
                    .collect(),
            })
            .collect();
        debug!(count = services.len(), "Services discovered");

        let mut state = self.state.lock().await;
        state.characteristics = self.peripheral.characteristics().into_iter().collect();
        state.emit(GattEvent::ServicesDiscovered(Ok(services)));
        Ok(())
    }

    async fn write(&self, characteristic: &GattCharacteristic, chunk: &[u8], kind: WriteKind) -> PrintResult<()> {
        let target = {
            let state = self.state.lock().await;
            state
                .characteristics
                .iter()
                .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
                .cloned()
        };
        let Some(target) = target else {
            return Err(PrintError::Connection(format!(
                "Characteristic {} not discovered",
                characteristic.uuid
            )));
        };

        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral
            .write(&target, chunk, write_type)
            .await
            .map_err(ble_err)?;

        // btleplug resolves a write request only once the response is in
        if kind == WriteKind::WithResponse {
            self.state.lock().await.emit(GattEvent::WriteAck(Ok(())));
        }
        Ok(())
    }

    async fn close(&self) -> PrintResult<()> {
        let state = std::mem::take(&mut *self.state.lock().await);
        if let Some(watcher) = state.watcher {
            watcher.abort();
        }
        if self.peripheral.is_connected().await.map_err(ble_err)? {
            self.peripheral.disconnect().await.map_err(ble_err)?;
        }
        Ok(())
    }
}

/// A BLE device seen during a scan
#[derive(Debug, Clone)]
pub struct BlePrinter {
    pub name: String,
    /// Platform id (address on Linux, UUID on macOS)
    pub id: String,
    pub rssi: Option<i16>,
    /// Advertises one of the known printer services
    pub known_service: bool,
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BlePrinter {
    pub fn connection(&self, config: GattConfig) -> BleConnection {
        GattTransport::new(BtleplugLink::new(self.adapter.clone(), self.peripheral.clone())).with_config(config)
    }
}

async fn first_adapter() -> PrintResult<Adapter> {
    let manager = Manager::new().await.map_err(ble_err)?;
    manager
        .adapters()
        .await
        .map_err(ble_err)?
        .into_iter()
        .next()
        .ok_or_else(|| PrintError::Connection("No BLE adapter found".to_string()))
}

/// Scan for BLE devices, known printer services first
pub async fn scan_printers(window: Duration) -> PrintResult<Vec<BlePrinter>> {
    let adapter = first_adapter().await?;
    info!(window_ms = window.as_millis() as u64, "Starting BLE scan");

    let mut events = adapter.events().await.map_err(ble_err)?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(ble_err)?;

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut found = Vec::new();
    let mut seen = HashSet::new();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => {
                let Some(event) = event else { break };
                let CentralEvent::DeviceDiscovered(id) = event else { continue };
                if !seen.insert(id.to_string()) {
                    continue;
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                let Ok(Some(props)) = peripheral.properties().await else { continue };
                let name = props
                    .local_name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| "Unknown BLE Device".to_string());

                let known_service = props.services.iter().any(is_known_printer_service);
                info!(%name, id = %id, known_service, "Found BLE device");
                found.push(BlePrinter {
                    name,
                    id: id.to_string(),
                    rssi: props.rssi,
                    known_service,
                    adapter: adapter.clone(),
                    peripheral,
                });
            }
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        warn!(error = %e, "Failed to stop BLE scan");
    }

    found.sort_by_key(|p| (!p.known_service, std::cmp::Reverse(p.rssi)));
    info!(count = found.len(), "BLE scan complete");
    Ok(found)
}
