//! BLE GATT printer transport
//!
//! Connecting is a two-stage rendezvous with the BLE stack: the link must
//! come up within the link timeout, then MTU negotiation and service
//! discovery must yield a writable characteristic within the discovery
//! timeout. Both waits are released early by [`DisconnectSignal::trigger`].
//!
//! Writes are split to `MTU - 3` bytes with at least 50 ms between chunks;
//! cheap BLE printers drop data when fed faster.

mod discovery;
mod link;
mod session;

#[cfg(feature = "ble")]
mod btle;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::{BatchController, SendPlan};
use crate::config::LinkConfig;
use crate::connection::{Connection, DisconnectSignal, TransportKind, pause, until_cancelled};
use crate::error::{PrintError, PrintResult};
use crate::pacing::Pacing;

pub use discovery::{
    CharacteristicClassifier, KnownPrinterClassifier, PRINTER_SERVICE_UUIDS, WRITE_CHARACTERISTIC_UUIDS,
    is_known_printer_service,
};
pub use link::{CharProps, GattCharacteristic, GattEvent, GattEventSender, GattLink, GattService, WriteKind};
pub use session::{DEFAULT_ATT_MTU, GattPhase, MIN_BLE_CHUNK};

#[cfg(feature = "ble")]
pub use btle::{ASSUMED_MTU, BleConnection, BlePrinter, BtleplugLink, scan_printers};

use session::{PumpContext, SessionShared, run_pump};

/// Minimum gap between two BLE chunks
pub const MIN_CHUNK_GAP: Duration = Duration::from_millis(50);

/// Which ATT write flavour to use for a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteTypePolicy {
    /// Prefer write-without-response, even on WRITE-only characteristics,
    /// falling back to a confirmed write when the stack refuses
    #[default]
    Opportunistic,
    /// Write-without-response only when the characteristic advertises it
    Strict,
}

impl FromStr for WriteTypePolicy {
    type Err = PrintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opportunistic" => Ok(Self::Opportunistic),
            "strict" => Ok(Self::Strict),
            other => Err(PrintError::InvalidConfig(format!("Unknown BLE write policy: {}", other))),
        }
    }
}

/// How one chunk is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan {
    /// Write command, nothing to wait for
    Unacknowledged,
    /// Write command first, confirmed write if the stack refuses it
    TryUnacknowledged,
    /// Write request, then wait (softly) for the response
    Confirmed,
}

pub fn plan_write(properties: CharProps, policy: WriteTypePolicy) -> WritePlan {
    if properties.contains(CharProps::WRITE_WITHOUT_RESPONSE) {
        WritePlan::Unacknowledged
    } else if policy == WriteTypePolicy::Opportunistic && properties.contains(CharProps::WRITE) {
        WritePlan::TryUnacknowledged
    } else {
        WritePlan::Confirmed
    }
}

/// Timeouts and negotiation settings of a GATT session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattConfig {
    pub link_timeout: Duration,
    pub discovery_timeout: Duration,
    pub write_ack_timeout: Duration,
    pub requested_mtu: u16,
    pub write_policy: WriteTypePolicy,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for GattConfig {
    fn from(config: &LinkConfig) -> Self {
        Self {
            link_timeout: Duration::from_millis(config.ble_link_timeout_ms),
            discovery_timeout: Duration::from_millis(config.ble_discovery_timeout_ms),
            write_ack_timeout: Duration::from_millis(config.ble_write_ack_timeout_ms),
            requested_mtu: config.ble_requested_mtu,
            write_policy: config.ble_write_policy,
        }
    }
}

struct GattSession {
    shared: Arc<SessionShared>,
    pump: JoinHandle<()>,
}

/// Connection to a BLE printer through any [`GattLink`]
pub struct GattTransport<L: GattLink> {
    link: Arc<L>,
    config: GattConfig,
    classifier: Arc<dyn CharacteristicClassifier>,
    batch: BatchController,
    pacing: Pacing,
    signal: DisconnectSignal,
    session: Option<GattSession>,
}

impl<L: GattLink> GattTransport<L> {
    pub fn new(link: L) -> Self {
        Self {
            link: Arc::new(link),
            config: GattConfig::default(),
            classifier: Arc::new(KnownPrinterClassifier::default()),
            batch: BatchController::new(),
            pacing: Pacing::ble(),
            signal: DisconnectSignal::new(),
            session: None,
        }
    }

    pub fn with_config(mut self, config: GattConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: CharacteristicClassifier + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    pub fn phase(&self) -> GattPhase {
        self.session
            .as_ref()
            .map(|s| s.shared.phase())
            .unwrap_or(GattPhase::Disconnected)
    }

    /// MTU reported by the stack (20 until negotiated)
    pub fn negotiated_mtu(&self) -> Option<u16> {
        self.session.as_ref().map(|s| s.shared.mtu())
    }

    /// Characteristic print data goes to, once discovery has succeeded
    pub fn characteristic(&self) -> Option<GattCharacteristic> {
        self.session
            .as_ref()
            .and_then(|s| s.shared.writable().cloned())
    }

    fn ready_session(&self) -> Option<Arc<SessionShared>> {
        self.session
            .as_ref()
            .filter(|s| matches!(s.shared.phase(), GattPhase::Ready | GattPhase::Writing))
            .filter(|s| s.shared.writable().is_some())
            .map(|s| s.shared.clone())
    }

    /// Wait until `pred` holds for the session phase
    async fn await_phase<F>(
        shared: &SessionShared,
        token: &CancellationToken,
        deadline: Instant,
        timeout_msg: &str,
        pred: F,
    ) -> PrintResult<GattPhase>
    where
        F: Fn(&GattPhase) -> bool,
    {
        let mut rx = shared.subscribe();
        let wait = async {
            match tokio::time::timeout_at(deadline, rx.wait_for(|p| pred(p))).await {
                Ok(Ok(phase)) => Ok(*phase),
                Ok(Err(_)) => Err(PrintError::Connection("BLE session closed".to_string())),
                Err(_) => Err(PrintError::Timeout(timeout_msg.to_string())),
            }
        };
        until_cancelled(token, wait).await
    }

    async fn establish(&mut self, shared: Arc<SessionShared>, token: &CancellationToken) -> PrintResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_pump(
            PumpContext {
                shared: shared.clone(),
                link: self.link.clone(),
                events_tx: tx.clone(),
                requested_mtu: self.config.requested_mtu,
                classifier: self.classifier.clone(),
            },
            rx,
        ));
        self.session = Some(GattSession {
            shared: shared.clone(),
            pump,
        });

        // the stack may hold `open` until the radio answers
        let link_deadline = Instant::now() + self.config.link_timeout;
        let open = async {
            tokio::time::timeout_at(link_deadline, self.link.open(tx))
                .await
                .map_err(|_| PrintError::Timeout("BLE connection timeout".to_string()))?
        };
        until_cancelled(token, open).await?;

        let phase = Self::await_phase(
            &shared,
            token,
            link_deadline,
            "BLE connection timeout",
            |p| *p != GattPhase::Connecting,
        )
        .await?;
        if phase == GattPhase::Disconnected {
            return Err(PrintError::Connection(
                shared
                    .close_reason()
                    .unwrap_or_else(|| "Failed to connect to BLE device".to_string()),
            ));
        }

        let phase = Self::await_phase(
            &shared,
            token,
            Instant::now() + self.config.discovery_timeout,
            "BLE service discovery timeout",
            |p| matches!(p, GattPhase::Ready | GattPhase::Disconnected),
        )
        .await?;
        if phase == GattPhase::Disconnected || shared.writable().is_none() {
            return Err(PrintError::Connection(
                shared
                    .close_reason()
                    .unwrap_or_else(|| "No compatible print service found on BLE device".to_string()),
            ));
        }
        Ok(())
    }

    /// Stop the pump and close the link, at most once per session
    async fn teardown(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.shared.mark_disconnected(reason);
        session.pump.abort();
        if let Err(e) = self.link.close().await {
            warn!(device = %self.link.describe(), error = %e, "Error closing GATT link");
        }
    }

    async fn write_chunk(
        &self,
        shared: &SessionShared,
        token: &CancellationToken,
        characteristic: &GattCharacteristic,
        chunk: &[u8],
    ) -> PrintResult<()> {
        match plan_write(characteristic.properties, self.config.write_policy) {
            WritePlan::Unacknowledged => {
                self.link
                    .write(characteristic, chunk, WriteKind::WithoutResponse)
                    .await
            }
            WritePlan::TryUnacknowledged => {
                match self
                    .link
                    .write(characteristic, chunk, WriteKind::WithoutResponse)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        debug!(error = %e, "Write command refused, using write request");
                        self.confirmed_write(shared, token, characteristic, chunk).await
                    }
                }
            }
            WritePlan::Confirmed => self.confirmed_write(shared, token, characteristic, chunk).await,
        }
    }

    async fn confirmed_write(
        &self,
        shared: &SessionShared,
        token: &CancellationToken,
        characteristic: &GattCharacteristic,
        chunk: &[u8],
    ) -> PrintResult<()> {
        let timeout = self.config.write_ack_timeout;
        let deadline = Instant::now() + timeout;
        let ack = shared.arm_ack();

        // some stacks only return from a write request once the response is in
        let request = self.link.write(characteristic, chunk, WriteKind::WithResponse);
        let written = until_cancelled(token, async { Ok(tokio::time::timeout_at(deadline, request).await) }).await;
        match written {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) | Err(e) => {
                shared.disarm_ack();
                return Err(e);
            }
            Ok(Err(_)) => {
                shared.disarm_ack();
                warn!(timeout_ms = timeout.as_millis() as u64, "Write request unanswered, continuing");
                return Ok(());
            }
        }

        let waited = until_cancelled(token, async { Ok(tokio::time::timeout_at(deadline, ack).await) }).await?;
        match waited {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(status))) => error!(%status, "Characteristic write failed"),
            Ok(Err(_)) => {
                return Err(PrintError::Connection(
                    "BLE link lost while waiting for write response".to_string(),
                ));
            }
            Err(_) => {
                // the device often keeps printing without answering
                shared.abandon_ack();
                warn!(timeout_ms = timeout.as_millis() as u64, "Write response timeout, continuing");
            }
        }
        Ok(())
    }

    async fn write_payload(
        &self,
        shared: &SessionShared,
        token: &CancellationToken,
        characteristic: &GattCharacteristic,
        payload: &[u8],
    ) -> PrintResult<()> {
        let chunks = self.pacing.chunks(payload);
        let count = chunks.len();
        let gap = self.pacing.chunk_delay.max(MIN_CHUNK_GAP);

        for (i, chunk) in chunks.into_iter().enumerate() {
            if shared.phase() == GattPhase::Disconnected {
                return Err(PrintError::Connection("BLE link lost during write".to_string()));
            }
            self.write_chunk(shared, token, characteristic, chunk).await?;
            if i + 1 < count {
                pause(gap).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<L: GattLink> Connection for GattTransport<L> {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn describe(&self) -> String {
        self.link.describe()
    }

    fn is_connected(&self) -> bool {
        self.ready_session().is_some()
    }

    #[instrument(skip(self), fields(device = %self.link.describe()))]
    async fn connect(&mut self) -> PrintResult<()> {
        if self.is_connected() {
            debug!("Already connected");
            return Ok(());
        }
        // stale session from a lost link
        self.teardown("Reconnecting").await;

        self.signal.rearm();
        let token = self.signal.token();
        let shared = Arc::new(SessionShared::new());
        info!(mtu = self.config.requested_mtu, "Connecting to BLE device");

        if let Err(e) = self.establish(shared.clone(), &token).await {
            error!(error = %e, "BLE connect failed");
            self.teardown(&e.to_string()).await;
            return Err(e);
        }

        self.pacing.chunk_size = shared.chunk_size();
        self.batch.clear();
        info!(
            mtu = shared.mtu(),
            chunk = self.pacing.chunk_size,
            "BLE printer ready"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.signal.trigger();
        self.batch.clear();
        if self.session.is_some() {
            self.teardown("Closed by host").await;
            info!(device = %self.link.describe(), "BLE disconnected");
        }
    }

    async fn send(&mut self, extra_wait: Duration) -> PrintResult<()> {
        if self.batch.begin_send(extra_wait) == SendPlan::Deferred {
            return Ok(());
        }

        let Some(shared) = self.ready_session() else {
            error!(device = %self.link.describe(), "Send failed: not connected");
            return Err(PrintError::NotConnected);
        };
        let Some(characteristic) = shared.writable().cloned() else {
            return Err(PrintError::NotConnected);
        };

        // the MTU may have grown since connect
        self.pacing.chunk_size = shared.chunk_size();
        let token = self.signal.token();
        let payload = self.batch.take();
        debug!(
            bytes = payload.len(),
            chunk = self.pacing.chunk_size,
            characteristic = %characteristic.uuid,
            "Sending over BLE"
        );

        shared.set_phase(GattPhase::Writing);
        let result = self
            .write_payload(&shared, &token, &characteristic, &payload)
            .await;
        if shared.phase() == GattPhase::Writing {
            shared.set_phase(GattPhase::Ready);
        }

        if let Err(e) = result {
            error!(error = %e, "BLE send failed");
            self.batch.restore(payload);
            return Err(e);
        }

        pause(self.pacing.settle_time(payload.len(), extra_wait)).await;
        debug!(bytes = payload.len(), "BLE send complete");
        Ok(())
    }

    /// Write-only transport: always empty
    async fn read(&mut self, _timeout: Duration) -> PrintResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn can_read(&self) -> bool {
        false
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
