//! Per-connection GATT state and the event pump that drives it

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::discovery::CharacteristicClassifier;
use super::link::{GattCharacteristic, GattEvent, GattEventSender, GattLink, GattService};

/// ATT default MTU; the payload limit before any negotiation
pub const DEFAULT_ATT_MTU: u16 = 20;
/// Smallest chunk ever written, whatever the stack reports
pub const MIN_BLE_CHUNK: usize = 20;

/// BLE session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GattPhase {
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Writing,
}

type AckSender = oneshot::Sender<Result<(), String>>;

/// Waiter for the next write response
///
/// ATT allows one outstanding request per link, so responses arrive in
/// request order; `stale` counts the ones owed to writes that gave up.
#[derive(Default)]
struct AckSlot {
    waiter: Option<AckSender>,
    stale: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the transport and the pump task
pub(crate) struct SessionShared {
    phase: watch::Sender<GattPhase>,
    mtu: AtomicU16,
    writable: OnceLock<GattCharacteristic>,
    pending_ack: Mutex<AckSlot>,
    close_reason: Mutex<Option<String>>,
}

impl SessionShared {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(GattPhase::Connecting);
        Self {
            phase,
            mtu: AtomicU16::new(DEFAULT_ATT_MTU),
            writable: OnceLock::new(),
            pending_ack: Mutex::new(AckSlot::default()),
            close_reason: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> GattPhase {
        *self.phase.borrow()
    }

    pub fn set_phase(&self, phase: GattPhase) {
        self.phase.send_replace(phase);
    }

    pub fn subscribe(&self) -> watch::Receiver<GattPhase> {
        self.phase.subscribe()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }

    /// Payload bytes per ATT write: MTU minus the 3-byte header, never below 20
    pub fn chunk_size(&self) -> usize {
        (self.mtu().saturating_sub(3) as usize).max(MIN_BLE_CHUNK)
    }

    pub fn writable(&self) -> Option<&GattCharacteristic> {
        self.writable.get()
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.close_reason).clone()
    }

    /// Install the one-shot waiter for the next write response
    pub fn arm_ack(&self) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_ack).waiter = Some(tx);
        rx
    }

    /// Drop the waiter; no response is coming for it
    pub fn disarm_ack(&self) {
        lock(&self.pending_ack).waiter.take();
    }

    /// Drop the waiter of a write whose response may still arrive
    pub fn abandon_ack(&self) {
        let mut slot = lock(&self.pending_ack);
        if slot.waiter.take().is_some() {
            slot.stale += 1;
        }
    }

    /// Move to Disconnected, keep the first reason, release a parked ack waiter
    pub fn mark_disconnected(&self, reason: &str) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        // dropping the sender wakes the waiter with an error
        *lock(&self.pending_ack) = AckSlot::default();
        self.set_phase(GattPhase::Disconnected);
    }

    fn resolve_ack(&self, result: Result<(), String>) {
        let mut slot = lock(&self.pending_ack);
        if slot.stale > 0 {
            slot.stale -= 1;
            debug!(?result, "Late write response dropped");
            return;
        }
        match slot.waiter.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(?result, "Write response with no waiter"),
        }
    }

    fn on_services(&self, services: &[GattService], classifier: &dyn CharacteristicClassifier) {
        match classifier.select(services) {
            Some(characteristic) => {
                info!(%characteristic, mtu = self.mtu(), "Write characteristic selected");
                let _ = self.writable.set(characteristic);
                self.set_phase(GattPhase::Ready);
            }
            None => {
                error!(services = services.len(), "No writable characteristic found");
                self.mark_disconnected("No compatible print service found on BLE device");
            }
        }
    }
}

/// Everything the pump needs besides the channel
pub(crate) struct PumpContext<L: GattLink> {
    pub shared: Arc<SessionShared>,
    pub link: Arc<L>,
    pub events_tx: GattEventSender,
    pub requested_mtu: u16,
    pub classifier: Arc<dyn CharacteristicClassifier>,
}

/// Apply BLE stack events to the session until the link goes down
///
/// Stack callbacks only ever land here, so phase changes are serialized.
pub(crate) async fn run_pump<L: GattLink>(ctx: PumpContext<L>, mut events: mpsc::UnboundedReceiver<GattEvent>) {
    // aborted together with the pump
    let mut kickoff = JoinSet::new();

    while let Some(event) = events.recv().await {
        let shared = &ctx.shared;
        match event {
            GattEvent::Connected => {
                if shared.phase() != GattPhase::Connecting {
                    debug!(phase = ?shared.phase(), "Ignoring duplicate connected event");
                    continue;
                }
                info!("GATT link up, discovering services");
                shared.set_phase(GattPhase::Discovering);

                let link = ctx.link.clone();
                let tx = ctx.events_tx.clone();
                let mtu = ctx.requested_mtu;
                kickoff.spawn(async move {
                    let (mtu_result, discover_result) = tokio::join!(link.request_mtu(mtu), link.discover_services());
                    if let Err(e) = mtu_result {
                        warn!(error = %e, "MTU request failed, keeping default");
                    }
                    if let Err(e) = discover_result {
                        let _ = tx.send(GattEvent::ServicesDiscovered(Err(e.to_string())));
                    }
                });
            }
            GattEvent::MtuChanged(mtu) => {
                // 0 would make the chunk math meaningless
                if mtu > 0 {
                    shared.mtu.store(mtu, Ordering::Release);
                    info!(mtu, chunk = shared.chunk_size(), "MTU changed");
                }
            }
            GattEvent::ServicesDiscovered(result) => {
                if shared.phase() != GattPhase::Discovering {
                    debug!(phase = ?shared.phase(), "Ignoring late service discovery");
                    continue;
                }
                match result {
                    Ok(services) => shared.on_services(&services, ctx.classifier.as_ref()),
                    Err(e) => {
                        error!(error = %e, "Service discovery failed");
                        shared.mark_disconnected(&format!("Service discovery failed: {}", e));
                    }
                }
            }
            GattEvent::WriteAck(result) => shared.resolve_ack(result),
            GattEvent::Disconnected => {
                warn!(phase = ?shared.phase(), "GATT link down");
                shared.mark_disconnected("BLE device disconnected");
                break;
            }
        }
    }
}
