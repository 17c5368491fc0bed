//! BLE stack seam
//!
//! A [`GattLink`] issues requests to the radio; the radio answers
//! asynchronously through [`GattEvent`]s pushed onto the channel handed to
//! [`GattLink::open`]. The session pump turns those answers into phase
//! changes.

use std::fmt;
use std::ops::BitOr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::PrintResult;

/// GATT characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharProps(u8);

impl CharProps {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// WRITE or WRITE_WITHOUT_RESPONSE
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }
}

impl BitOr for CharProps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A characteristic as reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharProps,
}

impl fmt::Display for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (service {}, props 0x{:02X})",
            self.uuid,
            self.service_uuid,
            self.properties.bits()
        )
    }
}

/// A discovered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// ATT write flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Write request, device answers with a write response
    WithResponse,
    /// Write command, no answer
    WithoutResponse,
}

/// Asynchronous signals from the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected,
    Disconnected,
    MtuChanged(u16),
    ServicesDiscovered(Result<Vec<GattService>, String>),
    /// Answer to a `WithResponse` write
    WriteAck(Result<(), String>),
}

pub type GattEventSender = mpsc::UnboundedSender<GattEvent>;

/// Requests toward one BLE peripheral
#[async_trait]
pub trait GattLink: Send + Sync + 'static {
    /// Device id / address for logs
    fn describe(&self) -> String;

    /// Connect. `Connected` / `Disconnected` arrive on `events`; the call
    /// itself may not return before the radio answers.
    async fn open(&self, events: GattEventSender) -> PrintResult<()>;

    /// Ask for a larger MTU. The answer arrives as `MtuChanged`.
    async fn request_mtu(&self, mtu: u16) -> PrintResult<()>;

    /// Start service discovery. The answer arrives as `ServicesDiscovered`.
    async fn discover_services(&self) -> PrintResult<()>;

    /// One ATT write. `WithResponse` writes are answered by `WriteAck`, and
    /// may block until that answer is in.
    async fn write(
        &self,
        characteristic: &GattCharacteristic,
        chunk: &[u8],
        kind: WriteKind,
    ) -> PrintResult<()>;

    /// Drop the link and release the stack resources
    async fn close(&self) -> PrintResult<()>;
}
