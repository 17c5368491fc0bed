//! Bluetooth Classic (SPP over RFCOMM)
//!
//! The service UUID and printer classification rules are platform neutral;
//! the dialer and paired-device listing use BlueZ through `bluer` and are
//! only built with the `rfcomm` feature on Linux.

use uuid::Uuid;

/// Well-known Serial Port Profile UUID
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Class of Device: imaging major class
const MAJOR_CLASS_IMAGING: u32 = 0x0600;
/// Class of Device: imaging / printer minor class
const DEVICE_CLASS_PRINTER: u32 = 0x0680;

/// Pick the RFCOMM service to bind
///
/// SPP when advertised, else the first advertised service, else SPP.
pub fn select_service_uuid(advertised: &[Uuid]) -> Uuid {
    if advertised.is_empty() || advertised.contains(&SPP_UUID) {
        return SPP_UUID;
    }
    advertised.iter().min().copied().unwrap_or(SPP_UUID)
}

/// Whether a Class of Device value describes a printer
pub fn is_printer_class(class_of_device: u32) -> bool {
    let major = class_of_device & 0x1F00;
    let device = class_of_device & 0x1FFC;
    major == MAJOR_CLASS_IMAGING && (device == DEVICE_CLASS_PRINTER || device == MAJOR_CLASS_IMAGING)
}

#[cfg(all(feature = "rfcomm", target_os = "linux"))]
pub use bluez::{BluetoothConnection, PairedPrinter, RfcommDialer, list_paired_printers};

#[cfg(all(feature = "rfcomm", target_os = "linux"))]
mod bluez {
    use async_trait::async_trait;
    use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream};
    use bluer::{Address, Session};
    use futures::StreamExt;
    use tokio::sync::Mutex;
    use tracing::{debug, info, instrument};

    use super::{is_printer_class, select_service_uuid};
    use crate::connection::TransportKind;
    use crate::error::{PrintError, PrintResult};
    use crate::pacing::Pacing;
    use crate::stream::{StreamDialer, StreamTransport};

    /// Bluetooth Classic printer connection
    pub type BluetoothConnection = StreamTransport<RfcommDialer>;

    impl BluetoothConnection {
        pub fn rfcomm(address: Address) -> Self {
            Self::new(RfcommDialer::new(address))
        }
    }

    /// A paired device that looks like a printer
    #[derive(Debug, Clone)]
    pub struct PairedPrinter {
        pub address: Address,
        pub name: Option<String>,
        pub class_of_device: u32,
    }

    fn bt_err(e: bluer::Error) -> PrintError {
        PrintError::Connection(format!("Bluetooth: {}", e))
    }

    /// Dials a paired device through a BlueZ client profile
    pub struct RfcommDialer {
        address: Address,
        // keeps the profile registered while the stream is open
        profile: Mutex<Option<ProfileHandle>>,
    }

    impl RfcommDialer {
        pub fn new(address: Address) -> Self {
            Self {
                address,
                profile: Mutex::new(None),
            }
        }

        pub fn address(&self) -> Address {
            self.address
        }
    }

    #[async_trait]
    impl StreamDialer for RfcommDialer {
        type Stream = Stream;

        fn kind(&self) -> TransportKind {
            TransportKind::Bluetooth
        }

        fn describe(&self) -> String {
            self.address.to_string()
        }

        fn default_pacing(&self) -> Pacing {
            Pacing::rfcomm()
        }

        #[instrument(skip(self), fields(address = %self.address))]
        async fn dial(&self) -> PrintResult<Stream> {
            let session = Session::new().await.map_err(bt_err)?;
            let adapter = session.default_adapter().await.map_err(bt_err)?;
            let device = adapter.device(self.address).map_err(bt_err)?;

            let advertised: Vec<_> = device
                .uuids()
                .await
                .map_err(bt_err)?
                .unwrap_or_default()
                .into_iter()
                .collect();
            let uuid = select_service_uuid(&advertised);
            info!(%uuid, "Using RFCOMM service");

            let profile = Profile {
                uuid,
                role: Some(Role::Client),
                require_authentication: Some(false),
                require_authorization: Some(false),
                auto_connect: Some(false),
                ..Default::default()
            };
            // BlueZ refuses a second registration of the same UUID
            drop(self.profile.lock().await.take());
            let mut handle = session.register_profile(profile).await.map_err(bt_err)?;

            // BlueZ answers connect_profile only after the request is accepted
            let accept = async {
                let request = handle.next().await.ok_or_else(|| {
                    PrintError::Connection("Bluetooth profile closed before connecting".to_string())
                })?;
                request.accept().map_err(bt_err)
            };
            let (connected, stream) = tokio::join!(device.connect_profile(&uuid), accept);
            connected.map_err(bt_err)?;
            let stream = stream?;

            *self.profile.lock().await = Some(handle);
            Ok(stream)
        }

        async fn hang_up(&self) {
            if self.profile.lock().await.take().is_some() {
                debug!(address = %self.address, "RFCOMM profile unregistered");
            }
        }
    }

    /// List paired devices whose Class of Device says "printer"
    pub async fn list_paired_printers() -> PrintResult<Vec<PairedPrinter>> {
        let session = Session::new().await.map_err(bt_err)?;
        let adapter = session.default_adapter().await.map_err(bt_err)?;
        if !adapter.is_powered().await.map_err(bt_err)? {
            return Ok(Vec::new());
        }

        let mut printers = Vec::new();
        for address in adapter.device_addresses().await.map_err(bt_err)? {
            let device = adapter.device(address).map_err(bt_err)?;
            if !device.is_paired().await.map_err(bt_err)? {
                continue;
            }
            let Some(class_of_device) = device.class().await.map_err(bt_err)? else {
                continue;
            };
            if is_printer_class(class_of_device) {
                printers.push(PairedPrinter {
                    address,
                    name: device.name().await.map_err(bt_err)?,
                    class_of_device,
                });
            }
        }
        info!(count = printers.len(), "Paired Bluetooth printers");
        Ok(printers)
    }
}
