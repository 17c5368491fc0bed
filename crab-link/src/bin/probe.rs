//! crab-link-probe: connect to a printer, optionally print a line, dump its status

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crab_link::{
    Connection, DEFAULT_TCP_PORT, LinkConfig, PrintError, PrintJob, PrinterWorker, StreamTransport, TcpDialer,
};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "crab-link-probe", version, about = "Probe an ESC/POS printer over TCP, USB, BLE or Bluetooth")]
struct Cli {
    /// Print this text (plus a line feed) before querying status
    #[arg(long, global = true)]
    text: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Raw TCP printer
    Tcp {
        host: String,
        #[arg(default_value_t = DEFAULT_TCP_PORT)]
        port: u16,
    },
    /// USB printer by vendor:product id (hex); first printer found when omitted
    Usb {
        #[arg(value_name = "VID:PID")]
        device: Option<String>,
    },
    /// BLE printer by advertised name or platform id
    Ble {
        target: String,
        /// Scan window in seconds
        #[arg(long, default_value_t = 5)]
        scan_secs: u64,
    },
    /// Paired Bluetooth Classic printer by address
    Bt { address: String },
    /// List attached USB printers
    ListUsb,
    /// List paired Bluetooth printers
    ListBt,
    /// Scan for BLE devices
    ScanBle {
        #[arg(long, default_value_t = 5)]
        secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "crab_link=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = LinkConfig::from_env();

    let conn: Box<dyn Connection> = match cli.cmd {
        Cmd::ListUsb => return list_usb(),
        Cmd::ListBt => return list_bt().await,
        Cmd::ScanBle { secs } => return scan_ble(secs).await,
        Cmd::Tcp { host, port } => Box::new(StreamTransport::new(
            TcpDialer::new(&host, port)?.with_timeout(config.tcp_connect_timeout()),
        )),
        Cmd::Usb { device } => open_usb(device.as_deref(), &config)?,
        Cmd::Ble { target, scan_secs } => open_ble(&target, scan_secs, &config).await?,
        Cmd::Bt { address } => open_bt(&address)?,
    };

    probe(conn, cli.text, &config).await
}

async fn probe(conn: Box<dyn Connection>, text: Option<String>, config: &LinkConfig) -> Result<()> {
    let printer = PrinterWorker::new(conn)
        .with_status_timeout(config.status_timeout())
        .spawn();

    printer
        .connect()
        .await
        .with_context(|| format!("connecting to {} printer {}", printer.kind(), printer.address()))?;

    if let Some(text) = text {
        let job = PrintJob::new()
            .write(text.as_bytes())
            .write(b"\n")
            .send(Duration::ZERO);
        printer.print(job).await.context("printing text")?;
    }

    let status = printer.query_status().await.context("querying status")?;
    tracing::info!(%status, "Printer status");

    let report = json!({
        "transport": printer.kind(),
        "address": printer.address(),
        "ready": status.is_ready(),
        "status": status,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    printer.disconnect().await?;
    Ok(())
}

fn unsupported(feature: &str) -> anyhow::Error {
    PrintError::Unsupported(format!("rebuild with the `{}` feature", feature)).into()
}

#[cfg(feature = "usb")]
fn parse_usb_id(id: &str) -> Result<(u16, u16)> {
    let (vid, pid) = id
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected VID:PID, got {}", id))?;
    Ok((u16::from_str_radix(vid, 16)?, u16::from_str_radix(pid, 16)?))
}

#[cfg(feature = "usb")]
fn open_usb(device: Option<&str>, config: &LinkConfig) -> Result<Box<dyn Connection>> {
    use crab_link::{UsbConnection, list_usb_printers};

    let (vid, pid) = match device {
        Some(id) => parse_usb_id(id)?,
        None => {
            let first = list_usb_printers()?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("no USB printer attached"))?;
            (first.vendor_id, first.product_id)
        }
    };
    Ok(Box::new(UsbConnection::open(vid, pid)?.with_config(config)))
}

#[cfg(not(feature = "usb"))]
fn open_usb(_device: Option<&str>, _config: &LinkConfig) -> Result<Box<dyn Connection>> {
    Err(unsupported("usb"))
}

#[cfg(feature = "usb")]
fn list_usb() -> Result<()> {
    let printers = crab_link::list_usb_printers()?;
    println!("{}", serde_json::to_string_pretty(&printers)?);
    Ok(())
}

#[cfg(not(feature = "usb"))]
fn list_usb() -> Result<()> {
    Err(unsupported("usb"))
}

#[cfg(feature = "ble")]
async fn open_ble(target: &str, scan_secs: u64, config: &LinkConfig) -> Result<Box<dyn Connection>> {
    let found = crab_link::scan_printers(Duration::from_secs(scan_secs)).await?;
    let printer = found
        .into_iter()
        .find(|p| p.id == target || p.name.eq_ignore_ascii_case(target))
        .ok_or_else(|| anyhow::anyhow!("BLE device {} not found", target))?;
    Ok(Box::new(printer.connection(crab_link::GattConfig::from(config))))
}

#[cfg(not(feature = "ble"))]
async fn open_ble(_target: &str, _scan_secs: u64, _config: &LinkConfig) -> Result<Box<dyn Connection>> {
    Err(unsupported("ble"))
}

#[cfg(feature = "ble")]
async fn scan_ble(secs: u64) -> Result<()> {
    let found = crab_link::scan_printers(Duration::from_secs(secs)).await?;
    let devices: Vec<_> = found
        .iter()
        .map(|p| json!({ "name": p.name, "id": p.id, "rssi": p.rssi, "known_service": p.known_service }))
        .collect();
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn scan_ble(_secs: u64) -> Result<()> {
    Err(unsupported("ble"))
}

#[cfg(all(feature = "rfcomm", target_os = "linux"))]
fn open_bt(address: &str) -> Result<Box<dyn Connection>> {
    let address: bluer::Address = address
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid Bluetooth address: {}", address))?;
    Ok(Box::new(crab_link::BluetoothConnection::rfcomm(address)))
}

#[cfg(not(all(feature = "rfcomm", target_os = "linux")))]
fn open_bt(_address: &str) -> Result<Box<dyn Connection>> {
    Err(unsupported("rfcomm"))
}

#[cfg(all(feature = "rfcomm", target_os = "linux"))]
async fn list_bt() -> Result<()> {
    let printers = crab_link::list_paired_printers().await?;
    let devices: Vec<_> = printers
        .iter()
        .map(|p| {
            json!({
                "address": p.address.to_string(),
                "name": p.name,
                "class_of_device": format!("0x{:06X}", p.class_of_device),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

#[cfg(not(all(feature = "rfcomm", target_os = "linux")))]
async fn list_bt() -> Result<()> {
    Err(unsupported("rfcomm"))
}
