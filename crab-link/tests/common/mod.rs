//! In-memory fakes for every transport seam
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use crab_link::gatt::{CharProps, GattCharacteristic, GattEvent, GattEventSender, GattLink, GattService, WriteKind};
use crab_link::usb::{BulkDevice, EndpointDirection, UsbEndpointInfo, UsbInterfaceInfo};
use crab_link::{Pacing, PrintError, PrintResult, StreamDialer, StreamTransport, TransportKind};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use uuid::Uuid;

/// Status byte answered for each DLE EOT n found in `data`
fn status_answers(data: &[u8], replies: &HashMap<u8, u8>) -> Vec<u8> {
    data.windows(3)
        .filter(|w| w[0] == 0x10 && w[1] == 0x04)
        .filter_map(|w| replies.get(&w[2]).copied())
        .collect()
}

// ---------------------------------------------------------------------------
// Byte stream

#[derive(Default)]
pub struct WireState {
    chunks: Vec<(Instant, Vec<u8>)>,
    inbound: VecDeque<u8>,
    status_replies: HashMap<u8, u8>,
    read_waker: Option<Waker>,
    fail_writes: bool,
    refuse_dial: bool,
    shutdowns: usize,
    dials: usize,
    hang_ups: usize,
}

/// Shared view of everything that crossed a fake stream
#[derive(Clone, Default)]
pub struct Wire(Arc<Mutex<WireState>>);

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer DLE EOT `bank` with `reply`
    pub fn with_status(self, bank: u8, reply: u8) -> Self {
        self.lock().status_replies.insert(bank, reply);
        self
    }

    fn lock(&self) -> MutexGuard<'_, WireState> {
        self.0.lock().unwrap()
    }

    /// Every physical write, in order
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.lock().chunks.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn chunk_times(&self) -> Vec<Instant> {
        self.lock().chunks.iter().map(|(t, _)| *t).collect()
    }

    pub fn received(&self) -> Vec<u8> {
        self.chunks().concat()
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.inbound.extend(bytes);
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_refuse_dial(&self, refuse: bool) {
        self.lock().refuse_dial = refuse;
    }

    pub fn shutdowns(&self) -> usize {
        self.lock().shutdowns
    }

    pub fn dials(&self) -> usize {
        self.lock().dials
    }

    pub fn hang_ups(&self) -> usize {
        self.lock().hang_ups
    }
}

pub struct FakeStream {
    wire: Wire,
}

impl AsyncWrite for FakeStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.wire.lock();
        if state.fail_writes {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "link dropped")));
        }
        state.chunks.push((Instant::now(), buf.to_vec()));
        let answers = status_answers(buf, &state.status_replies);
        if !answers.is_empty() {
            state.inbound.extend(answers);
            if let Some(waker) = state.read_waker.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.wire.lock().shutdowns += 1;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for FakeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.wire.lock();
        if state.inbound.is_empty() {
            state.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        while buf.remaining() > 0 {
            match state.inbound.pop_front() {
                Some(b) => buf.put_slice(&[b]),
                None => break,
            }
        }
        Poll::Ready(Ok(()))
    }
}

pub struct FakeDialer {
    wire: Wire,
    pacing: Pacing,
}

#[async_trait]
impl StreamDialer for FakeDialer {
    type Stream = FakeStream;

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn describe(&self) -> String {
        "fake-printer:9100".to_string()
    }

    fn default_pacing(&self) -> Pacing {
        self.pacing
    }

    async fn dial(&self) -> PrintResult<FakeStream> {
        let mut state = self.wire.lock();
        state.dials += 1;
        if state.refuse_dial {
            return Err(PrintError::Connection("connection refused".to_string()));
        }
        Ok(FakeStream {
            wire: self.wire.clone(),
        })
    }

    async fn hang_up(&self) {
        self.wire.lock().hang_ups += 1;
    }
}

pub fn stream_conn(wire: &Wire, pacing: Pacing) -> StreamTransport<FakeDialer> {
    StreamTransport::new(FakeDialer {
        wire: wire.clone(),
        pacing,
    })
}

// ---------------------------------------------------------------------------
// GATT

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkBehavior {
    Connects,
    Refuses,
    /// Never answers the connect request
    Silent,
    /// `open` itself never returns, like a stack that awaits the connection
    Hangs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    Respond,
    Nack,
    Silent,
    /// The write request call never returns
    Hangs,
}

#[derive(Debug, Clone)]
pub struct GattScript {
    pub link: LinkBehavior,
    pub discovery_answers: bool,
    pub mtu_reply: Option<u16>,
    pub services: Vec<GattService>,
    pub ack: AckBehavior,
    /// Refuse write commands on characteristics that do not advertise them
    pub reject_write_commands: bool,
}

impl Default for GattScript {
    fn default() -> Self {
        Self {
            link: LinkBehavior::Connects,
            discovery_answers: true,
            mtu_reply: Some(185),
            services: Vec::new(),
            ack: AckBehavior::Respond,
            reject_write_commands: false,
        }
    }
}

#[derive(Default)]
struct GattRecord {
    writes: Vec<(Instant, WriteKind, Vec<u8>)>,
    opens: usize,
    closes: usize,
    events: Option<GattEventSender>,
}

#[derive(Clone)]
pub struct FakeGatt {
    script: Arc<GattScript>,
    record: Arc<Mutex<GattRecord>>,
}

pub const FF00_SERVICE: Uuid = Uuid::from_u128(0x0000FF00_0000_1000_8000_00805F9B34FB);
pub const FF02_CHAR: Uuid = Uuid::from_u128(0x0000FF02_0000_1000_8000_00805F9B34FB);

/// One known printer service with one characteristic
pub fn printer_service(props: CharProps) -> Vec<GattService> {
    vec![GattService {
        uuid: FF00_SERVICE,
        characteristics: vec![GattCharacteristic {
            uuid: FF02_CHAR,
            service_uuid: FF00_SERVICE,
            properties: props,
        }],
    }]
}

impl FakeGatt {
    pub fn new(script: GattScript) -> Self {
        Self {
            script: Arc::new(script),
            record: Arc::new(Mutex::new(GattRecord::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GattRecord> {
        self.record.lock().unwrap()
    }

    fn emit(&self, event: GattEvent) {
        if let Some(tx) = &self.lock().events {
            let _ = tx.send(event);
        }
    }

    pub fn writes(&self) -> Vec<(Instant, WriteKind, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock().writes.iter().map(|(_, _, p)| p.clone()).collect()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    /// Radio drops the link
    pub fn drop_link(&self) {
        self.emit(GattEvent::Disconnected);
    }
}

#[async_trait]
impl GattLink for FakeGatt {
    fn describe(&self) -> String {
        "AA:BB:CC:DD:EE:FF".to_string()
    }

    async fn open(&self, events: GattEventSender) -> PrintResult<()> {
        {
            let mut record = self.lock();
            record.opens += 1;
            record.events = Some(events);
        }
        match self.script.link {
            LinkBehavior::Connects => self.emit(GattEvent::Connected),
            LinkBehavior::Refuses => self.emit(GattEvent::Disconnected),
            LinkBehavior::Silent => {}
            LinkBehavior::Hangs => std::future::pending::<()>().await,
        }
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> PrintResult<()> {
        if let Some(mtu) = self.script.mtu_reply {
            self.emit(GattEvent::MtuChanged(mtu));
        }
        Ok(())
    }

    async fn discover_services(&self) -> PrintResult<()> {
        if self.script.discovery_answers {
            self.emit(GattEvent::ServicesDiscovered(Ok(self.script.services.clone())));
        }
        Ok(())
    }

    async fn write(&self, characteristic: &GattCharacteristic, chunk: &[u8], kind: WriteKind) -> PrintResult<()> {
        if kind == WriteKind::WithoutResponse
            && self.script.reject_write_commands
            && !characteristic.properties.contains(CharProps::WRITE_WITHOUT_RESPONSE)
        {
            return Err(PrintError::Connection("write command not permitted".to_string()));
        }
        self.lock().writes.push((Instant::now(), kind, chunk.to_vec()));

        if kind == WriteKind::WithResponse {
            match self.script.ack {
                AckBehavior::Respond => self.emit(GattEvent::WriteAck(Ok(()))),
                AckBehavior::Nack => self.emit(GattEvent::WriteAck(Err("GATT status 133".to_string()))),
                AckBehavior::Silent => {}
                AckBehavior::Hangs => std::future::pending::<()>().await,
            }
        }
        Ok(())
    }

    async fn close(&self) -> PrintResult<()> {
        let mut record = self.lock();
        record.closes += 1;
        record.events = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// USB bulk

#[derive(Default)]
struct BulkRecord {
    transfers: Vec<Vec<u8>>,
    claimed: Vec<u8>,
    released: Vec<u8>,
    inbound: VecDeque<u8>,
    fail_writes: bool,
}

#[derive(Clone)]
pub struct FakeBulk {
    interfaces: Vec<UsbInterfaceInfo>,
    max_transfer: usize,
    status_replies: HashMap<u8, u8>,
    record: Arc<Mutex<BulkRecord>>,
}

pub fn bulk_endpoint(address: u8, direction: EndpointDirection) -> UsbEndpointInfo {
    UsbEndpointInfo {
        address,
        direction,
        bulk: true,
    }
}

/// Interface 0: HID-ish, interface 1: printer class with bulk OUT 0x02 / IN 0x81
pub fn printer_interfaces(with_in: bool) -> Vec<UsbInterfaceInfo> {
    let mut endpoints = vec![bulk_endpoint(0x02, EndpointDirection::Out)];
    if with_in {
        endpoints.push(bulk_endpoint(0x81, EndpointDirection::In));
    }
    vec![
        UsbInterfaceInfo {
            number: 0,
            class: 0x03,
            endpoints: vec![bulk_endpoint(0x83, EndpointDirection::In)],
        },
        UsbInterfaceInfo {
            number: 1,
            class: 0x07,
            endpoints,
        },
    ]
}

impl FakeBulk {
    pub fn new(interfaces: Vec<UsbInterfaceInfo>) -> Self {
        Self {
            interfaces,
            max_transfer: usize::MAX,
            status_replies: HashMap::new(),
            record: Arc::new(Mutex::new(BulkRecord::default())),
        }
    }

    /// Accept at most `n` bytes per transfer
    pub fn with_max_transfer(mut self, n: usize) -> Self {
        self.max_transfer = n;
        self
    }

    pub fn with_status(mut self, bank: u8, reply: u8) -> Self {
        self.status_replies.insert(bank, reply);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BulkRecord> {
        self.record.lock().unwrap()
    }

    pub fn transfers(&self) -> Vec<Vec<u8>> {
        self.lock().transfers.clone()
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.lock().claimed.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        self.lock().released.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl BulkDevice for FakeBulk {
    fn describe(&self) -> String {
        "fake-usb 0416:5011".to_string()
    }

    fn interfaces(&self) -> PrintResult<Vec<UsbInterfaceInfo>> {
        Ok(self.interfaces.clone())
    }

    fn claim(&self, interface: u8) -> PrintResult<()> {
        self.lock().claimed.push(interface);
        Ok(())
    }

    fn release(&self, interface: u8) -> PrintResult<()> {
        self.lock().released.push(interface);
        Ok(())
    }

    fn write_bulk(&self, _endpoint: u8, data: &[u8], _timeout: Duration) -> PrintResult<usize> {
        let mut record = self.lock();
        if record.fail_writes {
            return Err(PrintError::Connection("USB device unplugged".to_string()));
        }
        let n = data.len().min(self.max_transfer);
        record.transfers.push(data[..n].to_vec());
        let answers = status_answers(&data[..n], &self.status_replies);
        record.inbound.extend(answers);
        Ok(n)
    }

    fn read_bulk(&self, _endpoint: u8, buf: &mut [u8], timeout: Duration) -> PrintResult<usize> {
        {
            let mut record = self.lock();
            if !record.inbound.is_empty() {
                let n = buf.len().min(record.inbound.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = record.inbound.pop_front().unwrap_or_default();
                }
                return Ok(n);
            }
        }
        // like libusb: block for the timeout, then give up
        std::thread::sleep(timeout);
        Err(PrintError::Timeout("USB transfer timeout".to_string()))
    }
}
