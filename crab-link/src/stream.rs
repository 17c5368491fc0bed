//! Byte-stream transports
//!
//! Supports:
//! - Network printers (raw TCP, usually port 9100)
//! - Bluetooth Classic SPP (see [`crate::bluetooth`])
//!
//! Both are reliable byte streams; the only differences are how the stream
//! is dialed and how aggressively writes are chunked.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::batch::{BatchController, SendPlan};
use crate::connection::{Connection, DisconnectSignal, TransportKind, pause, until_cancelled};
use crate::error::{PrintError, PrintResult};
use crate::pacing::Pacing;

/// Max bytes returned by one `read()`
const READ_BUF_SIZE: usize = 1024;

/// Default raw printing port
pub const DEFAULT_TCP_PORT: u16 = 9100;

/// Opens the byte stream for a [`StreamTransport`]
#[async_trait]
pub trait StreamDialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn kind(&self) -> TransportKind;

    fn describe(&self) -> String;

    /// Pacing used unless the caller overrides it
    fn default_pacing(&self) -> Pacing;

    async fn dial(&self) -> PrintResult<Self::Stream>;

    /// Release whatever `dial` kept alive besides the stream
    async fn hang_up(&self) {}
}

/// TCP dialer with connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(host: &str, port: u16) -> PrintResult<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(PrintError::InvalidConfig("Empty printer host".to_string()));
        }
        if port == 0 {
            return Err(PrintError::InvalidConfig(format!("Invalid port for {}", host)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(5),
        })
    }

    /// Parse "host:port" (e.g. "192.168.1.100:9100"); a bare host gets port 9100
    pub fn from_addr(addr: &str) -> PrintResult<Self> {
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| PrintError::InvalidConfig(format!("Invalid address: {}", addr)))?;
                Self::new(host, port)
            }
            None => Self::new(addr, DEFAULT_TCP_PORT),
        }
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl StreamDialer for TcpDialer {
    type Stream = TcpStream;

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn default_pacing(&self) -> Pacing {
        Pacing::tcp()
    }

    #[instrument(skip(self), fields(addr = %self.describe(), timeout_ms = self.timeout.as_millis() as u64))]
    async fn dial(&self) -> PrintResult<TcpStream> {
        let target = self.describe();

        let connect = async {
            let addrs = tokio::net::lookup_host(&target)
                .await
                .map_err(|e| PrintError::Connection(format!("{}: {}", target, e)))?;

            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(PrintError::Connection(match last_err {
                Some(e) => format!("Unable to connect to TCP device {}: {}", target, e),
                None => format!("No address resolved for {}", target),
            }))
        };

        let stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| PrintError::Timeout(format!("TCP connection timeout to {}", target)))??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        Ok(stream)
    }
}

/// Connection over any byte stream
pub struct StreamTransport<D: StreamDialer> {
    dialer: D,
    stream: Option<D::Stream>,
    batch: BatchController,
    pacing: Pacing,
    signal: DisconnectSignal,
}

/// Raw TCP printer connection
pub type TcpConnection = StreamTransport<TcpDialer>;

impl TcpConnection {
    /// TCP connection with the default 5 s connect timeout
    pub fn tcp(host: &str, port: u16) -> PrintResult<Self> {
        Ok(Self::new(TcpDialer::new(host, port)?))
    }
}

impl<D: StreamDialer> StreamTransport<D> {
    pub fn new(dialer: D) -> Self {
        let pacing = dialer.default_pacing();
        Self {
            dialer,
            stream: None,
            batch: BatchController::new(),
            pacing,
            signal: DisconnectSignal::new(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }
}

/// Write `payload` in paced chunks, flushing after each one
pub(crate) async fn write_chunked<W>(writer: &mut W, payload: &[u8], pacing: &Pacing) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let chunks = pacing.chunks(payload);
    let count = chunks.len();
    let mut sent = 0usize;

    for (i, chunk) in chunks.into_iter().enumerate() {
        writer.write_all(chunk).await?;
        writer.flush().await?;
        sent += chunk.len();
        trace!(sent, total = payload.len(), "Sent chunk");

        if i + 1 < count {
            pause(pacing.chunk_delay).await;
        }
    }
    Ok(())
}

#[async_trait]
impl<D: StreamDialer> Connection for StreamTransport<D> {
    fn kind(&self) -> TransportKind {
        self.dialer.kind()
    }

    fn describe(&self) -> String {
        self.dialer.describe()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> PrintResult<()> {
        if self.is_connected() {
            debug!(addr = %self.describe(), "Already connected");
            return Ok(());
        }

        self.signal.rearm();
        let token = self.signal.token();
        info!(transport = %self.kind(), addr = %self.describe(), "Connecting");

        match until_cancelled(&token, self.dialer.dial()).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.batch.clear();
                info!(transport = %self.kind(), addr = %self.describe(), "Connected");
                Ok(())
            }
            Err(e) => {
                error!(transport = %self.kind(), addr = %self.describe(), error = %e, "Connect failed");
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.signal.trigger();
        self.batch.clear();

        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!(addr = %self.describe(), error = %e, "Error closing stream");
            }
            drop(stream);
            self.dialer.hang_up().await;
            info!(transport = %self.kind(), addr = %self.describe(), "Disconnected");
        }
    }

    async fn send(&mut self, extra_wait: Duration) -> PrintResult<()> {
        if self.batch.begin_send(extra_wait) == SendPlan::Deferred {
            return Ok(());
        }

        let Some(stream) = self.stream.as_mut() else {
            error!(addr = %self.dialer.describe(), "Send failed: not connected");
            return Err(PrintError::NotConnected);
        };

        let payload = self.batch.take();
        debug!(
            bytes = payload.len(),
            chunk = self.pacing.chunk_size,
            delay_ms = self.pacing.chunk_delay.as_millis() as u64,
            "Sending"
        );

        if let Err(e) = write_chunked(stream, &payload, &self.pacing).await {
            error!(error = %e, "Send IO error");
            self.batch.restore(payload);
            return Err(e.into());
        }

        pause(self.pacing.settle_time(payload.len(), extra_wait)).await;
        debug!(bytes = payload.len(), "Send complete");
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> PrintResult<Vec<u8>> {
        let token = self.signal.token();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let poll = async {
            match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(PrintError::Io(e)),
                Err(_) => Ok(0),
            }
        };
        let n = until_cancelled(&token, poll).await?;
        buf.truncate(n);
        Ok(buf)
    }

    fn can_read(&self) -> bool {
        self.stream.is_some()
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
