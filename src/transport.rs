//! # Byte Transports
//!
//! Transports move raw bytes and nothing else: framing, validation and
//! decoding live in the codec and the [`Exchange`](crate::exchange::Exchange)
//! engine. Every transport applies its own timeout to each suspension point
//! (connect, send, receive) and reports a typed [`PlcError::Timeout`].
//!
//! ## Supported Transports
//!
//! - [`TcpTransport`]: stream socket (A1E, MC 3E, FINS/TCP)
//! - [`UdpTransport`]: connected datagram socket (MC 3E, FINS/UDP)
//! - [`SerialTransport`]: RS-232 / RS-485 line via `tokio-serial` (A3C, HostLink)
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use voltage_plc::transport::{PlcTransport, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::new("192.168.0.10:5000".parse()?, Duration::from_secs(3));
//!     transport.connect().await?;
//!     transport.send(&[0x01, 0xFF, 0x0A, 0x00]).await?;
//!     let chunk = transport.receive().await?;
//!     println!("{} bytes, stats {:?}", chunk.len(), transport.get_stats());
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{PlcError, PlcResult};
use crate::utils::format::{bytes_to_hex, bytes_to_text};

/// Receive buffer for stream transports
const STREAM_CHUNK: usize = 4096;

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65_536;

/// Log a packet with direction and transport label
pub(crate) fn log_packet(direction: &str, data: &[u8], label: &str, text: bool) {
    if text {
        info!("[{}] {} {}", label, direction, bytes_to_text(data));
    } else {
        info!("[{}] {} {}", label, direction, bytes_to_hex(data));
    }
}

/// Byte-moving layer shared by all clients
///
/// `receive` returns whatever arrived next (at least one byte); the caller
/// accumulates chunks until the codec reports a complete frame.
#[async_trait]
pub trait PlcTransport: Send + Sync {
    /// Open (or reopen) the underlying link
    async fn connect(&mut self) -> PlcResult<()>;

    /// Write one encoded frame
    async fn send(&mut self, frame: &[u8]) -> PlcResult<()>;

    /// Read the next chunk of bytes
    async fn receive(&mut self) -> PlcResult<Vec<u8>>;

    /// Whether the link is believed open (local check only)
    fn is_connected(&self) -> bool;

    /// Close the link gracefully
    async fn close(&mut self) -> PlcResult<()>;

    /// Communication statistics
    fn get_stats(&self) -> TransportStats;

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames written
    pub requests_sent: u64,
    /// Non-empty chunks read
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    pub(crate) fn record_send(&mut self, len: usize) {
        self.requests_sent += 1;
        self.bytes_sent += len as u64;
    }

    pub(crate) fn record_receive(&mut self, len: usize) {
        self.responses_received += 1;
        self.bytes_received += len as u64;
    }

    pub(crate) fn record_timeout(&mut self) {
        self.timeouts += 1;
        self.errors += 1;
    }
}

/// TCP stream transport
pub struct TcpTransport {
    stream: Option<TcpStream>,
    pub address: SocketAddr,
    timeout: Duration,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Create an unconnected TCP transport
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            stream: None,
            address,
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a TCP transport with packet logging enabled
    pub fn with_packet_logging(address: SocketAddr, timeout: Duration, enable_logging: bool) -> Self {
        Self {
            packet_logging: enable_logging,
            ..Self::new(address, timeout)
        }
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[async_trait]
impl PlcTransport for TcpTransport {
    async fn connect(&mut self) -> PlcResult<()> {
        self.stream = None;
        let stream = match timeout(self.timeout, TcpStream::connect(self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(PlcError::connection(format!("Failed to connect to {}: {}", self.address, e)));
            }
            Err(_) => {
                self.stats.record_timeout();
                return Err(PlcError::timeout(format!("connect to {}", self.address), self.timeout_ms()));
            }
        };
        let _ = stream.set_nodelay(true);
        debug!("connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlcError::connection("TCP stream not connected"))?;

        if self.packet_logging {
            log_packet("send", frame, "TCP", false);
        }

        match timeout(self.timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => {
                self.stats.record_send(frame.len());
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                self.stream = None;
                Err(PlcError::from(e))
            }
            Err(_) => {
                self.stats.record_timeout();
                self.stream = None;
                Err(PlcError::timeout("send request", self.timeout_ms()))
            }
        }
    }

    async fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlcError::connection("TCP stream not connected"))?;

        let mut buf = vec![0u8; STREAM_CHUNK];
        match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.stats.errors += 1;
                self.stream = None;
                Err(PlcError::connection(format!("{} closed the connection", self.address)))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                if self.packet_logging {
                    log_packet("receive", &buf, "TCP", false);
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                self.stream = None;
                Err(PlcError::from(e))
            }
            Err(_) => {
                self.stats.record_timeout();
                self.stream = None;
                Err(PlcError::timeout("receive response", self.timeout_ms()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> PlcResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn peer(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// UDP datagram transport
///
/// Each `receive` returns one datagram; datagrams from other peers are
/// filtered by the connected socket.
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    pub address: SocketAddr,
    timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl UdpTransport {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            socket: None,
            address,
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[async_trait]
impl PlcTransport for UdpTransport {
    async fn connect(&mut self) -> PlcResult<()> {
        let local: SocketAddr = if self.address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| PlcError::connection(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(self.address)
            .await
            .map_err(|e| PlcError::connection(format!("Failed to connect UDP socket to {}: {}", self.address, e)))?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| PlcError::connection("UDP socket not connected"))?;
        if self.packet_logging {
            log_packet("send", frame, "UDP", false);
        }
        match timeout(self.timeout, socket.send(frame)).await {
            Ok(Ok(_)) => {
                self.stats.record_send(frame.len());
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(PlcError::from(e))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(PlcError::timeout("send datagram", self.timeout_ms()))
            }
        }
    }

    async fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| PlcError::connection("UDP socket not connected"))?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout(self.timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                if self.packet_logging {
                    log_packet("receive", &buf, "UDP", false);
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(PlcError::from(e))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(PlcError::timeout("receive datagram", self.timeout_ms()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> PlcResult<()> {
        self.socket = None;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn peer(&self) -> String {
        format!("udp://{}", self.address)
    }
}

/// Serial line transport
pub struct SerialTransport {
    /// Serial port connection
    port: Option<tokio_serial::SerialStream>,
    /// Port name/path
    port_name: String,
    baud_rate: u32,
    data_bits: tokio_serial::DataBits,
    stop_bits: tokio_serial::StopBits,
    parity: tokio_serial::Parity,
    timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl SerialTransport {
    /// 8N1 serial transport with a one second timeout
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self::new_with_config(
            port,
            baud_rate,
            tokio_serial::DataBits::Eight,
            tokio_serial::StopBits::One,
            tokio_serial::Parity::None,
            Duration::from_millis(1000),
        )
    }

    /// Serial transport with full line configuration
    ///
    /// HostLink links usually run 7E2; A3C links 8N1 or 7E1.
    pub fn new_with_config(
        port: &str,
        baud_rate: u32,
        data_bits: tokio_serial::DataBits,
        stop_bits: tokio_serial::StopBits,
        parity: tokio_serial::Parity,
        timeout: Duration,
    ) -> Self {
        Self {
            port: None,
            port_name: port.to_string(),
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

#[async_trait]
impl PlcTransport for SerialTransport {
    async fn connect(&mut self) -> PlcResult<()> {
        let builder = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .timeout(self.timeout);

        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| PlcError::connection(format!("Failed to open serial port {}: {}", self.port_name, e)))?;
        self.port = Some(port);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| PlcError::connection("Serial port not connected"))?;
        if self.packet_logging {
            log_packet("send", frame, "SERIAL", true);
        }
        match timeout(self.timeout, port.write_all(frame)).await {
            Ok(Ok(())) => {
                let _ = timeout(self.timeout, port.flush()).await;
                self.stats.record_send(frame.len());
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(PlcError::io(format!("Failed to write to {}: {}", self.port_name, e)))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(PlcError::timeout("send request", self.timeout_ms()))
            }
        }
    }

    async fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| PlcError::connection("Serial port not connected"))?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        match timeout(self.timeout, port.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.stats.errors += 1;
                Err(PlcError::connection(format!("{} returned end of stream", self.port_name)))
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                if self.packet_logging {
                    log_packet("receive", &buf, "SERIAL", true);
                }
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(PlcError::io(format!("Serial read error: {}", e)))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(PlcError::timeout("receive response", self.timeout_ms()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn close(&mut self) -> PlcResult<()> {
        self.port = None;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn peer(&self) -> String {
        format!("serial://{}@{}", self.port_name, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_send_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[buf[3], buf[2], buf[1], buf[0]]).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr, Duration::from_secs(2));
        assert!(!transport.is_connected());
        transport.connect().await.unwrap();
        transport.send(&[1, 2, 3, 4]).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            received.extend(transport.receive().await.unwrap());
        }
        assert_eq!(received, vec![4, 3, 2, 1]);

        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
    }

    #[tokio::test]
    async fn test_tcp_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut transport = TcpTransport::new(addr, Duration::from_millis(100));
        transport.connect().await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, PlcError::Timeout { timeout_ms: 100, .. }));
        assert!(!transport.is_connected());
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_send_without_connect() {
        let mut transport = UdpTransport::new("127.0.0.1:9600".parse().unwrap(), Duration::from_millis(100));
        assert!(matches!(transport.send(&[0]).await, Err(PlcError::Connection { .. })));
    }

    #[test]
    fn test_serial_open_failure_is_typed() {
        let mut transport = SerialTransport::new("/dev/does-not-exist", 9600);
        let result = tokio_test::block_on(transport.connect());
        assert!(matches!(result, Err(PlcError::Connection { .. })));
    }
}
