//! Blocking client
//!
//! The same [`Exchange`] engine as the async client, driven by std sockets and
//! a blocking serial port. Meant for one OS thread per connection; every call
//! blocks at most for the configured timeout per read or write. Call
//! [`BlockingClient::connect`] before the first request and again after a
//! failure that dropped the session.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{PlcError, PlcResult};
use crate::exchange::{ConnectionState, Exchange};
use crate::logging::{LogLevel, PacketLogger};
use crate::protocol::{DataPayload, FrameCodec, Operation};
use crate::transport::{log_packet, TransportStats};
use crate::utils::words::{bytes_to_words, words_to_bytes};
use crate::utils::{OperationTimer, PerformanceMetrics};

const STREAM_CHUNK: usize = 4096;
const MAX_DATAGRAM: usize = 65_536;

/// Blocking counterpart of [`PlcTransport`](crate::transport::PlcTransport)
pub trait BlockingTransport: Send {
    fn connect(&mut self) -> PlcResult<()>;

    fn send(&mut self, frame: &[u8]) -> PlcResult<()>;

    /// Read the next chunk; blocks up to the transport timeout
    fn receive(&mut self) -> PlcResult<Vec<u8>>;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> PlcResult<()>;

    fn get_stats(&self) -> TransportStats;

    fn peer(&self) -> String;
}

/// Map a std I/O error, turning read/write timeouts into typed timeouts
fn io_error(err: std::io::Error, operation: &str, timeout: Duration, stats: &mut TransportStats) -> PlcError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            stats.record_timeout();
            PlcError::timeout(operation, timeout.as_millis() as u64)
        }
        _ => {
            stats.errors += 1;
            PlcError::from(err)
        }
    }
}

/// Blocking TCP transport
pub struct StdTcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl StdTcpTransport {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            stream: None,
            address,
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }
}

impl BlockingTransport for StdTcpTransport {
    fn connect(&mut self) -> PlcResult<()> {
        self.stream = None;
        let stream = TcpStream::connect_timeout(&self.address, self.timeout)
            .map_err(|e| io_error(e, "connect", self.timeout, &mut self.stats))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let _ = stream.set_nodelay(true);
        debug!("connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlcError::connection("TCP stream not connected"))?;
        if self.packet_logging {
            log_packet("send", frame, "TCP", false);
        }
        match stream.write_all(frame) {
            Ok(()) => {
                self.stats.record_send(frame.len());
                Ok(())
            }
            Err(e) => {
                self.stream = None;
                Err(io_error(e, "send request", self.timeout, &mut self.stats))
            }
        }
    }

    fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PlcError::connection("TCP stream not connected"))?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.stats.errors += 1;
                self.stream = None;
                Err(PlcError::connection(format!("{} closed the connection", self.address)))
            }
            Ok(n) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                if self.packet_logging {
                    log_packet("receive", &buf, "TCP", false);
                }
                Ok(buf)
            }
            Err(e) => {
                self.stream = None;
                Err(io_error(e, "receive response", self.timeout, &mut self.stats))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) -> PlcResult<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
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

/// Blocking UDP transport
pub struct StdUdpTransport {
    socket: Option<UdpSocket>,
    address: SocketAddr,
    timeout: Duration,
    stats: TransportStats,
}

impl StdUdpTransport {
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            socket: None,
            address,
            timeout,
            stats: TransportStats::default(),
        }
    }
}

impl BlockingTransport for StdUdpTransport {
    fn connect(&mut self) -> PlcResult<()> {
        let bind: SocketAddr = if self.address.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(self.address)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| PlcError::connection("UDP socket not connected"))?;
        match socket.send(frame) {
            Ok(_) => {
                self.stats.record_send(frame.len());
                Ok(())
            }
            Err(e) => Err(io_error(e, "send request", self.timeout, &mut self.stats)),
        }
    }

    fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| PlcError::connection("UDP socket not connected"))?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.recv(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                Ok(buf)
            }
            Err(e) => Err(io_error(e, "receive response", self.timeout, &mut self.stats)),
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) -> PlcResult<()> {
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

/// Blocking serial transport
pub struct StdSerialTransport {
    port: Option<Box<dyn tokio_serial::SerialPort>>,
    port_name: String,
    baud_rate: u32,
    data_bits: tokio_serial::DataBits,
    stop_bits: tokio_serial::StopBits,
    parity: tokio_serial::Parity,
    timeout: Duration,
    stats: TransportStats,
}

impl StdSerialTransport {
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
        }
    }
}

impl BlockingTransport for StdSerialTransport {
    fn connect(&mut self) -> PlcResult<()> {
        let port = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .timeout(self.timeout)
            .open()
            .map_err(|e| PlcError::connection(format!("Failed to open serial port {}: {}", self.port_name, e)))?;
        self.port = Some(port);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> PlcResult<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| PlcError::connection("Serial port not connected"))?;
        match port.write_all(frame).and_then(|_| port.flush()) {
            Ok(()) => {
                self.stats.record_send(frame.len());
                Ok(())
            }
            Err(e) => Err(io_error(e, "send request", self.timeout, &mut self.stats)),
        }
    }

    fn receive(&mut self) -> PlcResult<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| PlcError::connection("Serial port not connected"))?;
        let mut buf = vec![0u8; STREAM_CHUNK];
        match port.read(&mut buf) {
            Ok(0) => {
                self.stats.record_timeout();
                Err(PlcError::timeout("receive response", self.timeout.as_millis() as u64))
            }
            Ok(n) => {
                buf.truncate(n);
                self.stats.record_receive(n);
                Ok(buf)
            }
            Err(e) => Err(io_error(e, "receive response", self.timeout, &mut self.stats)),
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> PlcResult<()> {
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

/// Client over a [`BlockingTransport`]
pub struct BlockingClient<T: BlockingTransport> {
    transport: T,
    exchange: Exchange,
    logger: PacketLogger,
    metrics: PerformanceMetrics,
}

impl<T: BlockingTransport> BlockingClient<T> {
    pub fn new(transport: T, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            transport,
            exchange: Exchange::new(codec),
            logger: PacketLogger::disabled(),
            metrics: PerformanceMetrics::new(),
        }
    }

    pub fn with_logger(transport: T, codec: Arc<dyn FrameCodec>, logger: PacketLogger) -> Self {
        let mut client = Self::new(transport, codec);
        client.logger = logger;
        client
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.exchange.state()
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    pub fn is_connected(&self) -> bool {
        self.exchange.state() != ConnectionState::Disconnected && self.transport.is_connected()
    }

    pub fn connect(&mut self) -> PlcResult<()> {
        let name = self.exchange.codec().name();
        self.exchange.begin_connect();
        if let Err(e) = self.transport.connect() {
            return Err(self.exchange.fail(e));
        }
        if let Some(hello) = self.exchange.connected() {
            self.logger.log_packet(LogLevel::Info, &format!("{} handshake send", name), &hello);
            if let Err(e) = self.transport.send(&hello) {
                return Err(self.abort(e));
            }
            loop {
                let chunk = self.transport.receive().map_err(|e| self.abort(e))?;
                self.logger.log_packet(LogLevel::Info, &format!("{} handshake receive", name), &chunk);
                if self.exchange.on_handshake_data(&chunk).map_err(|e| self.abort(e))? {
                    break;
                }
            }
        }
        info!("{} session ready with {}", name, self.transport.peer());
        Ok(())
    }

    fn abort(&mut self, error: PlcError) -> PlcError {
        let error = self.exchange.fail(error);
        if self.exchange.state() == ConnectionState::Disconnected {
            let _ = self.transport.close();
        }
        error
    }

    pub fn execute(
        &mut self,
        address: &str,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
    ) -> PlcResult<Option<DataPayload>> {
        let timer = OperationTimer::start(&format!("{} {} x{}", operation, address, points));
        let result = self.run(address, operation, points, payload);
        timer.stop_and_record(result.is_ok(), &mut self.metrics);
        result
    }

    fn run(
        &mut self,
        address: &str,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
    ) -> PlcResult<Option<DataPayload>> {
        if self.exchange.state() == ConnectionState::Disconnected {
            return Err(PlcError::connection(format!("not connected to {}", self.transport.peer())));
        }
        let name = self.exchange.codec().name();
        let mut transaction = self.exchange.prepare(address, operation, points, payload)?;

        while let Some(frame) = self.exchange.next_frame(&transaction).map(<[u8]>::to_vec) {
            if let Some(command) = transaction.current() {
                self.logger.log_request(name, command, &frame);
            }
            self.transport.send(&frame).map_err(|e| self.abort(e))?;
            self.exchange.sent();
            loop {
                let chunk = self.transport.receive().map_err(|e| self.abort(e))?;
                self.logger.log_response(name, &chunk);
                if self.exchange.on_data(&mut transaction, &chunk).map_err(|e| self.abort(e))? {
                    break;
                }
            }
        }

        self.exchange.finish(transaction)
    }

    pub fn read(&mut self, address: &str, points: usize) -> PlcResult<DataPayload> {
        self.execute(address, Operation::Read, points, None)?
            .ok_or_else(|| PlcError::short_response(points, 0))
    }

    pub fn write(&mut self, address: &str, payload: DataPayload) -> PlcResult<()> {
        let points = payload.points();
        self.execute(address, Operation::Write, points, Some(&payload))?;
        Ok(())
    }

    pub fn read_bytes(&mut self, address: &str, words: usize) -> PlcResult<Vec<u8>> {
        self.read(address, words)?.into_bytes()
    }

    pub fn read_words(&mut self, address: &str, count: usize) -> PlcResult<Vec<u16>> {
        let bytes = self.read_bytes(address, count)?;
        bytes_to_words(&bytes, self.exchange.codec().byte_order())
    }

    pub fn read_bits(&mut self, address: &str, count: usize) -> PlcResult<Vec<bool>> {
        self.read(address, count)?.into_bits()
    }

    pub fn read_bool(&mut self, address: &str) -> PlcResult<bool> {
        self.read_bits(address, 1)?
            .first()
            .copied()
            .ok_or_else(|| PlcError::short_response(1, 0))
    }

    pub fn write_bytes(&mut self, address: &str, bytes: &[u8]) -> PlcResult<()> {
        self.write(address, DataPayload::Bytes(bytes.to_vec()))
    }

    pub fn write_words(&mut self, address: &str, values: &[u16]) -> PlcResult<()> {
        let bytes = words_to_bytes(values, self.exchange.codec().byte_order());
        self.write(address, DataPayload::Bytes(bytes))
    }

    pub fn write_bits(&mut self, address: &str, values: &[bool]) -> PlcResult<()> {
        self.write(address, DataPayload::Bits(values.to_vec()))
    }

    pub fn write_bool(&mut self, address: &str, value: bool) -> PlcResult<()> {
        self.write_bits(address, &[value])
    }

    pub fn close(&mut self) -> PlcResult<()> {
        self.exchange.disconnect();
        self.transport.close()
    }
}
