/// High-level PLC client
///
/// Every protocol family shares one client: the codec decides how frames look,
/// the transport moves bytes, and the [`Exchange`] engine decides what happens
/// next. Requests are addressed with device strings such as `"D100"`,
/// `"s=2;X1A0"` or `"CIO100.5"`.
///
/// A request is resolved, split and encoded before any byte is written, so a
/// bad address or an oversized write never touches the link. Sub-frames run
/// one after another and their results are concatenated.
///
/// The link is opened by an explicit `connect`. After a failure that drops the
/// session, requests fail with a connection error until `connect` is called
/// again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{PlcError, PlcResult};
use crate::exchange::{ConnectionState, Exchange};
use crate::logging::{LogLevel, PacketLogger};
use crate::protocol::{DataPayload, FrameCodec, Operation, SessionContext};
use crate::transport::{PlcTransport, SerialTransport, TcpTransport, TransportStats, UdpTransport};
use crate::utils::words::{bytes_to_words, words_to_bytes};
use crate::utils::{OperationTimer, PerformanceMetrics};

/// Address-based read/write operations
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Open the link and run the protocol handshake
    async fn connect(&mut self) -> PlcResult<()>;

    /// Read `points` words or bits starting at `address`
    async fn read(&mut self, address: &str, points: usize) -> PlcResult<DataPayload>;

    /// Write a payload starting at `address`
    async fn write(&mut self, address: &str, payload: DataPayload) -> PlcResult<()>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> PlcResult<()>;

    fn get_stats(&self) -> TransportStats;

    /// Byte order of word payloads
    fn byte_order(&self) -> crate::utils::ByteOrder;

    /// Read `words` words as raw bytes in the codec's byte order
    async fn read_bytes(&mut self, address: &str, words: usize) -> PlcResult<Vec<u8>> {
        self.read(address, words).await?.into_bytes()
    }

    async fn read_words(&mut self, address: &str, count: usize) -> PlcResult<Vec<u16>> {
        let bytes = self.read_bytes(address, count).await?;
        bytes_to_words(&bytes, self.byte_order())
    }

    async fn read_bits(&mut self, address: &str, count: usize) -> PlcResult<Vec<bool>> {
        self.read(address, count).await?.into_bits()
    }

    async fn read_bool(&mut self, address: &str) -> PlcResult<bool> {
        let bits = self.read_bits(address, 1).await?;
        bits.first()
            .copied()
            .ok_or_else(|| PlcError::short_response(1, 0))
    }

    /// Write raw word bytes in the codec's byte order
    async fn write_bytes(&mut self, address: &str, bytes: &[u8]) -> PlcResult<()> {
        self.write(address, DataPayload::Bytes(bytes.to_vec())).await
    }

    async fn write_words(&mut self, address: &str, values: &[u16]) -> PlcResult<()> {
        let bytes = words_to_bytes(values, self.byte_order());
        self.write(address, DataPayload::Bytes(bytes)).await
    }

    async fn write_bits(&mut self, address: &str, values: &[bool]) -> PlcResult<()> {
        self.write(address, DataPayload::Bits(values.to_vec())).await
    }

    async fn write_bool(&mut self, address: &str, value: bool) -> PlcResult<()> {
        self.write_bits(address, &[value]).await
    }
}

/// Client driving any [`FrameCodec`] over any [`PlcTransport`]
pub struct TransactionClient<T: PlcTransport> {
    transport: T,
    exchange: Exchange,
    logger: PacketLogger,
    metrics: PerformanceMetrics,
}

impl<T: PlcTransport> TransactionClient<T> {
    /// Client over an unopened transport; call `connect` before the first request
    pub fn new(transport: T, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            transport,
            exchange: Exchange::new(codec),
            logger: PacketLogger::disabled(),
            metrics: PerformanceMetrics::new(),
        }
    }

    /// Client with a packet logging sink
    pub fn with_logger(transport: T, codec: Arc<dyn FrameCodec>, logger: PacketLogger) -> Self {
        let mut client = Self::new(transport, codec);
        client.logger = logger;
        client
    }

    pub fn set_logger(&mut self, logger: PacketLogger) {
        self.logger = logger;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        self.exchange.codec()
    }

    pub fn state(&self) -> ConnectionState {
        self.exchange.state()
    }

    /// Identifiers negotiated for the current connection
    pub fn session(&self) -> &SessionContext {
        self.exchange.session()
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Open the link and run the protocol handshake, if any
    pub async fn connect(&mut self) -> PlcResult<()> {
        let name = self.exchange.codec().name();
        self.exchange.begin_connect();
        if let Err(e) = self.transport.connect().await {
            return Err(self.exchange.fail(e));
        }

        if let Some(hello) = self.exchange.connected() {
            self.logger.log_packet(LogLevel::Info, &format!("{} handshake send", name), &hello);
            if let Err(e) = self.transport.send(&hello).await {
                return Err(self.abort(e).await);
            }
            loop {
                let chunk = match self.transport.receive().await {
                    Ok(chunk) => chunk,
                    Err(e) => return Err(self.abort(e).await),
                };
                self.logger.log_packet(LogLevel::Info, &format!("{} handshake receive", name), &chunk);
                match self.exchange.on_handshake_data(&chunk) {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(e) => return Err(self.abort(e).await),
                }
            }
        }

        info!("{} session ready with {}", name, self.transport.peer());
        Ok(())
    }

    /// Record a failure with the engine and close the link if it broke
    async fn abort(&mut self, error: PlcError) -> PlcError {
        let error = self.exchange.fail(error);
        if self.exchange.state() == ConnectionState::Disconnected && self.transport.is_connected() {
            let _ = self.transport.close().await;
        }
        error
    }

    /// Run one logical request; `Some` payload for reads
    pub async fn execute(
        &mut self,
        address: &str,
        operation: Operation,
        points: usize,
        payload: Option<&DataPayload>,
    ) -> PlcResult<Option<DataPayload>> {
        let timer = OperationTimer::start(&format!("{} {} x{}", operation, address, points));
        let result = self.run(address, operation, points, payload).await;
        timer.stop_and_record(result.is_ok(), &mut self.metrics);
        result
    }

    async fn run(
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

        while !transaction.is_complete() {
            let frame = match self.exchange.next_frame(&transaction) {
                Some(frame) => frame.to_vec(),
                None => break,
            };
            if let Some(command) = transaction.current() {
                self.logger.log_request(name, command, &frame);
            }
            if let Err(e) = self.transport.send(&frame).await {
                return Err(self.abort(e).await);
            }
            self.exchange.sent();

            loop {
                let chunk = match self.transport.receive().await {
                    Ok(chunk) => chunk,
                    Err(e) => return Err(self.abort(e).await),
                };
                self.logger.log_response(name, &chunk);
                match self.exchange.on_data(&mut transaction, &chunk) {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(e) => return Err(self.abort(e).await),
                }
            }
            debug!("{} frame {}/{} answered", name, transaction.completed(), transaction.len());
        }

        self.exchange.finish(transaction)
    }
}

#[async_trait]
impl<T: PlcTransport> DeviceClient for TransactionClient<T> {
    async fn connect(&mut self) -> PlcResult<()> {
        TransactionClient::connect(self).await
    }

    async fn read(&mut self, address: &str, points: usize) -> PlcResult<DataPayload> {
        self.execute(address, Operation::Read, points, None)
            .await?
            .ok_or_else(|| PlcError::short_response(points, 0))
    }

    async fn write(&mut self, address: &str, payload: DataPayload) -> PlcResult<()> {
        let points = payload.points();
        self.execute(address, Operation::Write, points, Some(&payload)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.exchange.state() != ConnectionState::Disconnected && self.transport.is_connected()
    }

    async fn close(&mut self) -> PlcResult<()> {
        self.exchange.disconnect();
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    fn byte_order(&self) -> crate::utils::ByteOrder {
        self.exchange.codec().byte_order()
    }
}

/// Client over TCP (A1E, MC 3E, FINS/TCP)
pub type TcpClient = TransactionClient<TcpTransport>;

/// Client over UDP (MC 3E, FINS/UDP)
pub type UdpClient = TransactionClient<UdpTransport>;

/// Client over a serial line (A3C, HostLink)
pub type SerialClient = TransactionClient<SerialTransport>;

impl TransactionClient<TcpTransport> {
    pub fn tcp(address: SocketAddr, codec: Arc<dyn FrameCodec>, timeout: Duration) -> Self {
        Self::new(TcpTransport::new(address, timeout), codec)
    }

    /// Connect immediately
    pub async fn connect_tcp(address: SocketAddr, codec: Arc<dyn FrameCodec>, timeout: Duration) -> PlcResult<Self> {
        let mut client = Self::tcp(address, codec, timeout);
        client.connect().await?;
        Ok(client)
    }
}

impl TransactionClient<UdpTransport> {
    pub fn udp(address: SocketAddr, codec: Arc<dyn FrameCodec>, timeout: Duration) -> Self {
        Self::new(UdpTransport::new(address, timeout), codec)
    }
}

impl TransactionClient<SerialTransport> {
    pub fn serial(port: &str, baud_rate: u32, codec: Arc<dyn FrameCodec>) -> Self {
        Self::new(SerialTransport::new(port, baud_rate), codec)
    }
}

/// Conversions and batch helpers on top of [`DeviceClient`]
pub mod utils {
    use super::*;

    /// Read several address ranges, one request each
    pub async fn read_many<C: DeviceClient + ?Sized>(
        client: &mut C,
        ranges: &[(&str, usize)],
    ) -> PlcResult<Vec<Vec<u16>>> {
        let mut results = Vec::with_capacity(ranges.len());
        for &(address, count) in ranges {
            results.push(client.read_words(address, count).await?);
        }
        Ok(results)
    }

    /// Write several word blocks, one request each
    pub async fn write_many<C: DeviceClient + ?Sized>(
        client: &mut C,
        writes: &[(&str, Vec<u16>)],
    ) -> PlcResult<()> {
        for (address, values) in writes {
            client.write_words(address, values).await?;
        }
        Ok(())
    }

    /// Pair words into u32 values, low word first (MELSEC double words)
    pub fn words_to_u32_low_first(words: &[u16]) -> Vec<u32> {
        words
            .chunks_exact(2)
            .map(|pair| ((pair[1] as u32) << 16) | pair[0] as u32)
            .collect()
    }

    /// Pair words into u32 values, high word first (Omron)
    pub fn words_to_u32_high_first(words: &[u16]) -> Vec<u32> {
        words
            .chunks_exact(2)
            .map(|pair| ((pair[0] as u32) << 16) | pair[1] as u32)
            .collect()
    }

    pub fn u32_to_words_low_first(values: &[u32]) -> Vec<u16> {
        values.iter().flat_map(|&v| [v as u16, (v >> 16) as u16]).collect()
    }

    pub fn u32_to_words_high_first(values: &[u32]) -> Vec<u16> {
        values.iter().flat_map(|&v| [(v >> 16) as u16, v as u16]).collect()
    }

    pub fn words_to_f32_low_first(words: &[u16]) -> Vec<f32> {
        words_to_u32_low_first(words).into_iter().map(f32::from_bits).collect()
    }

    pub fn f32_to_words_low_first(values: &[f32]) -> Vec<u16> {
        let raw: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        u32_to_words_low_first(&raw)
    }

    /// ASCII text stored two characters per word, first character in the low byte
    pub fn words_to_string(words: &[u16]) -> String {
        words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .take_while(|&b| b != 0)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{A1eCodec, HostLinkCodec};
    use crate::server::{DeviceServer, DeviceServerConfig, PlcServer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_word_conversion() {
        let words = vec![0x5678, 0x1234, 0xEF01, 0xABCD];
        let values = utils::words_to_u32_low_first(&words);
        assert_eq!(values, vec![0x1234_5678, 0xABCD_EF01]);
        assert_eq!(utils::u32_to_words_low_first(&values), words);
        assert_eq!(utils::words_to_u32_high_first(&[0x1234, 0x5678]), vec![0x1234_5678]);
        assert_eq!(utils::u32_to_words_high_first(&[0x1234_5678]), vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_float_and_text_conversion() {
        let floats = vec![1.5f32, -2.75f32];
        let back = utils::words_to_f32_low_first(&utils::f32_to_words_low_first(&floats));
        assert_eq!(back, floats);
        assert_eq!(utils::words_to_string(&[0x4C50, 0x0043]), "PLC");
    }

    #[tokio::test]
    async fn test_build_error_performs_no_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            stream.read(&mut buf).await.unwrap()
        });

        let mut client = TcpClient::tcp(addr, Arc::new(HostLinkCodec::new(0)), Duration::from_millis(500));
        client.connect().await.unwrap();
        let err = client.write_words("D0", &[0u16; 31]).await.unwrap_err();
        assert_eq!(err, PlcError::length_exceeded(31, 30));
        assert!(matches!(
            client.read_words("Q1", 1).await,
            Err(PlcError::AddressParse { .. })
        ));
        assert_eq!(client.get_stats().bytes_sent, 0);
        assert_eq!(client.state(), ConnectionState::Ready);

        client.close().await.unwrap();
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_against_server() {
        let codec: Arc<dyn FrameCodec> = Arc::new(A1eCodec::binary());
        let config = DeviceServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let mut server = DeviceServer::new(codec.clone(), config);
        let addr = server.start().await.unwrap();

        let mut client = TcpClient::tcp(addr, codec, Duration::from_secs(1));
        client.connect().await.unwrap();
        client.write_words("D100", &[1, 2, 3]).await.unwrap();
        assert_eq!(client.read_words("D100", 3).await.unwrap(), vec![1, 2, 3]);

        client.write_bool("M7", true).await.unwrap();
        assert!(client.read_bool("M7").await.unwrap());
        assert_eq!(client.metrics().successful_requests, 4);

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_drops_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = stream.write_all(&[0x81, 0x00]).await;
        });

        let mut client = TcpClient::tcp(addr, Arc::new(A1eCodec::binary()), Duration::from_millis(100));
        client.connect().await.unwrap();
        let err = client.read_words("D0", 1).await.unwrap_err();
        assert!(matches!(err, PlcError::Timeout { .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.metrics().failed_requests, 1);

        let sent = client.get_stats().requests_sent;
        assert!(matches!(client.read_words("D0", 1).await, Err(PlcError::Connection { .. })));
        assert_eq!(client.get_stats().requests_sent, sent);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_request_before_connect_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpClient::tcp(addr, Arc::new(A1eCodec::binary()), Duration::from_millis(200));
        assert!(matches!(client.read_words("D0", 1).await, Err(PlcError::Connection { .. })));
        assert!(!client.transport().is_connected());
        assert_eq!(client.get_stats(), TransportStats::default());
        drop(listener);
    }
}
