/// Virtual PLC servers
///
/// A [`DeviceServer`] answers requests with the same [`FrameCodec`] a client
/// would use, in the request direction: frames are assembled with
/// `request_progress`, decoded with `decode_inbound`, dispatched to a
/// [`SoftBuffer`] and answered with `encode_reply`.
///
/// Malformed frames (bad checksum, wrong station, garbage) close the session
/// that sent them. Well-formed requests the server cannot honour get the
/// protocol's fault status and the session stays open.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;

use crate::address::DataMode;
use crate::error::{PlcError, PlcResult};
use crate::framing::FrameBuffer;
use crate::protocol::{CommandFrame, DataPayload, FrameCodec, Inbound, Operation, ServerFault, SessionContext};
use crate::soft_buffer::{MemoryBank, SoftBuffer, DEFAULT_UNITS};

const READ_CHUNK: usize = 4096;
const MAX_DATAGRAM: usize = 65_536;

/// Admission check run once per accepted connection (per datagram for UDP)
pub trait SessionGate: Send + Sync {
    fn admit(&self, peer: &SocketAddr) -> PlcResult<()>;
}

/// Gate that admits every peer
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SessionGate for AllowAll {
    fn admit(&self, _peer: &SocketAddr) -> PlcResult<()> {
        Ok(())
    }
}

/// Gate that admits a fixed set of peer addresses
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    peers: HashSet<IpAddr>,
}

impl AllowList {
    pub fn new<I: IntoIterator<Item = IpAddr>>(peers: I) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

impl SessionGate for AllowList {
    fn admit(&self, peer: &SocketAddr) -> PlcResult<()> {
        if self.peers.contains(&peer.ip()) {
            Ok(())
        } else {
            Err(PlcError::connection(format!("peer {} is not on the allow list", peer.ip())))
        }
    }
}

type Handler = fn(&SoftBuffer, &CommandFrame) -> Result<Option<DataPayload>, ServerFault>;

struct Route {
    region: Arc<SoftBuffer>,
    handler: Handler,
}

fn read_words(region: &SoftBuffer, frame: &CommandFrame) -> Result<Option<DataPayload>, ServerFault> {
    region
        .get_bytes(frame.start as usize * 2, frame.points * 2)
        .map(|bytes| Some(DataPayload::Bytes(bytes)))
        .map_err(|_| ServerFault::OutOfRange)
}

fn write_words(region: &SoftBuffer, frame: &CommandFrame) -> Result<Option<DataPayload>, ServerFault> {
    match &frame.payload {
        Some(DataPayload::Bytes(bytes)) => region
            .set_bytes(bytes, frame.start as usize * 2)
            .map(|_| None)
            .map_err(|_| ServerFault::OutOfRange),
        _ => Err(ServerFault::OutOfRange),
    }
}

/// Bit offset inside a region: linear position for bit-in-word access
fn bit_offset(frame: &CommandFrame) -> usize {
    frame.linear_bit().unwrap_or(frame.start as u64) as usize
}

fn read_bits(region: &SoftBuffer, frame: &CommandFrame) -> Result<Option<DataPayload>, ServerFault> {
    region
        .get_bool(bit_offset(frame), frame.points)
        .map(|bits| Some(DataPayload::Bits(bits)))
        .map_err(|_| ServerFault::OutOfRange)
}

fn write_bits(region: &SoftBuffer, frame: &CommandFrame) -> Result<Option<DataPayload>, ServerFault> {
    match &frame.payload {
        Some(DataPayload::Bits(values)) => region
            .set_bool(values, bit_offset(frame))
            .map(|_| None)
            .map_err(|_| ServerFault::OutOfRange),
        _ => Err(ServerFault::OutOfRange),
    }
}

/// `{operation, mode, device code}` → handler over a region
pub struct DispatchTable {
    routes: HashMap<(Operation, DataMode, u16), Route>,
    read_only: HashSet<u16>,
    writes_enabled: Arc<AtomicBool>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("routes", &self.routes.len())
            .field("read_only", &self.read_only)
            .field("writes_enabled", &self.writes_enabled.load(Ordering::Relaxed))
            .finish()
    }
}

impl DispatchTable {
    /// Routes for every device of the codec's table that has a region
    pub fn new(codec: &dyn FrameCodec, bank: &MemoryBank) -> Self {
        let mut routes = HashMap::new();
        for entry in codec.device_table().entries() {
            let region = match bank.region(entry.code) {
                Some(region) => region,
                None => continue,
            };
            let (read, write): (Handler, Handler) = match entry.mode {
                DataMode::Word => (read_words, write_words),
                DataMode::Bit => (read_bits, write_bits),
            };
            routes.insert((Operation::Read, entry.mode, entry.code), Route { region: region.clone(), handler: read });
            routes.insert((Operation::Write, entry.mode, entry.code), Route { region: region.clone(), handler: write });

            if let Some(bit_code) = entry.bit_code {
                routes.insert((Operation::Read, DataMode::Bit, bit_code), Route { region: region.clone(), handler: read_bits });
                routes.insert((Operation::Write, DataMode::Bit, bit_code), Route { region, handler: write_bits });
            }
        }
        Self {
            routes,
            read_only: HashSet::new(),
            writes_enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Refuse writes to these device codes
    pub fn with_read_only<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Self {
        self.read_only.extend(codes);
        self
    }

    /// Share a server-wide write-enable switch
    pub fn with_write_switch(mut self, switch: Arc<AtomicBool>) -> Self {
        self.writes_enabled = switch;
        self
    }

    pub fn writes_enabled(&self) -> bool {
        self.writes_enabled.load(Ordering::Relaxed)
    }

    /// Run one command against its region
    pub fn dispatch(&self, frame: &CommandFrame) -> Result<Option<DataPayload>, ServerFault> {
        let route = self
            .routes
            .get(&(frame.operation, frame.mode, frame.device_code))
            .ok_or(ServerFault::UnsupportedDevice)?;

        if frame.operation == Operation::Write
            && (!self.writes_enabled() || self.read_only.contains(&frame.device_code))
        {
            return Err(ServerFault::WriteDisabled);
        }
        if frame.points == 0 {
            return Err(ServerFault::OutOfRange);
        }
        (route.handler)(&route.region, frame)
    }
}

/// Decodes, dispatches and encodes one inbound frame
///
/// Holds no I/O; both the TCP and UDP loops run every frame through it.
#[derive(Debug, Clone)]
pub struct FrameDispatcher {
    codec: Arc<dyn FrameCodec>,
    table: Arc<DispatchTable>,
}

impl FrameDispatcher {
    pub fn new(codec: Arc<dyn FrameCodec>, table: Arc<DispatchTable>) -> Self {
        Self { codec, table }
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.codec
    }

    /// Produce the reply to a complete frame
    ///
    /// `Err` means the frame was malformed and the session must be closed;
    /// faults are encoded as status replies.
    pub fn process_frame(&self, raw: &[u8], session: &mut SessionContext) -> PlcResult<Vec<u8>> {
        let command = match self.codec.decode_inbound(raw, session)? {
            Inbound::Handshake { reply } => {
                debug!("{} handshake, peer node {}", self.codec.name(), session.remote_node);
                return Ok(reply);
            }
            Inbound::Command(command) => command,
        };

        match self.table.dispatch(&command) {
            Ok(payload) => self.codec.encode_reply(&command, 0, payload.as_ref(), session),
            Err(fault) => {
                let status = self.codec.fault_status(fault);
                debug!(
                    "{} {} code 0x{:X} start {} x{} refused: {:?} (status 0x{:04X})",
                    self.codec.name(),
                    command.operation,
                    command.device_code,
                    command.start,
                    command.points,
                    fault,
                    status
                );
                self.codec.encode_reply(&command, status, None, session)
            }
        }
    }
}

/// Socket type a server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    Tcp,
    Udp,
}

/// Runtime settings of a [`DeviceServer`]
#[derive(Debug, Clone)]
pub struct DeviceServerConfig {
    pub bind_address: SocketAddr,
    pub transport: ServerTransport,
    pub max_connections: usize,
    /// Idle time after which a silent connection is closed
    pub idle_timeout: Duration,
    /// Addressable units per device type
    pub units: usize,
    /// Device codes refusing writes
    pub read_only: Vec<u16>,
}

impl Default for DeviceServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 5000)),
            transport: ServerTransport::Tcp,
            max_connections: 100,
            idle_timeout: Duration::from_secs(30),
            units: DEFAULT_UNITS,
            read_only: Vec::new(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_count: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Frames that closed their session
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

fn update_stats<F: FnOnce(&mut ServerStats)>(stats: &Mutex<ServerStats>, f: F) {
    if let Ok(mut stats) = stats.lock() {
        f(&mut stats);
    }
}

/// Server lifecycle
#[async_trait]
pub trait PlcServer: Send + Sync {
    /// Bind and start serving; returns the bound address
    async fn start(&mut self) -> PlcResult<SocketAddr>;

    async fn stop(&mut self) -> PlcResult<()>;

    fn is_running(&self) -> bool;

    fn get_stats(&self) -> ServerStats;

    /// Memory regions served
    fn memory(&self) -> &MemoryBank;
}

/// Virtual PLC over TCP or UDP
pub struct DeviceServer {
    config: DeviceServerConfig,
    codec: Arc<dyn FrameCodec>,
    bank: MemoryBank,
    gate: Arc<dyn SessionGate>,
    writes_enabled: Arc<AtomicBool>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl DeviceServer {
    /// Server with a fresh memory bank sized for the codec's device table
    pub fn new(codec: Arc<dyn FrameCodec>, config: DeviceServerConfig) -> Self {
        let bank = MemoryBank::for_table(codec.device_table(), config.units, codec.byte_order());
        Self::with_memory(codec, config, bank)
    }

    /// Server over an existing memory bank
    pub fn with_memory(codec: Arc<dyn FrameCodec>, config: DeviceServerConfig, bank: MemoryBank) -> Self {
        Self {
            config,
            codec,
            bank,
            gate: Arc::new(AllowAll),
            writes_enabled: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            start_time: None,
        }
    }

    /// Replace the admission gate
    pub fn with_gate(mut self, gate: Arc<dyn SessionGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Toggle writes for every session, effective immediately
    pub fn set_writes_enabled(&self, enabled: bool) {
        self.writes_enabled.store(enabled, Ordering::Relaxed);
        info!("writes {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.codec
    }

    fn dispatcher(&self) -> FrameDispatcher {
        let table = DispatchTable::new(self.codec.as_ref(), &self.bank)
            .with_read_only(self.config.read_only.iter().copied())
            .with_write_switch(self.writes_enabled.clone());
        FrameDispatcher::new(self.codec.clone(), Arc::new(table))
    }

    /// Serve one TCP connection until it closes, idles out or misbehaves
    async fn handle_client(
        mut stream: TcpStream,
        peer: SocketAddr,
        dispatcher: FrameDispatcher,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        idle_timeout: Duration,
    ) {
        let codec = dispatcher.codec().clone();
        let mut session = codec.new_session();
        let mut frames = FrameBuffer::default();
        let mut chunk = vec![0u8; READ_CHUNK];

        'session: loop {
            let n = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer);
                    break;
                }
                result = timeout(idle_timeout, stream.read(&mut chunk)) => match result {
                    Ok(Ok(0)) => {
                        debug!("Client {} disconnected", peer);
                        break;
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        error!("Read error from {}: {}", peer, e);
                        break;
                    }
                    Err(_) => {
                        warn!("Idle timeout from {}", peer);
                        break;
                    }
                }
            };
            update_stats(&stats, |s| s.bytes_received += n as u64);
            frames.extend(&chunk[..n]);

            loop {
                let frame = match frames.next_frame(|buf| codec.request_progress(buf)) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Closing {} session with {}: {}", codec.name(), peer, e);
                        update_stats(&stats, |s| s.failed_requests += 1);
                        break 'session;
                    }
                };
                update_stats(&stats, |s| s.total_requests += 1);

                let reply = match dispatcher.process_frame(&frame, &mut session) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("Closing {} session with {}: {}", codec.name(), peer, e);
                        update_stats(&stats, |s| s.failed_requests += 1);
                        break 'session;
                    }
                };
                if let Err(e) = stream.write_all(&reply).await {
                    error!("Failed to send response to {}: {}", peer, e);
                    break 'session;
                }
                update_stats(&stats, |s| {
                    s.successful_requests += 1;
                    s.bytes_sent += reply.len() as u64;
                });
            }
        }

        let _ = stream.shutdown().await;
        info!("Client {} disconnected", peer);
    }

    async fn start_tcp(&mut self, shutdown_tx: broadcast::Sender<()>) -> PlcResult<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| PlcError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        let local = listener.local_addr()?;

        let dispatcher = self.dispatcher();
        let gate = self.gate.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let idle_timeout = self.config.idle_timeout;
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let (stream, peer) = match result {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = gate.admit(&peer) {
                            warn!("Rejected {}: {}", peer, e);
                            update_stats(&stats, |s| s.rejected_connections += 1);
                            continue;
                        }
                        let permit = match permits.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("Connection limit reached, rejecting {}", peer);
                                update_stats(&stats, |s| s.rejected_connections += 1);
                                continue;
                            }
                        };
                        info!("New client connected: {}", peer);
                        update_stats(&stats, |s| s.connections_count += 1);

                        let dispatcher = dispatcher.clone();
                        let stats = stats.clone();
                        let shutdown_rx = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            Self::handle_client(stream, peer, dispatcher, stats, shutdown_rx, idle_timeout).await;
                            drop(permit);
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(local)
    }

    async fn start_udp(&mut self, shutdown_tx: broadcast::Sender<()>) -> PlcResult<SocketAddr> {
        let socket = UdpSocket::bind(self.config.bind_address)
            .await
            .map_err(|e| PlcError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        let local = socket.local_addr()?;

        let dispatcher = self.dispatcher();
        let gate = self.gate.clone();
        let stats = self.stats.clone();
        let running = self.running.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let codec = dispatcher.codec().clone();
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (n, peer) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            error!("UDP receive error: {}", e);
                            continue;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server");
                        break;
                    }
                };
                if let Err(e) = gate.admit(&peer) {
                    warn!("Dropped datagram from {}: {}", peer, e);
                    update_stats(&stats, |s| s.rejected_connections += 1);
                    continue;
                }
                update_stats(&stats, |s| {
                    s.total_requests += 1;
                    s.bytes_received += n as u64;
                });

                let mut session = codec.new_session();
                let mut frames = FrameBuffer::default();
                frames.extend(&buf[..n]);
                let reply = frames
                    .next_frame(|b| codec.request_progress(b))
                    .and_then(|frame| frame.ok_or_else(|| PlcError::short_response(n + 1, n)))
                    .and_then(|frame| dispatcher.process_frame(&frame, &mut session));

                match reply {
                    Ok(reply) => match socket.send_to(&reply, peer).await {
                        Ok(sent) => update_stats(&stats, |s| {
                            s.successful_requests += 1;
                            s.bytes_sent += sent as u64;
                        }),
                        Err(e) => error!("Failed to send response to {}: {}", peer, e),
                    },
                    Err(e) => {
                        warn!("Dropped {} datagram from {}: {}", codec.name(), peer, e);
                        update_stats(&stats, |s| s.failed_requests += 1);
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(local)
    }
}

#[async_trait]
impl PlcServer for DeviceServer {
    async fn start(&mut self) -> PlcResult<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PlcError::configuration("Server is already running"));
        }
        info!(
            "Starting {} virtual PLC on {:?} {}",
            self.codec.name(),
            self.config.transport,
            self.config.bind_address
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let local = match self.config.transport {
            ServerTransport::Tcp => self.start_tcp(shutdown_tx.clone()).await?,
            ServerTransport::Udp => self.start_udp(shutdown_tx.clone()).await?,
        };

        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local);
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        info!("Virtual PLC listening on {}", local);
        info!("   - Device regions: {}", self.bank.codes().len());
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Idle timeout: {:?}", self.config.idle_timeout);
        Ok(local)
    }

    async fn stop(&mut self) -> PlcResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Virtual PLC stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }

    fn memory(&self) -> &MemoryBank {
        &self.bank
    }
}
