//! Client and server configuration
//!
//! Both configurations load from YAML or JSON and pick the codec through
//! [`ProtocolKind`]. Fields left out of a file take their defaults.
//!
//! ```yaml
//! protocol: fins-tcp
//! bind: 0.0.0.0:9600
//! units: 32768
//! read_only: [AR]
//! initial:
//!   - address: D100
//!     values: [1, 2, 3]
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::DataMode;
use crate::client::{DeviceClient, TransactionClient};
use crate::codec::{A1eCodec, A3cCodec, FinsCodec, HostLinkCodec, McCodec};
use crate::error::{PlcError, PlcResult};
use crate::logging::PacketLogger;
use crate::protocol::FrameCodec;
use crate::server::{AllowList, DeviceServer, DeviceServerConfig, PlcServer, ServerTransport};
use crate::soft_buffer::DEFAULT_UNITS;
use crate::transport::{SerialTransport, TcpTransport, UdpTransport};

fn default_timeout_ms() -> u64 {
    crate::DEFAULT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

fn default_units() -> usize {
    DEFAULT_UNITS
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

/// Protocol family and framing variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "a1e-binary")]
    A1eBinary,
    #[serde(rename = "a1e-ascii")]
    A1eAscii,
    #[serde(rename = "mc-binary")]
    McBinary,
    #[serde(rename = "mc-ascii")]
    McAscii,
    #[serde(rename = "a3c")]
    A3c,
    #[serde(rename = "fins-tcp")]
    FinsTcp,
    #[serde(rename = "fins-udp")]
    FinsUdp,
    #[serde(rename = "hostlink")]
    HostLink,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 8] = [
        ProtocolKind::A1eBinary,
        ProtocolKind::A1eAscii,
        ProtocolKind::McBinary,
        ProtocolKind::McAscii,
        ProtocolKind::A3c,
        ProtocolKind::FinsTcp,
        ProtocolKind::FinsUdp,
        ProtocolKind::HostLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::A1eBinary => "a1e-binary",
            ProtocolKind::A1eAscii => "a1e-ascii",
            ProtocolKind::McBinary => "mc-binary",
            ProtocolKind::McAscii => "mc-ascii",
            ProtocolKind::A3c => "a3c",
            ProtocolKind::FinsTcp => "fins-tcp",
            ProtocolKind::FinsUdp => "fins-udp",
            ProtocolKind::HostLink => "hostlink",
        }
    }

    /// Link the protocol normally runs over
    pub fn default_link(&self) -> LinkKind {
        match self {
            ProtocolKind::FinsUdp => LinkKind::Udp,
            ProtocolKind::A3c | ProtocolKind::HostLink => LinkKind::Serial,
            _ => LinkKind::Tcp,
        }
    }

    /// Build the codec with the given overrides applied
    pub fn build_codec(&self, options: &CodecOptions) -> Arc<dyn FrameCodec> {
        match self {
            ProtocolKind::A1eBinary | ProtocolKind::A1eAscii => {
                let mut codec = if *self == ProtocolKind::A1eBinary {
                    A1eCodec::binary()
                } else {
                    A1eCodec::ascii()
                };
                if let Some(station) = options.station {
                    codec = codec.with_plc_number(station);
                }
                Arc::new(codec)
            }
            ProtocolKind::McBinary | ProtocolKind::McAscii => {
                let mut codec = if *self == ProtocolKind::McBinary {
                    McCodec::binary()
                } else {
                    McCodec::ascii()
                };
                if let Some(station) = options.station {
                    codec = codec.with_station(station);
                }
                if let Some(network) = options.network {
                    codec = codec.with_network(network);
                }
                Arc::new(codec)
            }
            ProtocolKind::A3c => {
                let mut codec = A3cCodec::new(options.station.unwrap_or(0));
                if let Some(network) = options.network {
                    codec = codec.with_network(network);
                }
                Arc::new(codec)
            }
            ProtocolKind::FinsTcp | ProtocolKind::FinsUdp => {
                let mut codec = if *self == ProtocolKind::FinsTcp {
                    FinsCodec::tcp()
                } else {
                    FinsCodec::udp()
                };
                if let Some(node) = options.local_node {
                    codec = codec.with_local_node(node);
                }
                if let Some(node) = options.remote_node {
                    codec = codec.with_remote_node(node);
                }
                if let Some(unit) = options.station {
                    codec = codec.with_unit(unit);
                }
                Arc::new(codec)
            }
            ProtocolKind::HostLink => Arc::new(HostLinkCodec::new(options.station.unwrap_or(0))),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PlcError::configuration(format!("unknown protocol '{}'", s)))
    }
}

/// Physical link of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Tcp,
    Udp,
    Serial,
}

/// Optional identifiers applied on top of a codec's defaults
///
/// `station` is the PLC number (A1E), station (MC, A3C), unit (HostLink) or
/// destination unit (FINS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecOptions {
    #[serde(default)]
    pub station: Option<u8>,
    #[serde(default)]
    pub network: Option<u8>,
    #[serde(default)]
    pub local_node: Option<u8>,
    #[serde(default)]
    pub remote_node: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityKind {
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: ParityKind,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityKind::None,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    fn data_bits(&self) -> PlcResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(PlcError::configuration(format!("unsupported data bits {}", other))),
        }
    }

    fn stop_bits(&self) -> PlcResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(PlcError::configuration(format!("unsupported stop bits {}", other))),
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            ParityKind::None => tokio_serial::Parity::None,
            ParityKind::Even => tokio_serial::Parity::Even,
            ParityKind::Odd => tokio_serial::Parity::Odd,
        }
    }
}

fn from_path<T: for<'de> Deserialize<'de>>(path: &Path) -> PlcResult<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PlcError::configuration(format!("cannot read {}: {}", path.display(), e)))?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(serde_json::from_str(&text)?),
        _ => Ok(serde_yaml::from_str(&text)?),
    }
}

/// Client connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub protocol: ProtocolKind,
    /// `host:port` for network links, device path for serial links
    pub address: String,
    /// Overrides the protocol's usual link
    #[serde(default)]
    pub link: Option<LinkKind>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(flatten)]
    pub options: CodecOptions,
    #[serde(default)]
    pub packet_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::McBinary,
            address: "127.0.0.1:5000".to_string(),
            link: None,
            timeout_ms: default_timeout_ms(),
            serial: SerialSettings::default(),
            options: CodecOptions::default(),
            packet_logging: false,
        }
    }
}

impl ClientConfig {
    pub fn from_yaml(text: &str) -> PlcResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> PlcResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a `.json` file, anything else is read as YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> PlcResult<Self> {
        from_path(path.as_ref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn link(&self) -> LinkKind {
        self.link.unwrap_or_else(|| self.protocol.default_link())
    }

    pub fn codec(&self) -> Arc<dyn FrameCodec> {
        self.protocol.build_codec(&self.options)
    }

    fn socket_addr(&self) -> PlcResult<SocketAddr> {
        self.address
            .parse()
            .map_err(|e| PlcError::configuration(format!("invalid address '{}': {}", self.address, e)))
    }

    /// Unconnected client over the configured link
    pub fn build_client(&self) -> PlcResult<Box<dyn DeviceClient>> {
        let codec = self.codec();
        let logger = if self.packet_logging {
            PacketLogger::console()
        } else {
            PacketLogger::disabled()
        };
        let client: Box<dyn DeviceClient> = match self.link() {
            LinkKind::Tcp => {
                let mut transport = TcpTransport::new(self.socket_addr()?, self.timeout());
                transport.set_packet_logging(self.packet_logging);
                Box::new(TransactionClient::with_logger(transport, codec, logger))
            }
            LinkKind::Udp => {
                let mut transport = UdpTransport::new(self.socket_addr()?, self.timeout());
                transport.set_packet_logging(self.packet_logging);
                Box::new(TransactionClient::with_logger(transport, codec, logger))
            }
            LinkKind::Serial => {
                let mut transport = SerialTransport::new_with_config(
                    &self.address,
                    self.serial.baud_rate,
                    self.serial.data_bits()?,
                    self.serial.stop_bits()?,
                    self.serial.parity(),
                    self.timeout(),
                );
                transport.set_packet_logging(self.packet_logging);
                Box::new(TransactionClient::with_logger(transport, codec, logger))
            }
        };
        Ok(client)
    }
}

/// Values loaded into the memory bank at start-up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialValue {
    pub address: String,
    /// Word values, or 0 / non-zero for bit devices
    pub values: Vec<u16>,
}

/// Virtual PLC settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: ProtocolKind,
    pub bind: String,
    /// UDP for FINS/UDP, TCP otherwise unless set
    #[serde(default)]
    pub transport: Option<ServerTransport>,
    #[serde(flatten)]
    pub options: CodecOptions,
    #[serde(default = "default_units")]
    pub units: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Device prefixes refusing writes
    #[serde(default)]
    pub read_only: Vec<String>,
    #[serde(default = "default_true")]
    pub writes_enabled: bool,
    /// Admit only these peers when non-empty
    #[serde(default)]
    pub allowed_peers: Vec<IpAddr>,
    #[serde(default)]
    pub initial: Vec<InitialValue>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::McBinary,
            bind: "127.0.0.1:5000".to_string(),
            transport: None,
            options: CodecOptions::default(),
            units: default_units(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            read_only: Vec::new(),
            writes_enabled: true,
            allowed_peers: Vec::new(),
            initial: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(text: &str) -> PlcResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> PlcResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> PlcResult<Self> {
        from_path(path.as_ref())
    }

    pub fn transport(&self) -> ServerTransport {
        self.transport.unwrap_or(match self.protocol {
            ProtocolKind::FinsUdp => ServerTransport::Udp,
            _ => ServerTransport::Tcp,
        })
    }

    /// Wire codes (word and bit) of the read-only prefixes
    fn read_only_codes(&self, codec: &dyn FrameCodec) -> PlcResult<Vec<u16>> {
        let mut codes = Vec::new();
        for prefix in &self.read_only {
            let entry = codec
                .device_table()
                .entries()
                .iter()
                .find(|entry| entry.prefix.eq_ignore_ascii_case(prefix))
                .ok_or_else(|| PlcError::configuration(format!("unknown device prefix '{}'", prefix)))?;
            codes.push(entry.code);
            codes.extend(entry.bit_code);
        }
        Ok(codes)
    }

    /// Server with initial values loaded, not yet started
    pub fn build_server(&self) -> PlcResult<DeviceServer> {
        let codec = self.protocol.build_codec(&self.options);
        let bind_address: SocketAddr = self
            .bind
            .parse()
            .map_err(|e| PlcError::configuration(format!("invalid bind address '{}': {}", self.bind, e)))?;
        let config = DeviceServerConfig {
            bind_address,
            transport: self.transport(),
            max_connections: self.max_connections,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            units: self.units,
            read_only: self.read_only_codes(codec.as_ref())?,
        };

        let mut server = DeviceServer::new(codec.clone(), config);
        if !self.allowed_peers.is_empty() {
            server = server.with_gate(Arc::new(AllowList::new(self.allowed_peers.iter().copied())));
        }
        server.set_writes_enabled(self.writes_enabled);

        for initial in &self.initial {
            let spec = codec.resolve(&initial.address)?;
            let region = server
                .memory()
                .region(spec.device_code())
                .ok_or_else(|| PlcError::unsupported_device(spec.device.prefix.clone()))?;
            match spec.mode {
                DataMode::Word => region.write_words(&initial.values, spec.start as usize)?,
                DataMode::Bit => {
                    let offset = match spec.bit {
                        Some(bit) => spec.start as usize * 16 + bit as usize,
                        None => spec.start as usize,
                    };
                    let bits: Vec<bool> = initial.values.iter().map(|&v| v != 0).collect();
                    region.set_bool(&bits, offset)?;
                }
            }
        }
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.as_str().parse::<ProtocolKind>().unwrap(), kind);
            let yaml = serde_yaml::to_string(&kind).unwrap();
            assert_eq!(yaml.trim(), kind.as_str());
        }
        assert!("modbus".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::HostLink.default_link(), LinkKind::Serial);
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::from_yaml("protocol: fins-udp\naddress: 10.0.0.5:9600\nremote_node: 5\n").unwrap();
        assert_eq!(config.timeout_ms, 3000);
        assert_eq!(config.link(), LinkKind::Udp);
        assert_eq!(config.options.remote_node, Some(5));
        assert_eq!(config.codec().name(), "FINS/UDP");

        let json = ClientConfig::from_json(r#"{"protocol":"hostlink","address":"/dev/ttyS0","station":3}"#).unwrap();
        assert_eq!(json.link(), LinkKind::Serial);
        assert_eq!(json.codec().station(), 3);
    }

    #[test]
    fn test_bad_serial_settings() {
        let config = ClientConfig {
            protocol: ProtocolKind::A3c,
            address: "/dev/ttyS0".to_string(),
            serial: SerialSettings {
                data_bits: 9,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.build_client(), Err(PlcError::Configuration { .. })));
    }

    #[test]
    fn test_server_config_initial_values() {
        let yaml = r#"
protocol: a1e-binary
bind: 127.0.0.1:0
units: 1024
read_only: [D]
initial:
  - address: D10
    values: [7, 8]
  - address: M3
    values: [1, 0, 1]
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert!(config.writes_enabled);
        assert_eq!(config.transport(), ServerTransport::Tcp);

        let server = config.build_server().unwrap();
        let bank = server.memory();
        assert_eq!(bank.by_prefix("D").unwrap().read_words(10, 2).unwrap(), vec![7, 8]);
        assert_eq!(bank.by_prefix("M").unwrap().get_bool(3, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_unknown_read_only_prefix() {
        let config = ServerConfig {
            read_only: vec!["ZZ".to_string()],
            ..Default::default()
        };
        assert!(matches!(config.build_server(), Err(PlcError::Configuration { .. })));
    }
}
