//! # Voltage PLC - Protocol Adapter Framework for MELSEC and Omron Controllers
//!
//! **License:** MIT
//!
//! Clients and virtual PLC servers for the common Mitsubishi and Omron
//! host-link protocols, built on one codec abstraction. A protocol is a
//! [`FrameCodec`] value; the same value drives the client (request direction
//! out, response direction in) and the server (the reverse).
//!
//! ## Supported Protocols
//!
//! | Protocol | Framing | Link | Client | Server |
//! |----------|---------|------|--------|--------|
//! | MELSEC A1E | binary / ASCII | TCP | ✅ | ✅ |
//! | MELSEC MC 3E | binary / ASCII | TCP, UDP | ✅ | ✅ |
//! | MELSEC MC A3C format 1 | ASCII, sum check | serial | ✅ | ✅ |
//! | Omron FINS | binary | TCP (node handshake), UDP | ✅ | ✅ |
//! | Omron HostLink | ASCII, XOR FCS | serial | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voltage_plc::{DeviceClient, McCodec, PlcResult, TcpClient};
//!
//! #[tokio::main]
//! async fn main() -> PlcResult<()> {
//!     let addr = "192.168.0.10:5000".parse().unwrap();
//!     let mut client = TcpClient::connect_tcp(addr, Arc::new(McCodec::binary()), Duration::from_secs(3)).await?;
//!
//!     let values = client.read_words("D100", 10).await?;
//!     println!("D100..D109: {:?}", values);
//!
//!     client.write_bool("M10", true).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Server Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_plc::{DeviceServer, DeviceServerConfig, FinsCodec, PlcServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeviceServerConfig {
//!         bind_address: "127.0.0.1:9600".parse()?,
//!         ..Default::default()
//!     };
//!     let mut server = DeviceServer::new(Arc::new(FinsCodec::tcp()), config);
//!     server.start().await?;
//!     server.memory().by_prefix("DM").unwrap().write_words(&[1, 2, 3], 100)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │  TransactionClient   │        │     DeviceServer     │
//! │  (async / blocking)  │        │  dispatch → handlers │
//! └──────────────────────┘        └──────────────────────┘
//!            │                               │
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ Exchange (sans I/O)  │        │ MemoryBank/SoftBuffer│
//! └──────────────────────┘        └──────────────────────┘
//!            │                               │
//! ┌───────────────────────────────────────────────────────┐
//! │  FrameCodec: A1E · MC 3E · A3C · FINS · HostLink       │
//! │  AddressResolver · ChecksumKind · FrameBuffer          │
//! └───────────────────────────────────────────────────────┘
//!            │                               │
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ TCP / UDP / serial   │◄──────►│      TCP / UDP       │
//! └──────────────────────┘        └──────────────────────┘
//! ```

/// Error type shared by every layer
pub mod error;

/// Device-address strings and device tables
pub mod address;

/// Sum and XOR checksums rendered as ASCII hex
pub mod checksum;

/// Frame assembly from a byte stream
pub mod framing;

/// Codec abstraction, command frames and request splitting
pub mod protocol;

/// Protocol codecs
pub mod codec;

/// Device memory for virtual PLCs
pub mod soft_buffer;

/// Sans-I/O request/response engine
pub mod exchange;

/// Async byte transports
pub mod transport;

/// Async client
pub mod client;

/// Blocking client and transports
pub mod blocking;

/// Virtual PLC servers
pub mod server;

/// Configuration files
pub mod config;

/// Utility functions and performance monitoring
pub mod utils;

/// Packet logging callbacks
pub mod logging;

// Re-export main types for convenience
pub use address::{AddressResolver, AddressSpec, DataMode, DeviceEntry, DeviceTable, NumericBase};
pub use blocking::{BlockingClient, BlockingTransport, StdSerialTransport, StdTcpTransport, StdUdpTransport};
pub use checksum::ChecksumKind;
pub use client::{DeviceClient, SerialClient, TcpClient, TransactionClient, UdpClient};
pub use codec::{A1eCodec, A3cCodec, Encoding, FinsCodec, FinsFraming, HostLinkCodec, McCodec};
pub use config::{ClientConfig, CodecOptions, LinkKind, ProtocolKind, ServerConfig};
pub use error::{AddressErrorKind, PlcError, PlcResult};
pub use exchange::{ConnectionState, Exchange, Transaction};
pub use framing::{FrameBuffer, FrameProgress};
pub use logging::{LogCallback, LogLevel, LoggingMode, PacketLogger};
pub use protocol::{CommandFrame, DataPayload, FrameCodec, Operation, PointCeilings, ResponseFrame, SessionContext};
pub use server::{AllowAll, AllowList, DeviceServer, DeviceServerConfig, PlcServer, ServerStats, ServerTransport, SessionGate};
pub use soft_buffer::{MemoryBank, SoftBuffer};
pub use transport::{PlcTransport, SerialTransport, TcpTransport, TransportStats, UdpTransport};
pub use utils::{ByteOrder, OperationTimer, PerformanceMetrics};

/// Default timeout for operations (3 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage PLC v{} - MELSEC / Omron protocol adapter framework", VERSION)
}
