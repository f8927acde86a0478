//! # Voltage PLC Error Handling
//!
//! Every fallible operation in the library returns [`PlcResult`]. Nothing is
//! thrown across the public API for an expected failure: address typos, length
//! ceilings, garbled frames, remote status codes and transport failures all come
//! back through the same typed channel.
//!
//! ## Error Categories
//!
//! ### Build-time errors (detected before any I/O)
//! - **AddressParse**: unknown prefix, malformed numeral, out-of-range value, bad bit index
//! - **LengthExceeded**: point count over a single-frame-only ceiling
//! - **UnsupportedDeviceType**: device not served by the codec or server
//!
//! ### Frame errors
//! - **ShortResponse**: fewer bytes than the minimum valid header
//! - **ChecksumMismatch**: FCS / sum check differs from the recomputed value
//! - **Frame**: envelope or field violations
//! - **StationMismatch**: a frame addressed to another station/unit
//!
//! ### Remote errors
//! - **ProtocolStatus**: the PLC answered with a non-zero status or end code
//!
//! ### Transport errors
//! - **Io**, **Connection**, **Timeout**
//!
//! ## Usage
//!
//! ```rust
//! use voltage_plc::{PlcError, PlcResult};
//!
//! fn handle(result: PlcResult<Vec<u16>>) {
//!     match result {
//!         Ok(words) => println!("read {} words", words.len()),
//!         Err(PlcError::ProtocolStatus { code, message }) => {
//!             println!("PLC rejected request: 0x{:04X} {}", code, message);
//!         }
//!         Err(error) if error.is_transport_error() => {
//!             println!("link lost, reconnect required: {}", error);
//!         }
//!         Err(error) => println!("request failed: {}", error),
//!     }
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias for all PLC operations
pub type PlcResult<T> = Result<T, PlcError>;

/// Which part of an address string failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressErrorKind {
    /// No device-type prefix in the table matches
    UnknownPrefix,
    /// The numeral is not valid in the device's numeric base
    MalformedNumeral,
    /// The numeral or a prefix parameter exceeds the allowed range
    OutOfRange,
    /// A `.n` bit index was given where the device does not accept one
    UnsupportedBitIndex,
}

impl fmt::Display for AddressErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressErrorKind::UnknownPrefix => "unknown device prefix",
            AddressErrorKind::MalformedNumeral => "malformed numeral",
            AddressErrorKind::OutOfRange => "value out of range",
            AddressErrorKind::UnsupportedBitIndex => "unsupported bit index",
        };
        f.write_str(name)
    }
}

/// Comprehensive PLC error types
///
/// Each variant carries enough context to diagnose the failure without the
/// raw frame at hand.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlcError {
    /// Address string could not be resolved against the device table
    #[error("Address error in '{address}': {kind} ({detail})")]
    AddressParse {
        kind: AddressErrorKind,
        address: String,
        detail: String,
    },

    /// Requested point count exceeds a ceiling that cannot be split
    #[error("Length exceeded: requested {requested} points, ceiling {ceiling}")]
    LengthExceeded { requested: usize, ceiling: usize },

    /// Checksum validation failure
    #[error("Checksum mismatch: expected={expected:02X}, actual={actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Fewer bytes than the minimum valid frame
    #[error("Short response: expected at least {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    /// Remote returned a non-zero status or end code
    ///
    /// The numeric code is protocol-specific; `message` holds the codec's
    /// human-readable lookup for it.
    #[error("PLC status 0x{code:04X}: {message}")]
    ProtocolStatus { code: u16, message: String },

    /// Device type not known to the codec or not served
    #[error("Unsupported device type: {device}")]
    UnsupportedDeviceType { device: String },

    /// Frame envelope or field violation
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Frame addressed to a different station / unit
    #[error("Station mismatch: expected {expected}, got {actual}")]
    StationMismatch { expected: u8, actual: u8 },

    /// I/O related errors (socket, serial port)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or state errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid data value supplied by the caller
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Client or server configuration problems
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (lock poisoning and similar)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PlcError {
    /// Create an address parse error
    pub fn address<A: Into<String>, D: Into<String>>(kind: AddressErrorKind, address: A, detail: D) -> Self {
        Self::AddressParse {
            kind,
            address: address.into(),
            detail: detail.into(),
        }
    }

    /// Create a length exceeded error
    pub fn length_exceeded(requested: usize, ceiling: usize) -> Self {
        Self::LengthExceeded { requested, ceiling }
    }

    /// Create a checksum mismatch error
    pub fn checksum_mismatch(expected: u8, actual: u8) -> Self {
        Self::ChecksumMismatch { expected, actual }
    }

    /// Create a short response error
    pub fn short_response(expected: usize, actual: usize) -> Self {
        Self::ShortResponse { expected, actual }
    }

    /// Create a protocol status error
    ///
    /// # Arguments
    ///
    /// * `code` - Status / end code exactly as reported by the PLC
    /// * `message` - Human-readable lookup for the code
    pub fn protocol_status<S: Into<String>>(code: u16, message: S) -> Self {
        Self::ProtocolStatus {
            code,
            message: message.into(),
        }
    }

    /// Create an unsupported device type error
    pub fn unsupported_device<S: Into<String>>(device: S) -> Self {
        Self::UnsupportedDeviceType { device: device.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a station mismatch error
    pub fn station_mismatch(expected: u8, actual: u8) -> Self {
        Self::StationMismatch { expected, actual }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the operation might succeed if retried after reconnecting
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_plc::PlcError;
    ///
    /// assert!(PlcError::timeout("receive", 1000).is_recoverable());
    /// assert!(!PlcError::length_exceeded(40, 30).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::ShortResponse { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// Check if the error comes from the transport layer
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a wire-protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolStatus { .. }
                | Self::Frame { .. }
                | Self::ChecksumMismatch { .. }
                | Self::ShortResponse { .. }
                | Self::StationMismatch { .. }
        )
    }

    /// Check if the error was raised before any I/O took place
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Self::AddressParse { .. }
                | Self::LengthExceeded { .. }
                | Self::UnsupportedDeviceType { .. }
                | Self::InvalidData { .. }
        )
    }

    /// Whether the link must be treated as desynchronised after this error
    ///
    /// A well-formed status reply keeps the session usable; anything that
    /// leaves unread or garbled bytes on the wire does not.
    pub fn breaks_session(&self) -> bool {
        self.is_transport_error()
            || matches!(
                self,
                Self::Frame { .. }
                    | Self::ShortResponse { .. }
                    | Self::ChecksumMismatch { .. }
                    | Self::StationMismatch { .. }
            )
    }
}

impl From<std::io::Error> for PlcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(err.to_string(), 0)
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for PlcError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for PlcError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for PlcError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

impl From<tokio_serial::Error> for PlcError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}
