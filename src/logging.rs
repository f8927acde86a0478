//! Callback sink for raw packet dumps
//!
//! Clients hand every frame they send and receive to an optional
//! [`PacketLogger`]. The sink decides how to render it (hex, printable text
//! or both) and where it goes.

use std::sync::Arc;

use crate::protocol::CommandFrame;
use crate::utils::format::{bytes_to_hex, bytes_to_text};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// How packet bytes are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Space separated hex bytes
    Hex,
    /// Printable characters, control bytes as `<0D>`
    Text,
    /// Hex at the given level, text one level lower
    Both,
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Packet logger that forwards to a callback
#[derive(Clone)]
pub struct PacketLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl std::fmt::Debug for PacketLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .field("mode", &self.mode)
            .finish()
    }
}

impl PacketLogger {
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Hex)
    }

    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Logger printing timestamped lines to stdout / stderr
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Dump raw bytes with a direction tag
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        match self.mode {
            LoggingMode::Hex => {
                self.log(level, &format!("{} ({} bytes): {}", direction, data.len(), bytes_to_hex(data)))
            }
            LoggingMode::Text => {
                self.log(level, &format!("{} ({} bytes): {}", direction, data.len(), bytes_to_text(data)))
            }
            LoggingMode::Both => {
                self.log(level, &format!("{} ({} bytes): {}", direction, data.len(), bytes_to_hex(data)));
                self.log(LogLevel::Debug, &format!("{} text: {}", direction, bytes_to_text(data)));
            }
        }
    }

    /// Log an outgoing command frame with its encoding
    pub fn log_request(&self, protocol: &str, frame: &CommandFrame, bytes: &[u8]) {
        if !self.should_log(LogLevel::Info) {
            return;
        }
        let summary = format!(
            "{} {} {} code 0x{:X} start {}{} x{} station {} seq {}",
            protocol,
            frame.operation,
            frame.mode,
            frame.device_code,
            frame.start,
            frame.bit.map(|b| format!(".{}", b)).unwrap_or_default(),
            frame.points,
            frame.station,
            frame.sequence
        );
        self.info(&summary);
        self.log_packet(LogLevel::Info, "send", bytes);
    }

    /// Log a received frame
    pub fn log_response(&self, protocol: &str, bytes: &[u8]) {
        self.log_packet(LogLevel::Info, &format!("{} receive", protocol), bytes);
    }
}

impl Default for PacketLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Convenience macro for creating a console packet logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::PacketLogger::console()
    };
}

/// Convenience macro for creating a custom packet logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::PacketLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::PacketLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::PacketLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture(level: LogLevel, mode: LoggingMode) -> (PacketLogger, Arc<Mutex<Vec<(LogLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push((level, message.to_string()));
        });
        (PacketLogger::with_mode(Some(callback), level, mode), lines)
    }

    #[test]
    fn test_level_filter() {
        let (logger, lines) = capture(LogLevel::Warn, LoggingMode::Hex);
        logger.info("hidden");
        logger.warn("shown");
        logger.error("shown too");
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_packet_modes() {
        let (logger, lines) = capture(LogLevel::Debug, LoggingMode::Both);
        logger.log_packet(LogLevel::Info, "send", b"@00*\r");
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.contains("40 30 30 2A 0D"));
        assert!(lines[1].1.contains("@00*<0D>"));
        assert_eq!(lines[1].0, LogLevel::Debug);
    }

    #[test]
    fn test_disabled_logger() {
        let logger = PacketLogger::default();
        assert!(!logger.is_enabled());
        logger.log_packet(LogLevel::Error, "send", &[1, 2, 3]);
    }
}
