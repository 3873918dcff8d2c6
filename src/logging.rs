//! Injected logging
//!
//! Each component receives a [`CallbackLogger`] at construction instead of
//! reaching for a process-wide logger. The logger always forwards to
//! `tracing`; in [`LoggingMode::Callback`] it also hands every line to a
//! user callback, which is how an operator console shows the link log.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// User hook receiving every log line at or above the configured level.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Drop everything.
    Silent,
    /// `tracing` only.
    #[default]
    Tracing,
    /// `tracing` plus the user callback.
    Callback,
}

/// Cloneable logger handle passed to every component.
#[derive(Clone, Default)]
pub struct CallbackLogger {
    mode: LoggingMode,
    min_level: Option<LogLevel>,
    callback: Option<LogCallback>,
    packet_logging: bool,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("mode", &self.mode)
            .field("min_level", &self.min_level)
            .field("has_callback", &self.callback.is_some())
            .field("packet_logging", &self.packet_logging)
            .finish()
    }
}

impl CallbackLogger {
    /// Logger that forwards to `tracing` only
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger that drops everything
    pub fn silent() -> Self {
        Self {
            mode: LoggingMode::Silent,
            ..Self::default()
        }
    }

    /// Logger that also calls `callback` for every line at `min_level` or above
    pub fn with_callback(callback: LogCallback, min_level: LogLevel) -> Self {
        Self {
            mode: LoggingMode::Callback,
            min_level: Some(min_level),
            callback: Some(callback),
            packet_logging: false,
        }
    }

    /// Enable hex dumps of every request and response
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        match self.mode {
            LoggingMode::Silent => return,
            LoggingMode::Tracing | LoggingMode::Callback => match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            },
        }
        if let Some(callback) = &self.callback {
            if self.min_level.map_or(true, |min| level >= min) {
                callback(level, message);
            }
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log an outgoing request when packet logging is on
    pub fn log_request(&self, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
        if self.packet_logging {
            self.debug(&format!(
                "-> tid={:04X} unit={} pdu=[{}]",
                transaction_id,
                unit_id,
                format_hex(pdu)
            ));
        }
    }

    /// Log an incoming response when packet logging is on
    pub fn log_response(&self, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
        if self.packet_logging {
            self.debug(&format!(
                "<- tid={:04X} unit={} pdu=[{}]",
                transaction_id,
                unit_id,
                format_hex(pdu)
            ));
        }
    }
}

/// Space-separated upper-case hex bytes.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
