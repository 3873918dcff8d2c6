//! Error types for the mover link
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. Variants are
//! grouped into the coarse classes reported by [`ModbusError::kind`], which is
//! what callers use to decide between "retry after reconnect", "fix the
//! request" and "report to the operator".

use std::fmt;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Coarse classification of a [`ModbusError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect failure, socket loss, request timeout.
    Transport,
    /// Malformed frame or exception reply from the controller.
    Protocol,
    /// Address, value or index outside the allowed range.
    Validation,
    /// Complete-recipe bookkeeping failure.
    Recipe,
    /// Recipe file could not be read or written.
    Persistence,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Validation => "validation",
            Self::Recipe => "recipe",
            Self::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

/// Step of a full station-table write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableWriteStep {
    /// Writing the station-count register.
    StationCount,
    /// Writing the block of the station at this zero-based index.
    Station(usize),
}

impl fmt::Display for TableWriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StationCount => f.write_str("station count"),
            Self::Station(index) => write!(f, "station {}", index + 1),
        }
    }
}

/// Errors produced by the transport, the register-level helpers and the
/// recipe store.
#[derive(Error, Debug)]
pub enum ModbusError {
    /// Socket could not be opened or was lost.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// An operation was attempted while the transport is not connected.
    #[error("Not connected to controller")]
    NotConnected,

    /// A request did not complete before its deadline.
    #[error("Timeout: {operation} after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed or unexpected frame.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The controller answered with an exception response.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Unsupported function code.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request parameters out of range.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Invalid configuration value.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Both the masked write and the read-modify-write fallback failed.
    #[error(
        "Bit update of register 0x{address:04X} failed: masked write: {masked}; read-modify-write: {fallback}"
    )]
    BitUpdate {
        address: u16,
        masked: String,
        fallback: String,
    },

    /// Station index outside the current table.
    #[error("Invalid station index {index} (table has {count} stations)")]
    StationIndex { index: usize, count: usize },

    /// A full-table write aborted at the given step.
    #[error("Station table write aborted at {step}: {reason}")]
    TableWrite {
        step: TableWriteStep,
        reason: String,
    },

    /// Named complete recipe does not exist.
    #[error("Recipe '{name}' does not exist")]
    RecipeNotFound { name: String },

    /// A complete recipe with that name already exists.
    #[error("Recipe name '{name}' already exists")]
    RecipeExists { name: String },

    /// Recipe names must not be empty.
    #[error("Recipe name must not be empty")]
    EmptyRecipeName,

    /// Nothing to write to the device.
    #[error("Station table is empty")]
    EmptyTable,

    /// Recipe file I/O failure.
    #[error("Recipe file error: {0}")]
    Io(#[from] std::io::Error),

    /// Recipe file is not valid JSON for the expected document.
    #[error("Recipe file format error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModbusError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an exception error from a controller exception code
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_name(code).to_string(),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::NotConnected | Self::Timeout { .. } => {
                ErrorKind::Transport
            }
            Self::Protocol { .. } | Self::Exception { .. } | Self::InvalidFunction { .. } => {
                ErrorKind::Protocol
            }
            Self::InvalidData { .. } | Self::Configuration { .. } | Self::StationIndex { .. } => {
                ErrorKind::Validation
            }
            // Both halves failing is reported as transport-class: the usual cause
            // is a dead link, and a rejected masked write alone never surfaces.
            Self::BitUpdate { .. } => ErrorKind::Transport,
            Self::TableWrite { .. } => ErrorKind::Transport,
            Self::RecipeNotFound { .. }
            | Self::RecipeExists { .. }
            | Self::EmptyRecipeName
            | Self::EmptyTable => ErrorKind::Recipe,
            Self::Io(_) | Self::Json(_) => ErrorKind::Persistence,
        }
    }

    /// Whether the failure came from the link rather than from the request.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Whether this is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Human-readable name of a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    use crate::constants::*;

    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "illegal function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "illegal data address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "illegal data value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "server device failure",
        EXCEPTION_ACKNOWLEDGE => "acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "server device busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "memory parity error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "gateway path unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
