//! # Mover Link - Modbus TCP control layer for linear-motor mover tracks
//!
//! Turns a controller's holding-register map into typed operations for an
//! operator console: bit-level control words, 32-bit split values, batched
//! mover status blocks and 8-register station recipes, over one Modbus TCP
//! connection with a connection state machine and a keep-alive.
//!
//! ## Features
//!
//! - **Async transport**: Tokio-based Modbus TCP client with transaction-id
//!   correlation; late replies to abandoned requests are discarded
//! - **Bounded calls**: every request completes or fails within an explicit limit
//! - **Safe bit updates**: per-address locking, masked write (FC22) with a
//!   read-modify-write fallback
//! - **Keep-alive**: heartbeat toggle or poll, skipped while a foreground
//!   command holds the control word
//! - **Status decoding**: mover position, velocity, state and errors, plus
//!   track-wide flags
//! - **Recipes**: station block codec, ordered table writes, named complete
//!   recipes persisted as JSON
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client |
//! |------|----------|--------|
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//! | 0x16 | Mask Write Register | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mover_link::{LinkConfig, ModbusResult, MoverLink};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let link = MoverLink::new(LinkConfig::default().with_axis_count(4))?;
//!     link.try_connect("127.0.0.1", mover_link::DEFAULT_TCP_PORT, 1).await?;
//!
//!     link.set_enable(true).await?;
//!     link.move_to(2, 350.0).await?;
//!     for mover in link.read_all_status().await? {
//!         println!("mover {}: {} at {:.3} mm", mover.id, mover.state, mover.position);
//!     }
//!
//!     link.disconnect().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Protocol modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants
pub mod constants;

/// Controller register address map
pub mod register_map;

/// Stack-allocated PDU
pub mod pdu;

/// Modbus requests, responses and function codes
pub mod protocol;

/// Word and byte packing of multi-register values
pub mod bytes;

/// Injected logging
pub mod logging;

/// Modbus TCP transport with connection state machine
pub mod transport;

/// Bounded synchronous calls over the transport
pub mod client;

/// Device-specific protocol limits configuration
pub mod device_limits;

// ============================================================================
// Controller modules
// ============================================================================

/// Control word bit updates
pub mod bitfield;

/// Heartbeat scheduler
pub mod keepalive;

/// Mover and system status decoding
pub mod status;

/// Station recipe codec and device writer
pub mod recipe;

/// Named complete recipes and their file format
pub mod recipe_store;

/// Link configuration
pub mod config;

/// Event bus
pub mod events;

/// Operator-facing facade
pub mod link;

#[cfg(test)]
mod test_support;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use mover_link::tokio) ===
pub use tokio;

// === Facade ===
pub use config::LinkConfig;
pub use events::{EventBus, LinkEvent};
pub use link::{MoverLink, OperationStats};

// === Error handling ===
pub use error::{ErrorKind, ModbusError, ModbusResult, TableWriteStep};

// === Core types ===
pub use bytes::{pack32, unpack32};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

// === Components ===
pub use bitfield::{BitWriteStrategy, ControlBit, ControlWordManager, JogDirection};
pub use client::{FallbackBudget, SyncClient};
pub use device_limits::DeviceLimits;
pub use keepalive::{KeepAlive, KeepAliveConfig, KeepAliveMode};
pub use recipe::{FerryPosition, ProcessType, RecipeTable, RecipeWriter, StationRecipe};
pub use recipe_store::{CompleteRecipe, RecipeChange, RecipeStore};
pub use status::{MoverState, MoverStatusRecord, SystemStatus};

// === Transport ===
pub use transport::{ConnectionState, RegisterTransport, TcpTransport, TransportStats};

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

// === PDU (advanced usage) ===
pub use pdu::ModbusPdu;

/// Default request deadline (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Mover Link v{} - Modbus TCP control layer for linear-motor mover tracks",
        VERSION
    )
}
