//! Holding-register address map of the mover controller
//!
//! These addresses are fixed by the controller program and are not part of
//! the runtime configuration.

// ============================================================================
// Single-axis control block
// ============================================================================

/// Single-axis control word and command registers.
pub mod single_axis {
    /// Control word; every bit is an independent command flag.
    pub const CONTROL_WORD: u16 = 0x0000;
    /// Automatic-mode speed, 32-bit (low word).
    pub const AUTO_SPEED_LOW: u16 = 0x0001;
    /// Automatic-mode speed, 32-bit (high word).
    pub const AUTO_SPEED_HIGH: u16 = 0x0002;
    /// Jog target position, signed 16-bit.
    pub const JOG_POSITION: u16 = 0x0003;
    /// Jog speed, 32-bit (low word).
    pub const JOG_SPEED_LOW: u16 = 0x0004;
    /// Jog speed, 32-bit (high word).
    pub const JOG_SPEED_HIGH: u16 = 0x0005;
}

/// Bit positions inside [`single_axis::CONTROL_WORD`].
pub mod control_bits {
    pub const ENABLE: u8 = 0;
    /// 1 = automatic, 0 = manual.
    pub const RUN_MODE: u8 = 1;
    pub const MANUAL_ALLOW: u8 = 2;
    pub const JOG_LEFT: u8 = 3;
    pub const JOG_RIGHT: u8 = 4;
    pub const AUTO_RUN: u8 = 5;
    /// Toggled by the keep-alive scheduler.
    pub const HEARTBEAT: u8 = 15;
}

// ============================================================================
// Multi-axis command blocks
// ============================================================================

/// Per-mover command registers, indexed by mover id.
pub mod multi_axis {
    /// Enable flag (0/1) at `ENABLE_BASE + id`.
    pub const ENABLE_BASE: u16 = 0x0100;
    /// Speed at `SPEED_BASE + id`.
    pub const SPEED_BASE: u16 = 0x0200;
}

// ============================================================================
// Mover status blocks
// ============================================================================

/// Per-mover status block layout.
///
/// Mover `n` occupies `BASE + n * STRIDE .. BASE + (n + 1) * STRIDE`.
/// 32-bit fields are stored low word first and scaled by [`SCALE`].
pub mod mover_status {
    pub const BASE: u16 = 100;
    pub const STRIDE: u16 = 10;

    pub const POSITION_LOW: u16 = 0;
    pub const VELOCITY_LOW: u16 = 2;
    pub const STATUS_WORD: u16 = 4;
    pub const ERROR_CODE: u16 = 5;
    pub const TARGET_LOW: u16 = 8;

    /// Raw counts per engineering unit (micrometres per millimetre).
    pub const SCALE: f64 = 1000.0;

    /// Status word bits.
    pub const BIT_ENABLED: u16 = 1 << 0;
    pub const BIT_RUNNING: u16 = 1 << 1;
    pub const BIT_IN_POSITION: u16 = 1 << 2;
    pub const BIT_ERROR: u16 = 1 << 3;
    pub const BIT_EMERGENCY_STOP: u16 = 1 << 4;
}

/// Track-wide status flags, read as one contiguous block.
pub mod system_status {
    pub const SYSTEM_READY: u16 = 200;
    pub const SYSTEM_ERROR: u16 = 201;
    pub const EMERGENCY_STOP: u16 = 202;
    pub const MOVER_COUNT: u16 = 203;
    /// Number of registers from `SYSTEM_READY` to `MOVER_COUNT` inclusive.
    pub const BLOCK_LEN: u16 = 4;
}

// ============================================================================
// Recipe table
// ============================================================================

/// Station recipe table.
pub mod recipe {
    /// Total number of stations in the table.
    pub const STATION_COUNT: u16 = 0x0023;
    /// First register of station 0.
    pub const BASE: u16 = 0x0024;
    /// Registers per station.
    pub const STATION_SIZE: u16 = 8;
}

/// Address of the status block of mover `mover_id`, or `None` if it would not
/// fit in the 16-bit address space.
pub fn mover_status_address(mover_id: u16) -> Option<u16> {
    mover_id
        .checked_mul(mover_status::STRIDE)
        .and_then(|offset| offset.checked_add(mover_status::BASE))
}

/// Address of the first register of station `index`.
pub fn station_address(index: usize) -> Option<u16> {
    let index = u16::try_from(index).ok()?;
    index
        .checked_mul(recipe::STATION_SIZE)
        .and_then(|offset| offset.checked_add(recipe::BASE))
        .filter(|addr| addr.checked_add(recipe::STATION_SIZE - 1).is_some())
}
