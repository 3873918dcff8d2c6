//! Modbus TCP wire constants
//!
//! Only the holding-register subset spoken by the mover controller is listed.

// ============================================================================
// Framing
// ============================================================================

/// MBAP bytes before the unit id: transaction(2) + protocol(2) + length(2).
pub const MBAP_HEADER_LEN: usize = 6;

/// MBAP header including the unit id.
pub const MBAP_FRAME_HEADER_LEN: usize = MBAP_HEADER_LEN + 1;

/// Protocol id of every Modbus frame.
pub const MBAP_PROTOCOL_ID: u16 = 0;

/// Largest PDU a Modbus device must accept.
pub const MAX_PDU_SIZE: usize = 253;

/// Largest value of the MBAP length field: unit id + PDU.
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Largest complete TCP frame.
pub const MAX_TCP_FRAME_LEN: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

// ============================================================================
// Register counts
// ============================================================================

/// FC03 reply: code(1) + byte count(1) + 2N <= 253.
pub const MAX_READ_REGISTERS: usize = 125;

/// FC16 request: code(1) + address(2) + quantity(2) + byte count(1) + 2N <= 253.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// FC22 request and echo: code(1) + address(2) + AND(2) + OR(2).
pub const MASK_WRITE_PDU_LEN: usize = 7;

// ============================================================================
// Function codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Mask Write Register. Optional on many controllers; a rejection sends the
/// control-word paths to read-modify-write.
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Set in the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Exception codes
// ============================================================================

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;
