//! Request-size limits of the controller or the gateway in front of it
//!
//! A Modbus TCP reply carries at most 125 registers for FC03 and a request
//! at most 123 for FC16. Some gateways accept less. Status polling sizes its
//! reads from these limits and never splits a mover block across two
//! requests; a station block is always written in one FC16.

use std::time::Duration;

use crate::constants::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::error::{ModbusError, ModbusResult};

/// Request limits of one controller connection.
///
/// ```rust
/// use std::time::Duration;
/// use mover_link::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(50)
///     .with_inter_request_delay(Duration::from_millis(10));
///
/// // Five ten-register mover blocks per read.
/// assert_eq!(limits.aligned_read_size(10), 50);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_read_registers: u16,
    pub max_write_registers: u16,
    /// Pause between the reads of one batch.
    pub inter_request_delay: Duration,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: MAX_READ_REGISTERS as u16,
            max_write_registers: MAX_WRITE_REGISTERS as u16,
            inter_request_delay: Duration::ZERO,
        }
    }
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial gateways: 50 registers per request, 10 ms apart.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_write_registers: 50,
            inter_request_delay: Duration::from_millis(10),
        }
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.min(MAX_READ_REGISTERS as u16);
        self
    }

    pub fn with_max_write_registers(mut self, count: u16) -> Self {
        self.max_write_registers = count.min(MAX_WRITE_REGISTERS as u16);
        self
    }

    pub fn with_inter_request_delay(mut self, delay: Duration) -> Self {
        self.inter_request_delay = delay;
        self
    }

    /// Largest read that holds whole `block_len`-register records.
    ///
    /// Zero when a single record does not fit in one read.
    pub fn aligned_read_size(&self, block_len: u16) -> u16 {
        if block_len == 0 {
            return 0;
        }
        self.max_read_registers / block_len * block_len
    }

    /// `(offset, count)` of each read covering `blocks` records of
    /// `block_len` registers.
    pub fn read_chunks(&self, block_len: u16, blocks: u16) -> Vec<(u16, u16)> {
        let step = u32::from(self.aligned_read_size(block_len));
        let total = u32::from(block_len) * u32::from(blocks);
        if step == 0 || total == 0 {
            return Vec::new();
        }
        (0..total)
            .step_by(step as usize)
            .map(|offset| (offset as u16, (total - offset).min(step) as u16))
            .collect()
    }

    pub fn fits_write(&self, registers: usize) -> bool {
        registers <= usize::from(self.max_write_registers)
    }

    /// Reject limits under which a `block_len` read or a `write_len` write
    /// cannot be issued.
    pub fn check(&self, block_len: u16, write_len: usize) -> ModbusResult<()> {
        if self.aligned_read_size(block_len) == 0 {
            return Err(ModbusError::configuration(format!(
                "Read limit {} is below one {}-register block",
                self.max_read_registers, block_len
            )));
        }
        if !self.fits_write(write_len) {
            return Err(ModbusError::configuration(format!(
                "Write limit {} is below one {}-register block",
                self.max_write_registers, write_len
            )));
        }
        Ok(())
    }
}
