//! Synchronous call adapter
//!
//! [`SyncClient`] turns the submit-then-wait transport API into single calls
//! that either complete or fail within an explicit bound. It is what the
//! read-modify-write paths and the recipe writer use, since each of their
//! steps depends on the previous one having completed.
//!
//! A timed-out call has an unknown outcome on the controller. The reply, if
//! it ever arrives, is discarded by the transport. Callers treat a timeout as
//! a failure and do not retry in a tight loop.
//!
//! # Budget splitting
//!
//! A masked write with read-modify-write fallback runs up to three wire
//! operations under one overall budget. [`FallbackBudget`] splits it: a share
//! for the masked attempt, the remainder for the fallback, of which two
//! thirds go to the read and the rest to the write-back. Each phase has a
//! floor so slow gateways still get a fair attempt.

use std::sync::Arc;
use std::time::Duration;

use crate::bytes::pack_i32;
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusRequest, ModbusResponse};
use crate::transport::RegisterTransport;

/// Budget used when a caller passes a zero timeout to a masked update.
pub const DEFAULT_MASKED_BUDGET_MS: u64 = 2800;
/// Default share of the budget spent on the masked attempt.
pub const DEFAULT_MASKED_SHARE: f64 = 0.4;

const MIN_MASKED_MS: u64 = 400;
const MIN_FALLBACK_READ_MS: u64 = 800;
const MIN_FALLBACK_WRITE_MS: u64 = 600;

/// Per-phase timeouts of a masked write with read-modify-write fallback.
///
/// Each phase has a floor (masked 400 ms, read 800 ms, write 600 ms) that
/// wins over the total. Short totals therefore yield phases that add up to
/// more than the total: 1000 ms splits into 400 + 800 + 600 = 1800 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackBudget {
    pub masked: Duration,
    pub fallback_read: Duration,
    pub fallback_write: Duration,
}

impl FallbackBudget {
    /// Split `total` giving `masked_share` (clamped to 0.1..=0.9) to the
    /// masked attempt.
    ///
    /// ```rust
    /// use mover_link::client::FallbackBudget;
    /// use std::time::Duration;
    ///
    /// let budget = FallbackBudget::split(Duration::from_millis(2800), 0.4);
    /// assert_eq!(budget.masked, Duration::from_millis(1120));
    /// assert_eq!(budget.fallback_read, Duration::from_millis(1120));
    /// assert_eq!(budget.fallback_write, Duration::from_millis(600));
    /// ```
    pub fn split(total: Duration, masked_share: f64) -> Self {
        let total_ms = match total.as_millis() as u64 {
            0 => DEFAULT_MASKED_BUDGET_MS,
            ms => ms,
        };
        let permille = (masked_share.clamp(0.1, 0.9) * 1000.0).round() as u64;
        let masked = (total_ms * permille / 1000).max(MIN_MASKED_MS);
        let rest = total_ms.saturating_sub(masked);
        let read = (rest * 2 / 3).max(MIN_FALLBACK_READ_MS);
        let write = rest.saturating_sub(read).max(MIN_FALLBACK_WRITE_MS);
        Self {
            masked: Duration::from_millis(masked),
            fallback_read: Duration::from_millis(read),
            fallback_write: Duration::from_millis(write),
        }
    }

    /// Budget for a plain read-modify-write: no masked phase, the whole
    /// `total` split between read and write-back.
    pub fn read_modify_write(total: Duration) -> Self {
        let total_ms = match total.as_millis() as u64 {
            0 => DEFAULT_MASKED_BUDGET_MS,
            ms => ms,
        };
        let read = (total_ms * 2 / 3).max(MIN_FALLBACK_READ_MS);
        let write = total_ms.saturating_sub(read).max(MIN_FALLBACK_WRITE_MS);
        Self {
            masked: Duration::ZERO,
            fallback_read: Duration::from_millis(read),
            fallback_write: Duration::from_millis(write),
        }
    }
}

/// Bounded request/response calls over a shared transport.
pub struct SyncClient<T: RegisterTransport> {
    transport: Arc<T>,
    logger: Option<CallbackLogger>,
}

impl<T: RegisterTransport> Clone for SyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            logger: self.logger.clone(),
        }
    }
}

impl<T: RegisterTransport> SyncClient<T> {
    /// Create a new adapter over the transport
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            logger: None,
        }
    }

    /// Create a new adapter with logging
    pub fn with_logger(transport: Arc<T>, logger: CallbackLogger) -> Self {
        Self {
            transport,
            logger: Some(logger),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Submit a raw request and wait for its reply for at most `limit`
    pub async fn execute_request(
        &self,
        request: ModbusRequest,
        limit: Duration,
    ) -> ModbusResult<ModbusResponse> {
        if !self.transport.is_connected() {
            return Err(ModbusError::NotConnected);
        }
        let description = format!("{} 0x{:04X}", request.function, request.address);
        let result = match self.transport.submit(request).await {
            Ok(reply) => reply.wait(limit).await,
            Err(e) => Err(e),
        };

        if let (Some(logger), Err(e)) = (&self.logger, &result) {
            logger.debug(&format!("{} failed: {}", description, e));
        }
        result
    }

    /// Read one holding register
    pub async fn read_register(&self, address: u16, limit: Duration) -> ModbusResult<u16> {
        let values = self.read_registers(address, 1, limit).await?;
        values
            .first()
            .copied()
            .ok_or_else(|| ModbusError::protocol("Read reply carried no registers"))
    }

    /// Read `count` holding registers in one request.
    ///
    /// A reply carrying any other number of registers is a protocol error.
    pub async fn read_registers(
        &self,
        address: u16,
        count: u16,
        limit: Duration,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::read_holding(self.transport.unit_id(), address, count);
        self.execute_request(request, limit)
            .await?
            .parse_registers_exact(count)
    }

    /// Read `blocks` consecutive records of `block_len` registers in as few
    /// requests as `limits` allow. A record is never split across two
    /// requests. Each request gets its own `limit`.
    pub async fn read_blocks(
        &self,
        address: u16,
        block_len: u16,
        blocks: u16,
        limits: &DeviceLimits,
        limit: Duration,
    ) -> ModbusResult<Vec<u16>> {
        let total = u32::from(block_len) * u32::from(blocks);
        if total == 0 {
            return Err(ModbusError::invalid_data("Invalid quantity"));
        }
        if u32::from(address) + total > 0x1_0000 {
            return Err(ModbusError::invalid_data(format!(
                "Register range 0x{:04X}+{} exceeds address space",
                address, total
            )));
        }
        let chunks = limits.read_chunks(block_len, blocks);
        if chunks.is_empty() {
            return Err(ModbusError::configuration(format!(
                "Read limit {} is below one {}-register block",
                limits.max_read_registers, block_len
            )));
        }

        let mut result = Vec::with_capacity(total as usize);
        for (i, &(offset, count)) in chunks.iter().enumerate() {
            if i > 0 && !limits.inter_request_delay.is_zero() {
                tokio::time::sleep(limits.inter_request_delay).await;
            }
            result.extend(self.read_registers(address + offset, count, limit).await?);
        }
        Ok(result)
    }

    /// Write one holding register
    pub async fn write_register(&self, address: u16, value: u16, limit: Duration) -> ModbusResult<()> {
        self.write_registers(address, &[value], limit).await
    }

    /// Write contiguous registers in one request
    pub async fn write_registers(
        &self,
        address: u16,
        values: &[u16],
        limit: Duration,
    ) -> ModbusResult<()> {
        let request = ModbusRequest::write_registers(self.transport.unit_id(), address, values);
        self.execute_request(request, limit).await.map(|_| ())
    }

    /// Write a signed 32-bit value, low word at `address`, in one request
    pub async fn write_i32(&self, address: u16, value: i32, limit: Duration) -> ModbusResult<()> {
        self.write_registers(address, &pack_i32(value), limit)
            .await
    }

    /// Single masked write (FC22) without fallback
    pub async fn mask_write(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
        limit: Duration,
    ) -> ModbusResult<()> {
        let request =
            ModbusRequest::mask_write(self.transport.unit_id(), address, and_mask, or_mask);
        self.execute_request(request, limit).await.map(|_| ())
    }
}
