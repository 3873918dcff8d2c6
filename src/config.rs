//! Link configuration
//!
//! [`LinkConfig`] gathers every tunable of the link in one place. Register
//! addresses are protocol constants in [`register_map`](crate::register_map)
//! and are deliberately absent here.
//!
//! # Example
//!
//! ```rust
//! use mover_link::config::LinkConfig;
//! use mover_link::bitfield::BitWriteStrategy;
//! use std::time::Duration;
//!
//! let config = LinkConfig::new()
//!     .with_axis_count(4)
//!     .with_bit_strategy(BitWriteStrategy::ReadModifyWrite)
//!     .with_poll_interval(Duration::from_millis(500));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.axis_count, 4);
//! ```

use std::time::Duration;

use crate::bitfield::BitWriteStrategy;
use crate::client::{DEFAULT_MASKED_BUDGET_MS, DEFAULT_MASKED_SHARE};
use crate::device_limits::DeviceLimits;
use crate::error::{ModbusError, ModbusResult};
use crate::keepalive::{KeepAliveConfig, KeepAliveMode};
use crate::logging::CallbackLogger;
use crate::recipe::StationRecipe;
use crate::register_map::mover_status;
use crate::transport::TransportConfig;

/// Default bound of a plain synchronous read or write.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 1000;
/// Default period of the cyclic status read.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Every tunable of a [`MoverLink`](crate::link::MoverLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on opening the socket.
    pub connect_timeout: Duration,
    /// Hard deadline of every request on the wire.
    pub request_timeout: Duration,
    /// Bound of each plain synchronous read or write.
    pub sync_timeout: Duration,
    /// Overall bound of one bit update, fallback included.
    pub bit_update_budget: Duration,
    pub bit_strategy: BitWriteStrategy,
    /// Share of `bit_update_budget` given to the masked attempt.
    pub masked_share: f64,
    pub keepalive: KeepAliveConfig,
    /// Movers decoded by the status poll, ids `0..axis_count`.
    pub axis_count: u16,
    pub poll_enabled: bool,
    pub poll_interval: Duration,
    pub limits: DeviceLimits,
    pub logger: CallbackLogger,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            connect_timeout: transport.connect_timeout,
            request_timeout: transport.request_timeout,
            sync_timeout: Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS),
            bit_update_budget: Duration::from_millis(DEFAULT_MASKED_BUDGET_MS),
            bit_strategy: BitWriteStrategy::default(),
            masked_share: DEFAULT_MASKED_SHARE,
            keepalive: KeepAliveConfig::default(),
            axis_count: 1,
            poll_enabled: true,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            limits: DeviceLimits::default(),
            logger: CallbackLogger::default(),
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_bit_update_budget(mut self, budget: Duration) -> Self {
        self.bit_update_budget = budget;
        self
    }

    pub fn with_bit_strategy(mut self, strategy: BitWriteStrategy) -> Self {
        self.bit_strategy = strategy;
        self
    }

    /// Clamped to `0.1..=0.9` when the budget is split.
    pub fn with_masked_share(mut self, share: f64) -> Self {
        self.masked_share = share;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_keepalive_enabled(mut self, enabled: bool) -> Self {
        self.keepalive.enabled = enabled;
        self
    }

    pub fn with_keepalive_mode(mut self, mode: KeepAliveMode) -> Self {
        self.keepalive.mode = mode;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive.interval = interval;
        self
    }

    pub fn with_axis_count(mut self, count: u16) -> Self {
        self.axis_count = count;
        self
    }

    pub fn with_polling(mut self, enabled: bool) -> Self {
        self.poll_enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Timeouts handed to the TCP transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
        }
    }

    /// Reject settings the link cannot run with.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.sync_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(ModbusError::configuration("Timeouts must be non-zero"));
        }
        if !self.masked_share.is_finite() {
            return Err(ModbusError::configuration("Masked-write share must be finite"));
        }
        if self.keepalive.enabled && self.keepalive.interval.is_zero() {
            return Err(ModbusError::configuration("Keep-alive interval must be non-zero"));
        }
        if self.poll_enabled && self.poll_interval.is_zero() {
            return Err(ModbusError::configuration("Poll interval must be non-zero"));
        }
        self.limits
            .check(mover_status::STRIDE, StationRecipe::REGISTERS)?;
        let span = u32::from(self.axis_count) * u32::from(mover_status::STRIDE);
        if u32::from(mover_status::BASE) + span > 0x1_0000 {
            return Err(ModbusError::configuration(format!(
                "{} movers exceed the status address space",
                self.axis_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(3000));
        assert_eq!(config.request_timeout, Duration::from_millis(crate::DEFAULT_TIMEOUT_MS));
        assert_eq!(config.sync_timeout, Duration::from_millis(1000));
        assert_eq!(config.bit_update_budget, Duration::from_millis(2800));
        assert_eq!(config.bit_strategy, BitWriteStrategy::MaskedWithFallback);
        assert_eq!(config.masked_share, 0.4);
        assert_eq!(config.keepalive.interval, Duration::from_millis(3000));
        assert_eq!(config.axis_count, 1);
        assert!(config.poll_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LinkConfig::new()
            .with_keepalive_mode(KeepAliveMode::Poll)
            .with_keepalive_interval(Duration::from_millis(2000))
            .with_limits(DeviceLimits::conservative())
            .with_sync_timeout(Duration::from_millis(500));

        assert_eq!(config.keepalive.mode, KeepAliveMode::Poll);
        assert_eq!(config.keepalive.op_timeout(), Duration::from_millis(800));
        assert_eq!(config.limits.max_read_registers, 50);
        assert_eq!(config.transport_config().connect_timeout, config.connect_timeout);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(LinkConfig::new()
            .with_sync_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(LinkConfig::new()
            .with_limits(DeviceLimits::new().with_max_write_registers(4))
            .validate()
            .is_err());
        // A status block must fit one read.
        assert!(LinkConfig::new()
            .with_limits(DeviceLimits::new().with_max_read_registers(9))
            .validate()
            .is_err());
        assert!(LinkConfig::new()
            .with_axis_count(u16::MAX)
            .validate()
            .is_err());
        assert!(LinkConfig::new()
            .with_keepalive_interval(Duration::ZERO)
            .validate()
            .is_err());
        // A disabled keep-alive does not care about its interval.
        assert!(LinkConfig::new()
            .with_keepalive_enabled(false)
            .with_keepalive_interval(Duration::ZERO)
            .validate()
            .is_ok());
    }
}
