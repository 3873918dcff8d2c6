//! # Control word bit manipulation
//!
//! The controller exposes its command flags as bits of one holding register.
//! Setting a flag must not disturb the others, including the heartbeat bit
//! that the keep-alive task toggles on the same register.
//!
//! Two strategies are supported:
//!
//! - **Read-modify-write**: read the register, change one bit, write it back.
//!   Not atomic on the wire, so every update holds the per-address lock from
//!   [`AddressLocks`] for the whole sequence.
//! - **Masked write with fallback** (default): try FC22 first; if the
//!   controller rejects it, times out or the request cannot be sent, fall back
//!   to read-modify-write under the same overall budget. An error is returned
//!   only when both paths fail.
//!
//! ## Masks
//!
//! For bit `b` both set and clear use `and = !(1 << b)`; set uses
//! `or = 1 << b`, clear uses `or = 0`. With the target bit cleared in the AND
//! mask the standard FC22 result `(cur & and) | (or & !and)` equals
//! `(cur & and) | or`, so the fallback computes the same value the
//! controller would.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::client::{FallbackBudget, SyncClient, DEFAULT_MASKED_BUDGET_MS, DEFAULT_MASKED_SHARE};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::register_map::{control_bits, single_axis};
use crate::transport::RegisterTransport;

// ============================================================================
// Per-address locks
// ============================================================================

/// One async mutex per register address, created on first use.
///
/// Only addresses that several tasks write bit-wise need a lock; status and
/// recipe registers never go through here.
#[derive(Debug, Default)]
pub struct AddressLocks {
    locks: StdMutex<HashMap<u16, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, address: u16) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `address`
    pub async fn lock(&self, address: u16) -> OwnedMutexGuard<()> {
        self.entry(address).lock_owned().await
    }

    /// Exclusive access to `address` if nobody holds it right now
    pub fn try_lock(&self, address: u16) -> Option<OwnedMutexGuard<()>> {
        self.entry(address).try_lock_owned().ok()
    }
}

// ============================================================================
// Bit identifiers
// ============================================================================

/// How single-bit updates reach the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BitWriteStrategy {
    /// Read, modify, write back.
    ReadModifyWrite,
    /// FC22 first, read-modify-write if it fails.
    #[default]
    MaskedWithFallback,
}

impl fmt::Display for BitWriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadModifyWrite => write!(f, "read-modify-write"),
            Self::MaskedWithFallback => write!(f, "masked write with fallback"),
        }
    }
}

/// Named bits of the single-axis control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlBit {
    Enable,
    /// Set = automatic mode, clear = manual mode.
    RunMode,
    ManualAllow,
    JogLeft,
    JogRight,
    AutoRun,
    Heartbeat,
}

impl ControlBit {
    pub fn position(self) -> u8 {
        match self {
            Self::Enable => control_bits::ENABLE,
            Self::RunMode => control_bits::RUN_MODE,
            Self::ManualAllow => control_bits::MANUAL_ALLOW,
            Self::JogLeft => control_bits::JOG_LEFT,
            Self::JogRight => control_bits::JOG_RIGHT,
            Self::AutoRun => control_bits::AUTO_RUN,
            Self::Heartbeat => control_bits::HEARTBEAT,
        }
    }

    pub fn mask(self) -> u16 {
        1 << self.position()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::RunMode => "run mode",
            Self::ManualAllow => "manual allow",
            Self::JogLeft => "jog left",
            Self::JogRight => "jog right",
            Self::AutoRun => "auto run",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for ControlBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bit {})", self.name(), self.position())
    }
}

/// Jog command. The numeric values match the operator console codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JogDirection {
    #[default]
    Stop = 0,
    Left = 1,
    Right = 2,
}

impl JogDirection {
    /// Unknown codes stop the axis.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Left,
            2 => Self::Right,
            _ => Self::Stop,
        }
    }
}

/// AND/OR masks that set or clear `bit` and keep every other bit.
#[inline]
pub fn bit_masks(bit: u8, value: bool) -> (u16, u16) {
    let mask = 1u16 << (bit & 0x0F);
    (!mask, if value { mask } else { 0 })
}

/// Result of a masked write as defined for FC22.
#[inline]
pub fn apply_masks(current: u16, and_mask: u16, or_mask: u16) -> u16 {
    (current & and_mask) | (or_mask & !and_mask)
}

// ============================================================================
// Manager
// ============================================================================

/// Which path completed a bit update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePath {
    Masked,
    /// FC22 failed and read-modify-write succeeded.
    Fallback,
    ReadModifyWrite,
}

/// Counters of bit updates since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitUpdateStats {
    pub updates: u64,
    /// Masked write failed, fallback succeeded.
    pub degraded: u64,
    pub failures: u64,
}

/// Serialised single-bit updates of control registers.
pub struct ControlWordManager<T: RegisterTransport> {
    client: SyncClient<T>,
    locks: Arc<AddressLocks>,
    strategy: BitWriteStrategy,
    budget: Duration,
    masked_share: f64,
    logger: CallbackLogger,
    updates: AtomicU64,
    degraded: AtomicU64,
    failures: AtomicU64,
}

impl<T: RegisterTransport> ControlWordManager<T> {
    pub fn new(client: SyncClient<T>, locks: Arc<AddressLocks>) -> Self {
        Self {
            client,
            locks,
            strategy: BitWriteStrategy::default(),
            budget: Duration::from_millis(DEFAULT_MASKED_BUDGET_MS),
            masked_share: DEFAULT_MASKED_SHARE,
            logger: CallbackLogger::default(),
            updates: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_strategy(mut self, strategy: BitWriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Overall bound of one update, all phases included
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Share of the budget given to the masked attempt
    pub fn with_masked_share(mut self, share: f64) -> Self {
        self.masked_share = share;
        self
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn strategy(&self) -> BitWriteStrategy {
        self.strategy
    }

    pub fn locks(&self) -> &Arc<AddressLocks> {
        &self.locks
    }

    pub fn client(&self) -> &SyncClient<T> {
        &self.client
    }

    pub fn stats(&self) -> BitUpdateStats {
        BitUpdateStats {
            updates: self.updates.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Apply `and_mask`/`or_mask` to `address` under its lock.
    pub async fn update_bits(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<UpdatePath> {
        let _guard = self.locks.lock(address).await;
        self.update_bits_locked(address, and_mask, or_mask, self.budget)
            .await
    }

    /// Apply the masks without taking the lock. The caller must already hold
    /// the lock of `address`.
    pub async fn update_bits_locked(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
        total: Duration,
    ) -> ModbusResult<UpdatePath> {
        let result = match self.strategy {
            BitWriteStrategy::ReadModifyWrite => {
                let budget = FallbackBudget::read_modify_write(total);
                self.read_modify_write(address, and_mask, or_mask, &budget)
                    .await
                    .map(|_| UpdatePath::ReadModifyWrite)
            }
            BitWriteStrategy::MaskedWithFallback => {
                self.masked_with_fallback(address, and_mask, or_mask, total)
                    .await
            }
        };

        match &result {
            Ok(UpdatePath::Fallback) => {
                self.updates.fetch_add(1, Ordering::Relaxed);
                self.degraded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.updates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.logger.warn(&e.to_string());
            }
        }
        result
    }

    async fn masked_with_fallback(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
        total: Duration,
    ) -> ModbusResult<UpdatePath> {
        let budget = FallbackBudget::split(total, self.masked_share);

        let masked_error = match self
            .client
            .mask_write(address, and_mask, or_mask, budget.masked)
            .await
        {
            Ok(()) => return Ok(UpdatePath::Masked),
            Err(e) => e,
        };
        self.logger.debug(&format!(
            "Masked write to 0x{:04X} failed: {}",
            address, masked_error
        ));

        match self
            .read_modify_write(address, and_mask, or_mask, &budget)
            .await
        {
            Ok(value) => {
                self.logger.info(&format!(
                    "Masked write to 0x{:04X} unavailable ({}); read-modify-write fallback wrote 0x{:04X}",
                    address, masked_error, value
                ));
                Ok(UpdatePath::Fallback)
            }
            Err(fallback_error) => Err(ModbusError::BitUpdate {
                address,
                masked: masked_error.to_string(),
                fallback: fallback_error.to_string(),
            }),
        }
    }

    /// Returns the value written.
    async fn read_modify_write(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
        budget: &FallbackBudget,
    ) -> ModbusResult<u16> {
        let current = self
            .client
            .read_register(address, budget.fallback_read)
            .await?;
        let value = apply_masks(current, and_mask, or_mask);
        self.client
            .write_register(address, value, budget.fallback_write)
            .await?;
        Ok(value)
    }

    /// Set or clear one bit of the single-axis control word
    pub async fn set_bit(&self, bit: u8, value: bool) -> ModbusResult<UpdatePath> {
        if bit > 15 {
            return Err(ModbusError::invalid_data(format!(
                "Bit index {} outside 0..=15",
                bit
            )));
        }
        let (and_mask, or_mask) = bit_masks(bit, value);
        self.update_bits(single_axis::CONTROL_WORD, and_mask, or_mask)
            .await
    }

    pub async fn set_control_bit(&self, bit: ControlBit, value: bool) -> ModbusResult<UpdatePath> {
        self.set_bit(bit.position(), value).await
    }

    pub async fn set_enable(&self, enable: bool) -> ModbusResult<UpdatePath> {
        self.set_control_bit(ControlBit::Enable, enable).await
    }

    /// `true` selects automatic mode
    pub async fn set_run_mode(&self, automatic: bool) -> ModbusResult<UpdatePath> {
        self.set_control_bit(ControlBit::RunMode, automatic).await
    }

    pub async fn set_manual_allow(&self, allow: bool) -> ModbusResult<UpdatePath> {
        self.set_control_bit(ControlBit::ManualAllow, allow).await
    }

    pub async fn set_auto_run(&self, run: bool) -> ModbusResult<UpdatePath> {
        self.set_control_bit(ControlBit::AutoRun, run).await
    }

    /// Drive the jog bits. The opposite direction is always cleared before
    /// the requested one is set; if that clear fails nothing is set.
    /// `Stop` tries to clear both bits even if the first clear fails.
    pub async fn jog(&self, direction: JogDirection) -> ModbusResult<()> {
        match direction {
            JogDirection::Left => {
                self.set_control_bit(ControlBit::JogRight, false).await?;
                self.set_control_bit(ControlBit::JogLeft, true).await?;
            }
            JogDirection::Right => {
                self.set_control_bit(ControlBit::JogLeft, false).await?;
                self.set_control_bit(ControlBit::JogRight, true).await?;
            }
            JogDirection::Stop => {
                let left = self.set_control_bit(ControlBit::JogLeft, false).await;
                let right = self.set_control_bit(ControlBit::JogRight, false).await;
                left?;
                right?;
            }
        }
        Ok(())
    }

    /// Current control word, read from the controller
    pub async fn read_control_word(&self, limit: Duration) -> ModbusResult<u16> {
        self.client
            .read_register(single_axis::CONTROL_WORD, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;
    use crate::test_support::SimulatedDevice;
    use proptest::prelude::*;

    const CONTROL: u16 = single_axis::CONTROL_WORD;

    fn manager(device: &Arc<SimulatedDevice>) -> ControlWordManager<SimulatedDevice> {
        ControlWordManager::new(SyncClient::new(device.clone()), Arc::new(AddressLocks::new()))
            .with_budget(Duration::from_millis(1000))
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_bit_masks() {
        assert_eq!(bit_masks(3, true), (0xFFF7, 0x0008));
        assert_eq!(bit_masks(3, false), (0xFFF7, 0x0000));
        assert_eq!(bit_masks(15, true), (0x7FFF, 0x8000));
        assert_eq!(apply_masks(0x00F0, 0xFFF7, 0x0008), 0x00F8);
        assert_eq!(apply_masks(0x00F8, 0xFFF7, 0x0000), 0x00F0);
    }

    #[test]
    fn test_jog_codes() {
        assert_eq!(JogDirection::from_code(1), JogDirection::Left);
        assert_eq!(JogDirection::from_code(2), JogDirection::Right);
        assert_eq!(JogDirection::from_code(0), JogDirection::Stop);
        assert_eq!(JogDirection::from_code(7), JogDirection::Stop);
        assert_eq!(JogDirection::Right as u8, 2);
    }

    #[tokio::test]
    async fn test_masked_path_used_when_supported() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_register(CONTROL, 0x8001);
        let manager = manager(&device);

        let path = manager.set_control_bit(ControlBit::AutoRun, true).await.unwrap();
        assert_eq!(path, UpdatePath::Masked);
        assert_eq!(device.register(CONTROL), 0x8021);
        assert_eq!(device.request_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_when_rejected() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_register(CONTROL, 0x8001);
        device.set_mask_write_supported(false);
        let manager = manager(&device);

        let path = manager.set_enable(false).await.unwrap();
        assert_eq!(path, UpdatePath::Fallback);
        assert_eq!(device.register(CONTROL), 0x8000);
        assert_eq!(manager.stats().degraded, 1);

        let functions: Vec<_> = device.requests().iter().map(|r| r.function).collect();
        assert_eq!(
            functions,
            vec![
                ModbusFunction::MaskWriteRegister,
                ModbusFunction::ReadHoldingRegisters,
                ModbusFunction::WriteSingleRegister,
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_after_masked_timeout() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_mask_write_hang(true);
        let manager = manager(&device);

        let path = manager.set_manual_allow(true).await.unwrap();
        assert_eq!(path, UpdatePath::Fallback);
        assert_eq!(device.register(CONTROL), 0x0004);
    }

    #[tokio::test]
    async fn test_both_paths_fail() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_mask_write_supported(false);
        device.set_fail_reads(true);
        let manager = manager(&device);

        let err = manager.set_enable(true).await.unwrap_err();
        match &err {
            ModbusError::BitUpdate {
                address,
                masked,
                fallback,
            } => {
                assert_eq!(*address, CONTROL);
                assert!(masked.contains("illegal function"));
                assert!(fallback.contains("server device failure"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(manager.stats().failures, 1);
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_modify_write_strategy() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_register(CONTROL, 0x0010);
        let manager = manager(&device).with_strategy(BitWriteStrategy::ReadModifyWrite);

        let path = manager.set_run_mode(true).await.unwrap();
        assert_eq!(path, UpdatePath::ReadModifyWrite);
        assert_eq!(device.register(CONTROL), 0x0012);
        assert!(device
            .requests()
            .iter()
            .all(|r| r.function != ModbusFunction::MaskWriteRegister));
    }

    #[tokio::test]
    async fn test_jog_left_clears_right_first() {
        let device = Arc::new(SimulatedDevice::new());
        let initial = 0x8000 | ControlBit::JogRight.mask() | ControlBit::Enable.mask();
        device.set_register(CONTROL, initial);
        let manager = manager(&device);

        manager.jog(JogDirection::Left).await.unwrap();
        let word = device.register(CONTROL);
        assert_eq!(word & ControlBit::JogLeft.mask(), ControlBit::JogLeft.mask());
        assert_eq!(word & ControlBit::JogRight.mask(), 0);
        assert_eq!(word, 0x8000 | ControlBit::Enable.mask() | ControlBit::JogLeft.mask());

        // The clear went out before the set.
        let writes = device.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data[1], 0);
        assert_eq!(writes[1].data[1], ControlBit::JogLeft.mask());
    }

    #[tokio::test]
    async fn test_jog_aborts_when_clear_fails() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_register(CONTROL, ControlBit::JogLeft.mask());
        device.fail_writes_at(Some(CONTROL));
        let manager = manager(&device);

        assert!(manager.jog(JogDirection::Right).await.is_err());
        // Clearing the left bit failed on both paths, so the right bit was never set.
        assert_eq!(device.register(CONTROL), ControlBit::JogLeft.mask());
        assert_eq!(manager.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_jog_stop_clears_both() {
        let device = Arc::new(SimulatedDevice::new());
        device.set_register(CONTROL, 0x0019);
        let manager = manager(&device);

        manager.jog(JogDirection::Stop).await.unwrap();
        assert_eq!(device.register(CONTROL), 0x0001);
    }

    #[tokio::test]
    async fn test_invalid_bit() {
        let device = Arc::new(SimulatedDevice::new());
        let manager = manager(&device);
        let err = manager.set_bit(16, true).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
        assert_eq!(device.request_count(), 0);
    }

    #[tokio::test]
    async fn test_try_lock_reports_held() {
        let locks = AddressLocks::new();
        let guard = locks.lock(CONTROL).await;
        assert!(locks.try_lock(CONTROL).is_none());
        // Other addresses are independent.
        assert!(locks.try_lock(0x0100).is_some());
        drop(guard);
        assert!(locks.try_lock(CONTROL).is_some());
    }

    proptest! {
        #[test]
        fn prop_set_then_clear_restores_other_bits(initial in any::<u16>(), bit in 0u8..16) {
            let device = Arc::new(SimulatedDevice::new());
            device.set_register(CONTROL, initial);
            let manager = manager(&device);

            runtime().block_on(async {
                manager.set_bit(bit, true).await.unwrap();
                manager.set_bit(bit, false).await.unwrap();
            });
            prop_assert_eq!(device.register(CONTROL), initial & !(1u16 << bit));
        }

        #[test]
        fn prop_fallback_matches_masked(initial in any::<u16>(), bit in 0u8..16, value in any::<bool>()) {
            let masked = Arc::new(SimulatedDevice::new());
            let fallback = Arc::new(SimulatedDevice::new());
            masked.set_register(CONTROL, initial);
            fallback.set_register(CONTROL, initial);
            fallback.set_mask_write_supported(false);

            let rt = runtime();
            let masked_path = rt.block_on(manager(&masked).set_bit(bit, value)).unwrap();
            let fallback_path = rt.block_on(manager(&fallback).set_bit(bit, value)).unwrap();

            prop_assert_eq!(masked_path, UpdatePath::Masked);
            prop_assert_eq!(fallback_path, UpdatePath::Fallback);
            prop_assert_eq!(masked.register(CONTROL), fallback.register(CONTROL));
        }
    }
}
