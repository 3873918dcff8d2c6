//! # Register packing
//!
//! The mover controller stores 32-bit values in two consecutive holding
//! registers with the **low word at the lower address**, and packs pairs of
//! 8-bit fields into one register as `(high << 8) | low`.
//!
//! For the 32-bit value `0x0001_86A0` (100 000) the registers hold
//! \[0x86A0, 0x0001\].

// ============================================================================
// 32-bit values
// ============================================================================

/// Split a 32-bit value into two registers, low word first.
///
/// ```rust
/// use mover_link::{pack32, unpack32};
///
/// let regs = pack32(100_000);
/// assert_eq!(regs, [0x86A0, 0x0001]);
/// assert_eq!(unpack32(regs), 100_000);
/// ```
#[inline]
pub fn pack32(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Join two registers, low word first, into `(high << 16) | low`.
#[inline]
pub fn unpack32(regs: [u16; 2]) -> u32 {
    (u32::from(regs[1]) << 16) | u32::from(regs[0])
}

/// Signed variant of [`pack32`].
#[inline]
pub fn pack_i32(value: i32) -> [u16; 2] {
    pack32(value as u32)
}

/// Signed variant of [`unpack32`].
#[inline]
pub fn unpack_i32(regs: [u16; 2]) -> i32 {
    unpack32(regs) as i32
}

/// Read a signed 32-bit value stored low word first at `offset` in `block`.
#[inline]
pub fn i32_at(block: &[u16], offset: usize) -> Option<i32> {
    let pair = block.get(offset..offset + 2)?;
    Some(unpack_i32([pair[0], pair[1]]))
}

// ============================================================================
// Scaled engineering values
// ============================================================================

/// Convert raw sub-unit counts to engineering units.
#[inline]
pub fn from_scaled(raw: i32, scale: f64) -> f64 {
    f64::from(raw) / scale
}

/// Convert engineering units to raw counts, rounding to the nearest count.
///
/// Returns `None` if the result does not fit in 32 bits.
#[inline]
pub fn to_scaled(value: f64, scale: f64) -> Option<i32> {
    let raw = (value * scale).round();
    if raw.is_finite() && raw >= f64::from(i32::MIN) && raw <= f64::from(i32::MAX) {
        Some(raw as i32)
    } else {
        None
    }
}

// ============================================================================
// 8-bit field pairs
// ============================================================================

/// Combine two 8-bit fields into one register: `(high << 8) | low`.
#[inline]
pub fn pack_bytes(low: u8, high: u8) -> u16 {
    (u16::from(high) << 8) | u16::from(low)
}

/// Split a register into its `(low, high)` bytes.
#[inline]
pub fn unpack_bytes(value: u16) -> (u8, u8) {
    ((value & 0xFF) as u8, (value >> 8) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_low_word_first() {
        assert_eq!(pack32(0x1234_5678), [0x5678, 0x1234]);
        assert_eq!(unpack32([0x5678, 0x1234]), 0x1234_5678);
        assert_eq!(pack_i32(-1), [0xFFFF, 0xFFFF]);
        assert_eq!(pack_i32(-2), [0xFFFE, 0xFFFF]);
        assert_eq!(unpack_i32([0xFC18, 0xFFFF]), -1000);
    }

    #[test]
    fn test_i32_at() {
        let block = [0u16, 0x86A0, 0x0001, 7];
        assert_eq!(i32_at(&block, 1), Some(100_000));
        assert_eq!(i32_at(&block, 3), None);
    }

    #[test]
    fn test_scaling() {
        assert_eq!(from_scaled(125_500, 1000.0), 125.5);
        assert_eq!(from_scaled(-2_000, 1000.0), -2.0);
        assert_eq!(to_scaled(125.5, 1000.0), Some(125_500));
        assert_eq!(to_scaled(-0.0004, 1000.0), Some(0));
        assert_eq!(to_scaled(3.0e7, 1000.0), None);
        assert_eq!(to_scaled(f64::NAN, 1000.0), None);
    }

    #[test]
    fn test_pack_bytes() {
        assert_eq!(pack_bytes(0x03, 0x01), 0x0103);
        assert_eq!(unpack_bytes(0x0103), (0x03, 0x01));
        assert_eq!(pack_bytes(0xFF, 0x00), 0x00FF);
    }

    proptest! {
        #[test]
        fn prop_pack32_round_trip(value: u32) {
            prop_assert_eq!(unpack32(pack32(value)), value);
        }

        #[test]
        fn prop_pack_i32_round_trip(value: i32) {
            prop_assert_eq!(unpack_i32(pack_i32(value)), value);
        }

        #[test]
        fn prop_pack_bytes_round_trip(low: u8, high: u8) {
            prop_assert_eq!(unpack_bytes(pack_bytes(low, high)), (low, high));
        }
    }
}
