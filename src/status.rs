//! # Status decoding
//!
//! Each mover reports a fixed block of [`mover_status::STRIDE`] registers
//! starting at [`mover_status::BASE`]:
//!
//! | Offset | Content |
//! |---|---|
//! | 0-1 | position, 32-bit, low word first, µm |
//! | 2-3 | velocity, 32-bit, low word first, µm/s |
//! | 4 | status word |
//! | 5 | error code |
//! | 8-9 | target position, 32-bit, low word first, µm |
//!
//! Status word precedence: emergency stop overrides error, error overrides
//! running / in-position / ready.
//!
//! A read that returns fewer registers than the configured movers need is
//! rejected whole; the previous snapshot stays in place.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bytes::{from_scaled, i32_at};
use crate::error::{ModbusError, ModbusResult};
use crate::register_map::{mover_status, system_status};

/// Decoded state of one mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum MoverState {
    #[default]
    Disabled,
    Ready,
    Running,
    /// Enabled, not moving, at its target.
    Stopped,
    Error,
    EmergencyStop,
}

impl fmt::Display for MoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::EmergencyStop => "emergency stop",
        };
        f.write_str(name)
    }
}

/// Apply the status word precedence rules.
pub fn decode_state(status_word: u16) -> MoverState {
    if status_word & mover_status::BIT_EMERGENCY_STOP != 0 {
        MoverState::EmergencyStop
    } else if status_word & mover_status::BIT_ERROR != 0 {
        MoverState::Error
    } else if status_word & mover_status::BIT_ENABLED == 0 {
        MoverState::Disabled
    } else if status_word & mover_status::BIT_RUNNING != 0 {
        MoverState::Running
    } else if status_word & mover_status::BIT_IN_POSITION != 0 {
        MoverState::Stopped
    } else {
        MoverState::Ready
    }
}

/// Operator text for a controller error code; empty for 0.
pub fn error_message(code: u16) -> String {
    match code {
        0 => String::new(),
        1 => "position over-limit".to_string(),
        2 => "speed over-limit".to_string(),
        3 => "communication timeout".to_string(),
        4 => "collision".to_string(),
        other => format!("unknown error (code {})", other),
    }
}

/// One mover as last reported by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoverStatusRecord {
    pub id: u16,
    /// mm
    pub position: f64,
    /// mm/s
    pub velocity: f64,
    /// mm
    pub target: f64,
    pub state: MoverState,
    pub enabled: bool,
    pub in_position: bool,
    pub has_error: bool,
    pub error_code: u16,
    pub error_message: String,
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl MoverStatusRecord {
    /// Placeholder for a mover that has not been read yet.
    pub fn unknown(id: u16) -> Self {
        Self {
            id,
            position: 0.0,
            velocity: 0.0,
            target: 0.0,
            state: MoverState::Disabled,
            enabled: false,
            in_position: false,
            has_error: false,
            error_code: 0,
            error_message: String::new(),
            connected: false,
            last_update: None,
        }
    }

    /// Decode one mover block. `block` must hold at least one full stride.
    pub fn decode(id: u16, block: &[u16], now: DateTime<Utc>) -> ModbusResult<Self> {
        let stride = mover_status::STRIDE as usize;
        if block.len() < stride {
            return Err(ModbusError::invalid_data(format!(
                "Mover {} status block has {} registers, expected {}",
                id,
                block.len(),
                stride
            )));
        }
        let scaled = |offset: u16| {
            i32_at(block, offset as usize)
                .map(|raw| from_scaled(raw, mover_status::SCALE))
                .unwrap_or_default()
        };

        let status_word = block[mover_status::STATUS_WORD as usize];
        let error_code = block[mover_status::ERROR_CODE as usize];
        let state = decode_state(status_word);
        let has_error = matches!(state, MoverState::Error | MoverState::EmergencyStop);

        Ok(Self {
            id,
            position: scaled(mover_status::POSITION_LOW),
            velocity: scaled(mover_status::VELOCITY_LOW),
            target: scaled(mover_status::TARGET_LOW),
            state,
            enabled: status_word & mover_status::BIT_ENABLED != 0,
            in_position: status_word & mover_status::BIT_IN_POSITION != 0,
            has_error,
            error_code,
            error_message: if has_error || error_code != 0 {
                error_message(error_code)
            } else {
                String::new()
            },
            connected: true,
            last_update: Some(now),
        })
    }
}

/// Track-wide flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub ready: bool,
    pub error_code: u16,
    pub emergency_stop: bool,
    pub mover_count: u16,
}

impl SystemStatus {
    /// Decode the block read from [`system_status::SYSTEM_READY`].
    pub fn decode(block: &[u16]) -> ModbusResult<Self> {
        if block.len() < system_status::BLOCK_LEN as usize {
            return Err(ModbusError::invalid_data(format!(
                "System status block has {} registers, expected {}",
                block.len(),
                system_status::BLOCK_LEN
            )));
        }
        let at = |address: u16| block[(address - system_status::SYSTEM_READY) as usize];
        Ok(Self {
            ready: at(system_status::SYSTEM_READY) != 0,
            error_code: at(system_status::SYSTEM_ERROR),
            emergency_stop: at(system_status::EMERGENCY_STOP) != 0,
            mover_count: at(system_status::MOVER_COUNT),
        })
    }

    pub fn error_message(&self) -> String {
        error_message(self.error_code)
    }
}

/// A mover whose decoded state changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub mover_id: u16,
    pub old: MoverState,
    pub new: MoverState,
}

/// Latest snapshot of every configured mover.
#[derive(Debug, Clone)]
pub struct MoverStatusTable {
    records: Vec<MoverStatusRecord>,
}

impl MoverStatusTable {
    /// Table for movers `0..axis_count`, all unknown.
    pub fn new(axis_count: u16) -> Self {
        Self {
            records: (0..axis_count).map(MoverStatusRecord::unknown).collect(),
        }
    }

    pub fn axis_count(&self) -> u16 {
        self.records.len() as u16
    }

    /// Registers needed to decode every mover in one batch.
    pub fn register_count(&self) -> u16 {
        self.axis_count().saturating_mul(mover_status::STRIDE)
    }

    pub fn records(&self) -> &[MoverStatusRecord] {
        &self.records
    }

    pub fn get(&self, id: u16) -> Option<&MoverStatusRecord> {
        self.records.get(id as usize)
    }

    /// Replace the snapshot with a batch read from [`mover_status::BASE`].
    ///
    /// Returns the movers whose state changed. A short batch is an error and
    /// leaves the table untouched.
    pub fn apply(&mut self, block: &[u16]) -> ModbusResult<Vec<StatusTransition>> {
        self.apply_at(block, Utc::now())
    }

    pub fn apply_at(
        &mut self,
        block: &[u16],
        now: DateTime<Utc>,
    ) -> ModbusResult<Vec<StatusTransition>> {
        let expected = self.register_count() as usize;
        if block.len() < expected {
            return Err(ModbusError::invalid_data(format!(
                "Status batch has {} registers, expected {} for {} movers",
                block.len(),
                expected,
                self.records.len()
            )));
        }

        let stride = mover_status::STRIDE as usize;
        let decoded = block
            .chunks_exact(stride)
            .take(self.records.len())
            .enumerate()
            .map(|(id, chunk)| MoverStatusRecord::decode(id as u16, chunk, now))
            .collect::<ModbusResult<Vec<_>>>()?;

        let transitions = self
            .records
            .iter()
            .zip(&decoded)
            .filter(|(old, new)| old.state != new.state)
            .map(|(old, new)| StatusTransition {
                mover_id: new.id,
                old: old.state,
                new: new.state,
            })
            .collect();
        self.records = decoded;
        Ok(transitions)
    }

    /// Flag every mover as not connected, keeping the last values.
    pub fn mark_disconnected(&mut self) {
        for record in &mut self.records {
            record.connected = false;
        }
    }
}
