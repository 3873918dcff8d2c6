//! Modbus application-layer messages
//!
//! [`ModbusRequest`] and [`ModbusResponse`] are transport independent; the TCP
//! transport wraps them in an MBAP header and correlates replies by
//! transaction id.

use std::fmt;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;

/// Modbus unit identifier.
pub type SlaveId = u8;

/// Function codes spoken by the mover controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadHoldingRegisters,
    WriteSingleRegister,
    WriteMultipleRegisters,
    MaskWriteRegister,
}

impl ModbusFunction {
    /// Wire value of the function code
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
            Self::MaskWriteRegister => FC_MASK_WRITE_REGISTER,
        }
    }

    /// Parse a function code, with the exception flag stripped
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code & !EXCEPTION_FLAG {
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            FC_MASK_WRITE_REGISTER => Ok(Self::MaskWriteRegister),
            _ => Err(ModbusError::invalid_function(code)),
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Self::ReadHoldingRegisters)
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ModbusPdu::function_code_description(self.to_u8()))
    }
}

/// One request to the controller.
///
/// `quantity` is the register count for reads and writes. For a mask write it
/// is unused and `data` carries the AND and OR masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u16>,
}

impl ModbusRequest {
    /// FC03 request
    pub fn read_holding(slave_id: SlaveId, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::ReadHoldingRegisters,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// FC06 for a single value, FC16 otherwise
    pub fn write_registers(slave_id: SlaveId, address: u16, values: &[u16]) -> Self {
        let function = if values.len() == 1 {
            ModbusFunction::WriteSingleRegister
        } else {
            ModbusFunction::WriteMultipleRegisters
        };
        Self {
            slave_id,
            function,
            address,
            quantity: values.len() as u16,
            data: values.to_vec(),
        }
    }

    /// FC22 request: `new = (current & and_mask) | (or_mask & !and_mask)`
    pub fn mask_write(slave_id: SlaveId, address: u16, and_mask: u16, or_mask: u16) -> Self {
        Self {
            slave_id,
            function: ModbusFunction::MaskWriteRegister,
            address,
            quantity: 1,
            data: vec![and_mask, or_mask],
        }
    }

    /// Check register range and quantity limits.
    pub fn validate(&self) -> ModbusResult<()> {
        let max = match self.function {
            ModbusFunction::ReadHoldingRegisters => MAX_READ_REGISTERS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleRegister | ModbusFunction::MaskWriteRegister => 1,
        };
        if self.quantity == 0 || self.quantity as usize > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity {} for {} (1..={})",
                self.quantity, self.function, max
            )));
        }
        let last = u32::from(self.address) + u32::from(self.quantity) - 1;
        if last > u32::from(u16::MAX) {
            return Err(ModbusError::invalid_data(format!(
                "Register range 0x{:04X}+{} exceeds address space",
                self.address, self.quantity
            )));
        }
        match self.function {
            ModbusFunction::ReadHoldingRegisters => Ok(()),
            ModbusFunction::MaskWriteRegister if self.data.len() != 2 => Err(
                ModbusError::invalid_data("Mask write needs exactly an AND and an OR mask"),
            ),
            ModbusFunction::MaskWriteRegister => Ok(()),
            _ if self.data.len() != self.quantity as usize => Err(ModbusError::invalid_data(
                format!(
                    "Write quantity {} does not match {} values",
                    self.quantity,
                    self.data.len()
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Encode the request PDU.
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        self.validate()?;
        Ok(match self.function {
            ModbusFunction::ReadHoldingRegisters => {
                ModbusPdu::read_holding(self.address, self.quantity)
            }
            ModbusFunction::WriteSingleRegister => {
                ModbusPdu::write_single(self.address, self.data[0])
            }
            ModbusFunction::WriteMultipleRegisters => {
                ModbusPdu::write_multiple(self.address, &self.data)?
            }
            ModbusFunction::MaskWriteRegister => {
                ModbusPdu::mask_write(self.address, self.data[0], self.data[1])
            }
        })
    }
}

/// A decoded reply PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    data: Vec<u8>,
    exception: Option<u8>,
}

impl ModbusResponse {
    /// Successful response with raw PDU payload (function code stripped)
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    /// Exception response
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(code),
        }
    }

    /// Decode from a unit id and the PDU that followed it on the wire.
    pub fn from_pdu(slave_id: SlaveId, pdu: &ModbusPdu) -> ModbusResult<Self> {
        let fc = pdu
            .function_code()
            .ok_or_else(|| ModbusError::protocol("Empty response PDU"))?;
        let function = ModbusFunction::from_u8(fc)?;
        if pdu.is_exception() {
            let code = pdu
                .exception_code()
                .ok_or_else(|| ModbusError::protocol("Exception response without code"))?;
            return Ok(Self::new_exception(slave_id, function, code));
        }
        Ok(Self::new_success(
            slave_id,
            function,
            pdu.payload().to_vec(),
        ))
    }

    /// Payload after the function code
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Exception code, if this is an exception response
    pub fn exception_code(&self) -> Option<u8> {
        self.exception
    }

    /// Turn an exception response into an error
    pub fn into_result(self) -> ModbusResult<Self> {
        match self.exception {
            Some(code) => Err(ModbusError::exception(
                self.function.to_u8() | EXCEPTION_FLAG,
                code,
            )),
            None => Ok(self),
        }
    }

    /// Register values of an FC03 reply
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if self.function != ModbusFunction::ReadHoldingRegisters {
            return Err(ModbusError::protocol(format!(
                "{} reply carries no register data",
                self.function
            )));
        }
        let (&byte_count, payload) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::protocol("Read reply without byte count"))?;
        let byte_count = byte_count as usize;
        if byte_count % 2 != 0 || payload.len() < byte_count {
            return Err(ModbusError::protocol(format!(
                "Read reply byte count {} does not match payload of {} bytes",
                byte_count,
                payload.len()
            )));
        }
        Ok(payload[..byte_count]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Register values of an FC03 reply that must carry exactly `count`
    /// registers. Extra or missing words would shift every record decoded
    /// from the reply.
    pub fn parse_registers_exact(&self, count: u16) -> ModbusResult<Vec<u16>> {
        let values = self.parse_registers()?;
        if values.len() != usize::from(count) || self.data.len() != values.len() * 2 + 1 {
            return Err(ModbusError::protocol(format!(
                "Read reply carries {} registers, requested {}",
                values.len(),
                count
            )));
        }
        Ok(values)
    }

    /// Check that a reply matches the request it answers: the register
    /// count for reads, the echo for writes.
    pub fn verify_echo(&self, request: &ModbusRequest) -> ModbusResult<()> {
        let expected: Vec<u16> = match request.function {
            ModbusFunction::ReadHoldingRegisters => {
                return self.parse_registers_exact(request.quantity).map(|_| ())
            }
            ModbusFunction::WriteSingleRegister => vec![request.address, request.data[0]],
            ModbusFunction::WriteMultipleRegisters => vec![request.address, request.quantity],
            ModbusFunction::MaskWriteRegister => {
                vec![request.address, request.data[0], request.data[1]]
            }
        };
        let echoed: Vec<u16> = self
            .data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        if echoed != expected {
            return Err(ModbusError::protocol(format!(
                "{} reply {:04X?} does not echo request {:04X?}",
                request.function, echoed, expected
            )));
        }
        Ok(())
    }
}
