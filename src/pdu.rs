//! Modbus PDU buffer
//!
//! A PDU is at most 253 bytes and lives in a fixed array. Requests are built
//! through one constructor per holding-register function; replies are
//! wrapped as received and inspected through the accessors.

use tracing::trace;

use crate::constants::{
    EXCEPTION_FLAG, FC_MASK_WRITE_REGISTER, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// Function code followed by its payload.
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    fn with_function(function: u8) -> Self {
        let mut data = [0; MAX_PDU_SIZE];
        data[0] = function;
        Self { data, len: 1 }
    }

    /// Wrap a PDU read off the wire.
    pub fn from_slice(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                bytes.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut data = [0; MAX_PDU_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        let pdu = Self {
            data,
            len: bytes.len(),
        };
        trace!("PDU in: {:?}", pdu);
        Ok(pdu)
    }

    // Callers size every request below MAX_PDU_SIZE before pushing.
    fn put_u16(&mut self, value: u16) {
        self.data[self.len..self.len + 2].copy_from_slice(&value.to_be_bytes());
        self.len += 2;
    }

    /// FC03 request.
    pub fn read_holding(address: u16, quantity: u16) -> Self {
        let mut pdu = Self::with_function(FC_READ_HOLDING_REGISTERS);
        pdu.put_u16(address);
        pdu.put_u16(quantity);
        pdu
    }

    /// FC06 request.
    pub fn write_single(address: u16, value: u16) -> Self {
        let mut pdu = Self::with_function(FC_WRITE_SINGLE_REGISTER);
        pdu.put_u16(address);
        pdu.put_u16(value);
        pdu
    }

    /// FC16 request. Fails above 123 values.
    pub fn write_multiple(address: u16, values: &[u16]) -> ModbusResult<Self> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "Cannot write {} registers in one request",
                values.len()
            )));
        }
        let mut pdu = Self::with_function(FC_WRITE_MULTIPLE_REGISTERS);
        pdu.put_u16(address);
        pdu.put_u16(values.len() as u16);
        pdu.data[pdu.len] = (values.len() * 2) as u8;
        pdu.len += 1;
        for &value in values {
            pdu.put_u16(value);
        }
        Ok(pdu)
    }

    /// FC22 request: `(current & and_mask) | (or_mask & !and_mask)`.
    pub fn mask_write(address: u16, and_mask: u16, or_mask: u16) -> Self {
        let mut pdu = Self::with_function(FC_MASK_WRITE_REGISTER);
        pdu.put_u16(address);
        pdu.put_u16(and_mask);
        pdu.put_u16(or_mask);
        pdu
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }

    /// Payload after the function code.
    pub fn payload(&self) -> &[u8] {
        self.as_slice().get(1..).unwrap_or_default()
    }

    /// Name of a function code, exception flag ignored.
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
            FC_MASK_WRITE_REGISTER => "Mask Write Register",
            _ => "Unknown Function",
        }
    }
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.function_code() {
            Some(fc) => write!(
                f,
                "{} {:02X?}",
                Self::function_code_description(fc),
                self.as_slice()
            ),
            None => f.write_str("empty PDU"),
        }
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}
