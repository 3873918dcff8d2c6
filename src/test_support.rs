//! In-memory controller used by the unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::{oneshot, watch};

use crate::constants::{EXCEPTION_FLAG, EXCEPTION_ILLEGAL_FUNCTION, EXCEPTION_SERVER_DEVICE_FAILURE};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{ConnectionState, PendingReply, RegisterTransport};

type Completion = oneshot::Sender<ModbusResult<ModbusResponse>>;

/// Holding-register store answering requests like a controller would.
pub(crate) struct SimulatedDevice {
    registers: Mutex<HashMap<u16, u16>>,
    requests: Mutex<Vec<ModbusRequest>>,
    writes: Mutex<Vec<ModbusRequest>>,
    state: watch::Sender<ConnectionState>,
    mask_write_supported: AtomicBool,
    mask_write_hang: AtomicBool,
    hang: AtomicBool,
    fail_reads: AtomicBool,
    fail_write_at: Mutex<Option<u16>>,
    read_reply_len: Mutex<Option<usize>>,
    /// Replies that will never be sent while hanging.
    held: Mutex<Vec<Completion>>,
}

impl SimulatedDevice {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            registers: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            state,
            mask_write_supported: AtomicBool::new(true),
            mask_write_hang: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_write_at: Mutex::new(None),
            read_reply_len: Mutex::new(None),
            held: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, address: u16) -> u16 {
        self.registers
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub(crate) fn set_registers(&self, address: u16, values: &[u16]) {
        for (i, value) in values.iter().enumerate() {
            self.set_register(address + i as u16, *value);
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.set_state(if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Unconnected
        });
    }

    pub(crate) fn set_mask_write_supported(&self, supported: bool) {
        self.mask_write_supported.store(supported, Ordering::SeqCst);
    }

    /// Mask writes are accepted but never answered.
    pub(crate) fn set_mask_write_hang(&self, hang: bool) {
        self.mask_write_hang.store(hang, Ordering::SeqCst);
    }

    /// No request is ever answered.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Any write touching `address` gets a device-failure exception.
    pub(crate) fn fail_writes_at(&self, address: Option<u16>) {
        *self.fail_write_at.lock().unwrap() = address;
    }

    /// Read replies carry exactly `count` registers, whatever was asked.
    pub(crate) fn read_reply_len(&self, count: Option<usize>) {
        *self.read_reply_len.lock().unwrap() = count;
    }

    /// Every request received, in order
    pub(crate) fn requests(&self) -> Vec<ModbusRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Writes that changed the register store, in order
    pub(crate) fn writes(&self) -> Vec<ModbusRequest> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn clear_log(&self) {
        self.requests.lock().unwrap().clear();
        self.writes.lock().unwrap().clear();
    }

    fn exception(function: ModbusFunction, code: u8) -> ModbusResult<ModbusResponse> {
        Err(ModbusError::exception(function.to_u8() | EXCEPTION_FLAG, code))
    }

    fn write_blocked(&self, request: &ModbusRequest) -> bool {
        match *self.fail_write_at.lock().unwrap() {
            Some(addr) => {
                let end = u32::from(request.address) + u32::from(request.quantity);
                u32::from(addr) >= u32::from(request.address) && u32::from(addr) < end
            }
            None => false,
        }
    }

    fn answer(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let function = request.function;
        let slave = request.slave_id;
        match function {
            ModbusFunction::ReadHoldingRegisters => {
                if self.fail_reads.load(Ordering::SeqCst) {
                    return Self::exception(function, EXCEPTION_SERVER_DEVICE_FAILURE);
                }
                let count = self
                    .read_reply_len
                    .lock()
                    .unwrap()
                    .unwrap_or(request.quantity as usize);
                let mut data = vec![(count * 2) as u8];
                for i in 0..count {
                    let value = self.register(request.address + i as u16);
                    data.extend_from_slice(&value.to_be_bytes());
                }
                Ok(ModbusResponse::new_success(slave, function, data))
            }
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
                if self.write_blocked(request) {
                    return Self::exception(function, EXCEPTION_SERVER_DEVICE_FAILURE);
                }
                self.set_registers(request.address, &request.data);
                self.writes.lock().unwrap().push(request.clone());
                let mut data = request.address.to_be_bytes().to_vec();
                let second = if function == ModbusFunction::WriteSingleRegister {
                    request.data[0]
                } else {
                    request.quantity
                };
                data.extend_from_slice(&second.to_be_bytes());
                Ok(ModbusResponse::new_success(slave, function, data))
            }
            ModbusFunction::MaskWriteRegister => {
                if !self.mask_write_supported.load(Ordering::SeqCst) {
                    return Self::exception(function, EXCEPTION_ILLEGAL_FUNCTION);
                }
                if self.write_blocked(request) {
                    return Self::exception(function, EXCEPTION_SERVER_DEVICE_FAILURE);
                }
                let (and_mask, or_mask) = (request.data[0], request.data[1]);
                let current = self.register(request.address);
                self.set_register(request.address, (current & and_mask) | (or_mask & !and_mask));
                self.writes.lock().unwrap().push(request.clone());
                let mut data = Vec::with_capacity(6);
                for word in [request.address, and_mask, or_mask] {
                    data.extend_from_slice(&word.to_be_bytes());
                }
                Ok(ModbusResponse::new_success(slave, function, data))
            }
        }
    }

    fn handle(&self, request: ModbusRequest) -> ModbusResult<PendingReply> {
        request.validate()?;
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(ModbusError::NotConnected);
        }
        self.requests.lock().unwrap().push(request.clone());

        let hang = self.hang.load(Ordering::SeqCst)
            || (request.function == ModbusFunction::MaskWriteRegister
                && self.mask_write_hang.load(Ordering::SeqCst));
        if hang {
            let (tx, rx) = oneshot::channel();
            self.held.lock().unwrap().push(tx);
            return Ok(PendingReply::detached(request.function, request.address, rx));
        }
        Ok(PendingReply::ready(
            request.function,
            request.address,
            self.answer(&request),
        ))
    }
}

impl RegisterTransport for SimulatedDevice {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn unit_id(&self) -> SlaveId {
        1
    }

    fn submit(
        &self,
        request: ModbusRequest,
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send {
        let result = self.handle(request);
        async move { result }
    }
}
