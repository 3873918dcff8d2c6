//! # Transport client
//!
//! [`TcpTransport`] owns the single TCP connection to the controller and is
//! the only path by which bytes reach the wire.
//!
//! - Requests are written under a writer lock and registered in an in-flight
//!   table keyed by MBAP transaction id.
//! - A reader task dispatches every reply to its waiting [`PendingReply`] by
//!   transaction id. A reply whose request already timed out finds no entry
//!   and is discarded.
//! - Connection state changes are published on a `watch` channel and to
//!   every registered observer callback.
//!
//! ```rust,no_run
//! use mover_link::transport::{RegisterTransport, TcpTransport, TransportConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> mover_link::ModbusResult<()> {
//! let transport = TcpTransport::new(TransportConfig::default());
//! transport.connect("192.168.1.10", 502, 1).await?;
//!
//! let reply = transport.read_registers(100, 10).await?;
//! let registers = reply.wait(Duration::from_millis(800)).await?.parse_registers()?;
//! println!("{:?}", registers);
//!
//! transport.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_FRAME_HEADER_LEN, MBAP_PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::pdu::ModbusPdu;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

// ============================================================================
// Connection state
// ============================================================================

/// Lifecycle of the controller connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connecting,
    Connected,
    /// Transient while a graceful disconnect is in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One connection state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Callback invoked synchronously on every state transition.
pub type StateObserver = Arc<dyn Fn(StateChange) + Send + Sync>;

// ============================================================================
// Statistics
// ============================================================================

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Replies that arrived after their request was abandoned.
    pub late_replies: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    late_replies: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Register-level access to one controller.
///
/// `submit` returns as soon as the request is on the wire; the reply is
/// awaited through the returned [`PendingReply`] with a caller-chosen bound.
///
/// # Implemented By
///
/// - [`TcpTransport`] - Modbus TCP
pub trait RegisterTransport: Send + Sync + 'static {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Receiver that always holds the latest connection state
    fn subscribe_state(&self) -> watch::Receiver<ConnectionState>;

    /// Unit id attached to every request
    fn unit_id(&self) -> SlaveId;

    /// Issue one request
    fn submit(
        &self,
        request: ModbusRequest,
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Read `count` holding registers starting at `address` (FC03)
    fn read_registers(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send {
        self.submit(ModbusRequest::read_holding(self.unit_id(), address, count))
    }

    /// Write one or more contiguous registers (FC06 / FC16)
    fn write_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send {
        self.submit(ModbusRequest::write_registers(
            self.unit_id(),
            address,
            values,
        ))
    }

    /// Atomic masked update of one register (FC22); controllers may reject it
    fn send_masked_write(
        &self,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send {
        self.submit(ModbusRequest::mask_write(
            self.unit_id(),
            address,
            and_mask,
            or_mask,
        ))
    }
}

// ============================================================================
// In-flight requests
// ============================================================================

struct PendingRequest {
    request: ModbusRequest,
    deadline: Instant,
    completion: oneshot::Sender<ModbusResult<ModbusResponse>>,
}

/// Handle to one outstanding request.
///
/// Dropping it abandons the request; a reply arriving later is discarded.
pub struct PendingReply {
    transaction_id: u16,
    function: ModbusFunction,
    address: u16,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<ModbusResult<ModbusResponse>>,
    shared: Option<Arc<Shared>>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("transaction_id", &self.transaction_id)
            .field("function", &self.function)
            .field("address", &self.address)
            .finish()
    }
}

impl PendingReply {
    /// Reply handle fed by an arbitrary channel, for transports that do not
    /// track transaction ids
    pub fn detached(
        function: ModbusFunction,
        address: u16,
        rx: oneshot::Receiver<ModbusResult<ModbusResponse>>,
    ) -> Self {
        Self {
            transaction_id: 0,
            function,
            address,
            deadline: None,
            rx,
            shared: None,
        }
    }

    /// Reply handle that is already complete
    pub fn ready(
        function: ModbusFunction,
        address: u16,
        result: ModbusResult<ModbusResponse>,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        // The receiver is alive, so this cannot fail.
        let _ = tx.send(result);
        Self::detached(function, address, rx)
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn function(&self) -> ModbusFunction {
        self.function
    }

    /// Wait for the reply, for at most `limit` and never past the request
    /// deadline.
    ///
    /// On timeout the request is abandoned: the outcome on the controller is
    /// unknown and must be assumed failed.
    pub async fn wait(mut self, limit: Duration) -> ModbusResult<ModbusResponse> {
        let started = Instant::now();
        let mut deadline = started + limit;
        if let Some(request_deadline) = self.deadline {
            deadline = deadline.min(request_deadline);
        }

        match timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ModbusError::connection(format!(
                "{} 0x{:04X} dropped before completion",
                self.function, self.address
            ))),
            Err(_) => {
                if let Some(shared) = &self.shared {
                    shared.abandon(self.transaction_id);
                }
                Err(ModbusError::timeout(
                    format!("{} 0x{:04X}", self.function, self.address),
                    deadline.saturating_duration_since(started).as_millis() as u64,
                ))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.forget(self.transaction_id);
        }
    }
}

// ============================================================================
// Shared state between the client and its reader task
// ============================================================================

struct Shared {
    state: watch::Sender<ConnectionState>,
    observers: StdMutex<Vec<StateObserver>>,
    in_flight: StdMutex<HashMap<u16, PendingRequest>>,
    stats: StatsCounters,
    /// Bumped on every connect, teardown and loss so a stale reader task
    /// cannot tear down a newer connection.
    generation: AtomicU64,
    /// Write half of the current connection, tagged with its generation.
    writer: Mutex<Option<(u64, OwnedWriteHalf)>>,
    reader_task: StdMutex<Option<(u64, JoinHandle<()>)>>,
    logger: CallbackLogger,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(logger: CallbackLogger) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unconnected);
        Self {
            state,
            observers: StdMutex::new(Vec::new()),
            in_flight: StdMutex::new(HashMap::new()),
            stats: StatsCounters::default(),
            generation: AtomicU64::new(0),
            writer: Mutex::new(None),
            reader_task: StdMutex::new(None),
            logger,
        }
    }

    fn set_state(&self, new: ConnectionState) {
        let old = self.state.send_replace(new);
        if old == new {
            return;
        }
        info!("Connection state {} -> {}", old, new);
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer(StateChange { old, new });
        }
    }

    fn register(&self, transaction_id: u16, pending: PendingRequest) {
        lock(&self.in_flight).insert(transaction_id, pending);
    }

    fn abandon(&self, transaction_id: u16) {
        if lock(&self.in_flight).remove(&transaction_id).is_some() {
            StatsCounters::bump(&self.stats.timeouts, 1);
            debug!("Abandoned request tid={:04X}", transaction_id);
        }
    }

    fn forget(&self, transaction_id: u16) {
        lock(&self.in_flight).remove(&transaction_id);
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingRequest> = lock(&self.in_flight).drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!("Failing {} in-flight requests: {}", drained.len(), reason);
        }
        for pending in drained {
            StatsCounters::bump(&self.stats.errors, 1);
            let _ = pending
                .completion
                .send(Err(ModbusError::connection(reason.to_string())));
        }
    }

    fn dispatch(&self, frame: Frame) {
        let pending = lock(&self.in_flight).remove(&frame.transaction_id);
        let Some(pending) = pending else {
            StatsCounters::bump(&self.stats.late_replies, 1);
            debug!(
                "Discarding reply tid={:04X}: no request waiting for it",
                frame.transaction_id
            );
            return;
        };

        StatsCounters::bump(&self.stats.responses_received, 1);
        StatsCounters::bump(
            &self.stats.bytes_received,
            (MBAP_FRAME_HEADER_LEN + frame.pdu.len()) as u64,
        );
        self.logger
            .log_response(frame.transaction_id, frame.unit_id, frame.pdu.as_slice());

        if Instant::now() > pending.deadline {
            StatsCounters::bump(&self.stats.late_replies, 1);
            debug!(
                "Discarding reply tid={:04X}: deadline passed",
                frame.transaction_id
            );
            return;
        }

        let request = &pending.request;
        let result = ModbusResponse::from_pdu(frame.unit_id, &frame.pdu)
            .and_then(|response| {
                if response.function != request.function {
                    return Err(ModbusError::protocol(format!(
                        "Reply function {} does not match request {}",
                        response.function, request.function
                    )));
                }
                response.into_result()
            })
            .and_then(|response| {
                response.verify_echo(request)?;
                Ok(response)
            });
        if result.is_err() {
            StatsCounters::bump(&self.stats.errors, 1);
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = pending.completion.send(result);
    }

    /// Fail everything in flight and release the socket of connection
    /// `generation`. Only the first report for a connection has any effect.
    async fn connection_lost(&self, generation: u64, reason: &str) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        warn!("Connection lost: {}", reason);
        self.logger.warn(&format!("Connection lost: {}", reason));
        self.fail_all(reason);
        self.set_state(ConnectionState::Unconnected);

        {
            let mut writer = self.writer.lock().await;
            if writer.as_ref().is_some_and(|(owner, _)| *owner == generation) {
                *writer = None;
            }
        }
        // Last, since the caller may be the reader task itself.
        let mut reader = lock(&self.reader_task);
        if reader.as_ref().is_some_and(|(owner, _)| *owner == generation) {
            if let Some((_, task)) = reader.take() {
                task.abort();
            }
        }
    }
}

// ============================================================================
// MBAP framing
// ============================================================================

/// One decoded MBAP frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    pub pdu: ModbusPdu,
}

/// Wrap a PDU in an MBAP header.
pub fn encode_frame(transaction_id: u16, unit_id: SlaveId, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_FRAME_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MBAP_PROTOCOL_ID);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame
}

/// Parse an MBAP header, returning `(transaction_id, unit_id, pdu_len)`.
pub fn decode_header(header: &[u8; MBAP_FRAME_HEADER_LEN]) -> ModbusResult<(u16, SlaveId, usize)> {
    let mut buf = &header[..];
    let transaction_id = buf.get_u16();
    let protocol_id = buf.get_u16();
    let length = buf.get_u16() as usize;
    let unit_id = buf.get_u8();

    if protocol_id != MBAP_PROTOCOL_ID {
        return Err(ModbusError::protocol(format!(
            "Unexpected protocol id {}",
            protocol_id
        )));
    }
    // Length counts the unit id plus a PDU of at least function code + 1 byte.
    if !(3..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(ModbusError::protocol(format!(
            "Invalid MBAP length {}",
            length
        )));
    }
    Ok((transaction_id, unit_id, length - 1))
}

async fn read_frame(reader: &mut OwnedReadHalf) -> ModbusResult<Frame> {
    let mut header = [0u8; MBAP_FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ModbusError::connection("Connection closed by controller")
        } else {
            ModbusError::connection(format!("Read failed: {}", e))
        }
    })?;
    let (transaction_id, unit_id, pdu_len) = decode_header(&header)?;

    let mut body = vec![0u8; pdu_len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ModbusError::connection(format!("Read failed: {}", e)))?;

    Ok(Frame {
        transaction_id,
        unit_id,
        pdu: ModbusPdu::from_slice(&body)?,
    })
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, generation: u64) {
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(frame) => shared.dispatch(frame),
            // A bad header leaves the stream unsynchronised, so it ends the
            // connection like any I/O error.
            Err(e) => break e.to_string(),
        }
    };
    shared.connection_lost(generation, &reason).await;
}

// ============================================================================
// TCP transport
// ============================================================================

/// Timeouts of the TCP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound on establishing the socket.
    pub connect_timeout: Duration,
    /// Hard deadline of every request; waits are capped by it.
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            request_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Modbus TCP transport with transaction-id correlation.
pub struct TcpTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    /// Serialises connect and disconnect.
    lifecycle: Mutex<()>,
    next_tid: AtomicU16,
    unit_id: AtomicU8,
    peer: StdMutex<Option<String>>,
}

impl TcpTransport {
    /// Create an unconnected transport
    pub fn new(config: TransportConfig) -> Self {
        Self::with_logger(config, CallbackLogger::default())
    }

    /// Create an unconnected transport with an injected logger
    pub fn with_logger(config: TransportConfig, logger: CallbackLogger) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new(logger)),
            lifecycle: Mutex::new(()),
            next_tid: AtomicU16::new(1),
            unit_id: AtomicU8::new(1),
            peer: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register a callback for every connection state transition
    pub fn add_state_observer(&self, observer: StateObserver) {
        lock(&self.shared.observers).push(observer);
    }

    /// Open the connection, tearing down any existing one first.
    ///
    /// Moves the state through `Connecting` to `Connected`, or back to
    /// `Unconnected` with the socket error on failure.
    pub async fn connect(&self, host: &str, port: u16, unit_id: SlaveId) -> ModbusResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state() != ConnectionState::Unconnected {
            self.shared.set_state(ConnectionState::Closing);
        }
        self.teardown("reconnect requested").await;
        self.shared.set_state(ConnectionState::Unconnected);

        self.unit_id.store(unit_id, Ordering::Relaxed);
        let address = format!("{}:{}", host, port);
        self.shared.set_state(ConnectionState::Connecting);
        info!("Connecting to {} (unit {})", address, unit_id);

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Unconnected);
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    address, e
                )));
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Unconnected);
                return Err(ModbusError::timeout(
                    format!("connect to {}", address),
                    self.config.connect_timeout.as_millis() as u64,
                ));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not applied: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.writer.lock().await = Some((generation, writer));
        let task = tokio::spawn(read_loop(self.shared.clone(), reader, generation));
        *lock(&self.shared.reader_task) = Some((generation, task));
        *lock(&self.peer) = Some(address.clone());

        if self.shared.generation.load(Ordering::SeqCst) != generation {
            return Err(ModbusError::connection(format!(
                "Connection to {} closed during setup",
                address
            )));
        }
        self.shared.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Close the connection; in-flight requests fail. Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Unconnected && self.shared.writer.lock().await.is_none()
        {
            return;
        }
        self.shared.set_state(ConnectionState::Closing);
        self.teardown("disconnected").await;
        self.shared.set_state(ConnectionState::Unconnected);
    }

    async fn teardown(&self, reason: &str) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some((_, task)) = lock(&self.shared.reader_task).take() {
            task.abort();
        }
        if let Some((_, mut writer)) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.fail_all(reason);
    }

    fn next_transaction_id(&self) -> u16 {
        loop {
            let id = self.next_tid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    /// `"TCP: host:port | unit: N"`, or `"not connected"`
    pub fn connection_info(&self) -> String {
        match (&*lock(&self.peer), self.state()) {
            (Some(peer), ConnectionState::Connected) => {
                format!("TCP: {} | unit: {}", peer, self.unit_id())
            }
            _ => "not connected".to_string(),
        }
    }

    async fn send(&self, request: ModbusRequest) -> ModbusResult<PendingReply> {
        let pdu = request.to_pdu()?;
        if self.state() != ConnectionState::Connected {
            return Err(ModbusError::NotConnected);
        }

        let mut writer = self.shared.writer.lock().await;
        let (generation, stream) = match writer.as_mut() {
            Some((generation, stream)) => (*generation, stream),
            None => return Err(ModbusError::NotConnected),
        };

        let transaction_id = self.next_transaction_id();
        let frame = encode_frame(transaction_id, request.slave_id, pdu.as_slice());
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.config.request_timeout;
        let function = request.function;
        let address = request.address;
        self.shared.register(
            transaction_id,
            PendingRequest {
                request,
                deadline,
                completion: tx,
            },
        );
        self.shared
            .logger
            .log_request(transaction_id, self.unit_id(), pdu.as_slice());

        let failure = match timeout(self.config.request_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(ModbusError::connection(format!("Write failed: {}", e))),
            Err(_) => Some(ModbusError::timeout(
                "send request",
                self.config.request_timeout.as_millis() as u64,
            )),
        };
        if let Some(error) = failure {
            drop(writer);
            lock(&self.shared.in_flight).remove(&transaction_id);
            StatsCounters::bump(&self.shared.stats.errors, 1);
            self.shared
                .connection_lost(generation, &error.to_string())
                .await;
            return Err(error);
        }

        StatsCounters::bump(&self.shared.stats.requests_sent, 1);
        StatsCounters::bump(&self.shared.stats.bytes_sent, frame.len() as u64);

        Ok(PendingReply {
            transaction_id,
            function,
            address,
            deadline: Some(deadline),
            rx,
            shared: Some(self.shared.clone()),
        })
    }
}

impl RegisterTransport for TcpTransport {
    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    fn unit_id(&self) -> SlaveId {
        self.unit_id.load(Ordering::Relaxed)
    }

    fn submit(
        &self,
        request: ModbusRequest,
    ) -> impl Future<Output = ModbusResult<PendingReply>> + Send {
        self.send(request)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some((_, task)) = lock(&self.shared.reader_task).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MBAP_HEADER_LEN;

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(0x0102, 1, &[0x03, 0x00, 0x64, 0x00, 0x0A]);
        assert_eq!(
            &frame[..],
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x0A]
        );
        assert_eq!(frame.len(), MBAP_HEADER_LEN + 6);
    }

    #[test]
    fn test_decode_header() {
        let header = [0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x01];
        assert_eq!(decode_header(&header).unwrap(), (7, 1, 4));

        let bad_protocol = [0x00, 0x07, 0x00, 0x01, 0x00, 0x05, 0x01];
        assert!(decode_header(&bad_protocol).is_err());

        let bad_length = [0x00, 0x07, 0x00, 0x00, 0x01, 0x00, 0x01];
        assert!(decode_header(&bad_length).is_err());
    }

    #[test]
    fn test_transaction_id_skips_zero() {
        let transport = TcpTransport::new(TransportConfig::default());
        transport.next_tid.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(transport.next_transaction_id(), u16::MAX);
        assert_eq!(transport.next_transaction_id(), 1);
    }

    #[tokio::test]
    async fn test_submit_requires_connection() {
        let transport = TcpTransport::new(TransportConfig::default());
        assert_eq!(transport.state(), ConnectionState::Unconnected);
        let err = transport.read_registers(0, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected));
        assert_eq!(transport.connection_info(), "not connected");
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_before_io() {
        let transport = TcpTransport::new(TransportConfig::default());
        let err = transport.read_registers(0xFFFF, 2).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused_state_sequence() {
        // Bind then drop a listener to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = TcpTransport::new(TransportConfig::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        transport.add_state_observer(Arc::new(move |change| sink.lock().unwrap().push(change)));

        let err = transport.connect("127.0.0.1", port, 1).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                StateChange {
                    old: ConnectionState::Unconnected,
                    new: ConnectionState::Connecting
                },
                StateChange {
                    old: ConnectionState::Connecting,
                    new: ConnectionState::Unconnected
                },
            ]
        );
        assert_eq!(transport.state(), ConnectionState::Unconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = TcpTransport::new(TransportConfig::default());
        let seen = Arc::new(StdMutex::new(0usize));
        let sink = seen.clone();
        transport.add_state_observer(Arc::new(move |_| *sink.lock().unwrap() += 1));

        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_releases_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = TcpTransport::new(TransportConfig::default());
        let mut state_rx = transport.subscribe_state();

        let (connected, accepted) = tokio::join!(
            transport.connect("127.0.0.1", port, 1),
            listener.accept()
        );
        connected.unwrap();
        let (peer, _) = accepted.unwrap();
        drop(peer);

        tokio::time::timeout(
            Duration::from_secs(1),
            state_rx.wait_for(|state| *state == ConnectionState::Unconnected),
        )
        .await
        .unwrap()
        .unwrap();
        // Give the reader task a moment to finish releasing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.shared.writer.lock().await.is_none());
        assert!(lock(&transport.shared.reader_task).is_none());
        assert_eq!(transport.connection_info(), "not connected");

        // Nothing left to close.
        let seen = Arc::new(StdMutex::new(0usize));
        let sink = seen.clone();
        transport.add_state_observer(Arc::new(move |_| *sink.lock().unwrap() += 1));
        transport.disconnect().await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ready_reply() {
        let reply = PendingReply::ready(
            ModbusFunction::ReadHoldingRegisters,
            0,
            Err(ModbusError::NotConnected),
        );
        assert_eq!(reply.function(), ModbusFunction::ReadHoldingRegisters);
        let result = reply.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ModbusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_detached_reply_times_out() {
        let (_tx, rx) = oneshot::channel();
        let reply = PendingReply::detached(ModbusFunction::MaskWriteRegister, 0, rx);
        let err = reply.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
