//! In-process Modbus TCP controller for the integration tests
//!
//! Serves FC03, FC06, FC16 and FC22 from an in-memory register map. Mask
//! write support, reply delay and connection drops are switchable at run
//! time.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};

/// A write the server applied, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub function: u8,
    pub address: u16,
    pub values: Vec<u16>,
}

#[derive(Default)]
struct ServerState {
    registers: RwLock<HashMap<u16, u16>>,
    writes: RwLock<Vec<WriteRecord>>,
    mask_write_unsupported: AtomicBool,
    reply_delay_ms: AtomicU64,
    connections: AtomicUsize,
}

pub struct TestServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    kick: watch::Sender<u64>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let (kick, _) = watch::channel(0u64);

        let accept_state = state.clone();
        let accept_kick = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let kick_rx = accept_kick.subscribe();
                tokio::spawn(handle_connection(state, stream, kick_rx));
            }
        });

        Self { state, addr, kick }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn register(&self, address: u16) -> u16 {
        self.state
            .registers
            .read()
            .await
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_register(&self, address: u16, value: u16) {
        self.state.registers.write().await.insert(address, value);
    }

    pub async fn writes(&self) -> Vec<WriteRecord> {
        self.state.writes.read().await.clone()
    }

    pub fn set_mask_write_supported(&self, supported: bool) {
        self.state
            .mask_write_unsupported
            .store(!supported, Ordering::SeqCst);
    }

    /// Delay applied to every request read from now on.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.state
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open client connection.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }
}

/// A port on which nothing is listening.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn handle_connection(
    state: Arc<ServerState>,
    mut stream: TcpStream,
    mut kick: watch::Receiver<u64>,
) {
    loop {
        let mut header = [0u8; 7];
        tokio::select! {
            read = stream.read_exact(&mut header) => {
                if read.is_err() {
                    return;
                }
            }
            _ = kick.changed() => return,
        }
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];
        let mut pdu = vec![0u8; length.saturating_sub(1)];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let delay = state.reply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = kick.changed() => return,
            }
        }

        let reply = answer(&state, &pdu).await;
        let mut frame = Vec::with_capacity(7 + reply.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((reply.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(&reply);
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn word(pdu: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([pdu[offset], pdu[offset + 1]])
}

fn exception(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

async fn answer(state: &ServerState, pdu: &[u8]) -> Vec<u8> {
    let Some(&function) = pdu.first() else {
        return exception(0, 0x01);
    };
    match function {
        0x03 if pdu.len() >= 5 => {
            let (address, count) = (word(pdu, 1), word(pdu, 3));
            let registers = state.registers.read().await;
            let mut reply = vec![0x03, (count * 2) as u8];
            for i in 0..count {
                let value = registers.get(&(address + i)).copied().unwrap_or(0);
                reply.extend_from_slice(&value.to_be_bytes());
            }
            reply
        }
        0x06 if pdu.len() >= 5 => {
            let (address, value) = (word(pdu, 1), word(pdu, 3));
            state.registers.write().await.insert(address, value);
            state.writes.write().await.push(WriteRecord {
                function,
                address,
                values: vec![value],
            });
            pdu[..5].to_vec()
        }
        0x10 if pdu.len() >= 6 => {
            let (address, count) = (word(pdu, 1), word(pdu, 3));
            let values: Vec<u16> = (0..count as usize).map(|i| word(pdu, 6 + i * 2)).collect();
            {
                let mut registers = state.registers.write().await;
                for (i, value) in values.iter().enumerate() {
                    registers.insert(address + i as u16, *value);
                }
            }
            state.writes.write().await.push(WriteRecord {
                function,
                address,
                values,
            });
            pdu[..5].to_vec()
        }
        0x16 if pdu.len() >= 7 => {
            if state.mask_write_unsupported.load(Ordering::SeqCst) {
                return exception(function, 0x01);
            }
            let (address, and_mask, or_mask) = (word(pdu, 1), word(pdu, 3), word(pdu, 5));
            {
                let mut registers = state.registers.write().await;
                let current = registers.get(&address).copied().unwrap_or(0);
                registers.insert(address, (current & and_mask) | (or_mask & !and_mask));
            }
            state.writes.write().await.push(WriteRecord {
                function,
                address,
                values: vec![and_mask, or_mask],
            });
            pdu[..7].to_vec()
        }
        other => exception(other, 0x01),
    }
}
