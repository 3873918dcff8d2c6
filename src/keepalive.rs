//! # Keep-alive scheduler
//!
//! While the link is connected, a background task periodically either
//! toggles bit 15 of the control word (`Toggle`) or just reads it (`Poll`).
//!
//! The toggle write shares the per-address lock of the control word with the
//! [`ControlWordManager`]. A tick that finds the lock held is skipped, never
//! queued: a foreground command is in progress and the heartbeat can wait one
//! period.
//!
//! The task starts after the link reports `Connected` plus a short grace
//! delay, and stops at the first transition away from `Connected`. The toggle
//! state restarts at `false` on every new connection.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::bitfield::{bit_masks, ControlWordManager};
use crate::logging::CallbackLogger;
use crate::register_map::{control_bits, single_axis};
use crate::transport::{ConnectionState, RegisterTransport, StateChange};

/// Default tick period.
pub const DEFAULT_INTERVAL_MS: u64 = 3000;
/// Delay between `Connected` and the start of the schedule.
pub const DEFAULT_GRACE_MS: u64 = 400;
const MIN_OP_TIMEOUT_MS: u64 = 800;

/// What the keep-alive does each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeepAliveMode {
    /// Alternate bit 15 of the register.
    #[default]
    Toggle,
    /// Read the register and discard the value.
    Poll,
}

/// Keep-alive settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeepAliveConfig {
    pub enabled: bool,
    pub mode: KeepAliveMode,
    pub interval: Duration,
    pub grace: Duration,
    pub address: u16,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: KeepAliveMode::Toggle,
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            address: single_axis::CONTROL_WORD,
        }
    }
}

impl KeepAliveConfig {
    /// Bound of one heartbeat operation: a third of the period, at least 800 ms.
    pub fn op_timeout(&self) -> Duration {
        (self.interval / 3).max(Duration::from_millis(MIN_OP_TIMEOUT_MS))
    }
}

/// Result of one keep-alive tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Bit 15 now has this value.
    Toggled(bool),
    /// The register lock was held by a foreground operation.
    Skipped,
    /// Poll mode read this value.
    Polled(u16),
    /// The write or read failed; counted, not surfaced.
    Failed,
    /// The link was not connected.
    Idle,
}

/// Snapshot of the heartbeat bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatState {
    /// Value of bit 15 after the last successful toggle.
    pub toggle_state: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub skipped: u64,
    pub failures: u64,
}

/// Heartbeat writer bound to one control register.
pub struct KeepAlive<T: RegisterTransport> {
    manager: Arc<ControlWordManager<T>>,
    config: KeepAliveConfig,
    toggle_state: AtomicBool,
    last_success: StdMutex<Option<DateTime<Utc>>>,
    ticks: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    logger: CallbackLogger,
}

impl<T: RegisterTransport> KeepAlive<T> {
    pub fn new(manager: Arc<ControlWordManager<T>>, config: KeepAliveConfig) -> Self {
        Self {
            manager,
            config,
            toggle_state: AtomicBool::new(false),
            last_success: StdMutex::new(None),
            ticks: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            logger: CallbackLogger::default(),
        }
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Restart the toggle sequence at `false`.
    pub fn reset(&self) {
        self.toggle_state.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> HeartbeatState {
        HeartbeatState {
            toggle_state: self.toggle_state.load(Ordering::SeqCst),
            last_success: *self
                .last_success
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record_success(&self) {
        *self
            .last_success
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    fn record_failure(&self, message: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.logger.debug(message);
    }

    /// Run one keep-alive cycle.
    pub async fn tick(&self) -> TickOutcome {
        if !self.manager.client().transport().is_connected() {
            return TickOutcome::Idle;
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);

        match self.config.mode {
            KeepAliveMode::Toggle => self.toggle().await,
            KeepAliveMode::Poll => {
                match self
                    .manager
                    .client()
                    .read_register(self.config.address, self.config.op_timeout())
                    .await
                {
                    Ok(value) => {
                        self.record_success();
                        TickOutcome::Polled(value)
                    }
                    Err(e) => {
                        self.record_failure(&format!("Heartbeat poll failed: {}", e));
                        TickOutcome::Failed
                    }
                }
            }
        }
    }

    async fn toggle(&self) -> TickOutcome {
        let address = self.config.address;
        let Some(_guard) = self.manager.locks().try_lock(address) else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Heartbeat skipped: control operation in progress on 0x{:04X}", address);
            return TickOutcome::Skipped;
        };

        let next = !self.toggle_state.load(Ordering::SeqCst);
        let (and_mask, or_mask) = bit_masks(control_bits::HEARTBEAT, next);
        match self
            .manager
            .update_bits_locked(address, and_mask, or_mask, self.config.op_timeout())
            .await
        {
            Ok(_) => {
                // Only a confirmed write moves the sequence on.
                self.toggle_state.store(next, Ordering::SeqCst);
                self.record_success();
                debug!("Heartbeat bit15={}", u8::from(next));
                TickOutcome::Toggled(next)
            }
            Err(e) => {
                self.record_failure(&format!("Heartbeat write failed: {}", e));
                TickOutcome::Failed
            }
        }
    }

    /// Start the schedule. It follows the transport state until the handle
    /// is stopped or dropped.
    pub fn spawn(self: &Arc<Self>) -> TaskHandle {
        let state_rx = self.manager.client().transport().subscribe_state();
        let on_connected = {
            let this = self.clone();
            move || this.reset()
        };
        let tick = {
            let this = self.clone();
            move || {
                let this = this.clone();
                async move {
                    this.tick().await;
                }
            }
        };
        spawn_while_connected(
            "keep-alive",
            state_rx,
            self.config.grace + self.config.interval,
            self.config.interval,
            on_connected,
            tick,
        )
    }
}

// ============================================================================
// Connection-bound periodic task
// ============================================================================

/// Handle of a periodic task bound to the connection state.
///
/// Dropping the handle stops the task at its next suspension point.
#[derive(Debug)]
pub struct TaskHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run `tick` every `period` while the state is `Connected`.
///
/// On each transition to `Connected`, `on_connected` runs and the first tick
/// fires after `first_tick`. Any other state ends the current run; the task
/// then waits for the next connection.
pub(crate) fn spawn_while_connected<C, F, Fut>(
    name: &'static str,
    mut state_rx: watch::Receiver<ConnectionState>,
    first_tick: Duration,
    period: Duration,
    mut on_connected: C,
    mut tick: F,
) -> TaskHandle
where
    C: FnMut() + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (stop, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            while *state_rx.borrow_and_update() != ConnectionState::Connected {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }

            on_connected();
            debug!("{} task running, first tick in {:?}", name, first_tick);
            let mut ticker = interval_at(Instant::now() + first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let state = *state_rx.borrow_and_update();
                        if state != ConnectionState::Connected {
                            debug!("{} task paused: link {}", name, state);
                            break;
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        }
    });
    TaskHandle { stop, task }
}

/// Call `on_change` for each state transition the receiver observes, until it
/// returns `false` or the sender is dropped.
///
/// States overwritten before the task wakes are never seen.
pub(crate) fn spawn_state_watch<F>(
    mut state_rx: watch::Receiver<ConnectionState>,
    mut on_change: F,
) -> TaskHandle
where
    F: FnMut(StateChange) -> bool + Send + 'static,
{
    let (stop, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut last = *state_rx.borrow_and_update();
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let new = *state_rx.borrow_and_update();
                    if new == last {
                        continue;
                    }
                    let old = std::mem::replace(&mut last, new);
                    if !on_change(StateChange { old, new }) {
                        return;
                    }
                }
                _ = stop_rx.changed() => return,
            }
        }
    });
    TaskHandle { stop, task }
}
