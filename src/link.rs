//! # Mover link
//!
//! [`MoverLink`] is what the operator console talks to. It owns one
//! transport and builds every other component on top of it:
//!
//! - typed control-word commands through the [`ControlWordManager`]
//! - the keep-alive and cyclic status poll, both bound to the connection
//! - status decoding into a [`MoverStatusTable`]
//! - the station table and complete recipes, with the device write path
//!
//! Every foreground command publishes `OperationSucceeded` or
//! `OperationFailed` on the [`EventBus`] and still returns its result.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mover_link::{LinkConfig, MoverLink, JogDirection};
//!
//! #[tokio::main]
//! async fn main() -> mover_link::ModbusResult<()> {
//!     let link = MoverLink::new(LinkConfig::default())?;
//!     let mut events = link.subscribe();
//!
//!     if link.connect("192.168.1.10", 502, 1).await {
//!         link.set_enable(true).await?;
//!         link.jog(JogDirection::Left).await?;
//!         let movers = link.read_all_status().await?;
//!         println!("{:?}", movers);
//!     }
//!     while let Ok(event) = events.try_recv() {
//!         println!("{:?}", event);
//!     }
//!     link.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::bitfield::{AddressLocks, BitUpdateStats, ControlBit, ControlWordManager, JogDirection};
use crate::bytes::to_scaled;
use crate::client::SyncClient;
use crate::config::LinkConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::events::{EventBus, LinkEvent};
use crate::keepalive::{spawn_state_watch, spawn_while_connected, HeartbeatState, KeepAlive, TaskHandle};
use crate::protocol::SlaveId;
use crate::recipe::{RecipeWriter, StationRecipe};
use crate::recipe_store::{RecipeChange, RecipeStore};
use crate::register_map::{mover_status, mover_status_address, multi_axis, single_axis, system_status};
use crate::status::{MoverStatusRecord, MoverStatusTable, SystemStatus};
use crate::transport::{ConnectionState, RegisterTransport, StateChange, TcpTransport, TransportStats};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Foreground operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub succeeded: u64,
    pub failed: u64,
}

struct LinkInner<T: RegisterTransport> {
    config: LinkConfig,
    transport: Arc<T>,
    client: SyncClient<T>,
    control: Arc<ControlWordManager<T>>,
    keepalive: Arc<KeepAlive<T>>,
    writer: RecipeWriter<T>,
    store: Mutex<RecipeStore>,
    status: StdMutex<MoverStatusTable>,
    system: StdMutex<Option<SystemStatus>>,
    events: EventBus,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl<T: RegisterTransport> LinkInner<T> {
    fn new(transport: Arc<T>, config: LinkConfig) -> Self {
        let logger = config.logger.clone();
        let client = SyncClient::with_logger(transport.clone(), logger.clone());
        let control = Arc::new(
            ControlWordManager::new(client.clone(), Arc::new(AddressLocks::new()))
                .with_strategy(config.bit_strategy)
                .with_budget(config.bit_update_budget)
                .with_masked_share(config.masked_share)
                .with_logger(logger.clone()),
        );
        let keepalive = Arc::new(KeepAlive::new(control.clone(), config.keepalive).with_logger(logger));
        let writer = RecipeWriter::new(client.clone(), config.sync_timeout);
        let status = MoverStatusTable::new(config.axis_count);

        Self {
            config,
            transport,
            client,
            control,
            keepalive,
            writer,
            store: Mutex::new(RecipeStore::new()),
            status: StdMutex::new(status),
            system: StdMutex::new(None),
            events: EventBus::default(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Count the outcome and publish it.
    fn record<R>(&self, operation: &str, detail: String, result: ModbusResult<R>) -> ModbusResult<R> {
        match &result {
            Ok(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!("{}: {}", operation, detail);
                self.events.publish(LinkEvent::OperationSucceeded {
                    operation: operation.to_string(),
                    detail,
                });
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("{} failed: {}", operation, e);
                self.events.publish(LinkEvent::OperationFailed {
                    operation: operation.to_string(),
                    detail: e.to_string(),
                });
            }
        }
        result
    }

    fn on_state_change(&self, change: StateChange) {
        if change.old == ConnectionState::Connected && change.new != ConnectionState::Connected {
            lock(&self.status).mark_disconnected();
        }
        self.events.publish(change.into());
    }

    async fn poll_status(&self) -> ModbusResult<Vec<MoverStatusRecord>> {
        let movers = lock(&self.status).axis_count();
        if movers == 0 {
            return Ok(Vec::new());
        }
        let block = self
            .client
            .read_blocks(
                mover_status::BASE,
                mover_status::STRIDE,
                movers,
                &self.config.limits,
                self.config.sync_timeout,
            )
            .await?;

        let (records, transitions) = {
            let mut table = lock(&self.status);
            let transitions = table.apply(&block)?;
            (table.records().to_vec(), transitions)
        };
        for transition in transitions {
            info!(
                "Mover {} {} -> {}",
                transition.mover_id, transition.old, transition.new
            );
            self.events.publish(LinkEvent::StatusTransition(transition));
        }
        self.events.publish(LinkEvent::StatusUpdated(records.clone()));
        Ok(records)
    }
}

/// Operator-facing handle on one controller.
pub struct MoverLink<T: RegisterTransport = TcpTransport> {
    inner: Arc<LinkInner<T>>,
    tasks: StdMutex<Vec<TaskHandle>>,
    /// Forwards transport state to the link when the transport has no
    /// synchronous observer hook.
    state_watch: Option<StdMutex<Option<TaskHandle>>>,
}

impl MoverLink<TcpTransport> {
    /// Link over Modbus TCP. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: LinkConfig) -> ModbusResult<Self> {
        config.validate()?;
        let transport = Arc::new(TcpTransport::with_logger(
            config.transport_config(),
            config.logger.clone(),
        ));
        let link = Self::build(transport.clone(), config, false);

        let weak = Arc::downgrade(&link.inner);
        transport.add_state_observer(Arc::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_state_change(change);
            }
        }));
        Ok(link)
    }

    /// Connect to `host:port`, replacing any current connection.
    ///
    /// Also starts the keep-alive and status poll the first time.
    pub async fn try_connect(&self, host: &str, port: u16, unit_id: SlaveId) -> ModbusResult<()> {
        self.start();
        let result = self.inner.transport.connect(host, port, unit_id).await;
        let detail = self.connection_info();
        self.inner.record("connect", detail, result)
    }

    /// Like [`try_connect`](Self::try_connect), reporting failure through
    /// the event bus only.
    pub async fn connect(&self, host: &str, port: u16, unit_id: SlaveId) -> bool {
        self.try_connect(host, port, unit_id).await.is_ok()
    }

    /// Close the connection. The background tasks pause until the next
    /// connect. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.transport.disconnect().await;
        info!("Disconnected from controller");
    }

    pub fn connection_info(&self) -> String {
        self.inner.transport.connection_info()
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }
}

impl<T: RegisterTransport> MoverLink<T> {
    /// Link over an already constructed transport.
    ///
    /// State transitions are followed by a task on
    /// [`subscribe_state`](RegisterTransport::subscribe_state). Outside a
    /// tokio runtime that task is deferred to [`start`](Self::start).
    pub fn with_transport(transport: Arc<T>, config: LinkConfig) -> ModbusResult<Self> {
        config.validate()?;
        let link = Self::build(transport, config, true);
        if tokio::runtime::Handle::try_current().is_ok() {
            link.watch_state();
        }
        Ok(link)
    }

    fn build(transport: Arc<T>, config: LinkConfig, watch_state: bool) -> Self {
        Self {
            inner: Arc::new(LinkInner::new(transport, config)),
            tasks: StdMutex::new(Vec::new()),
            state_watch: watch_state.then(|| StdMutex::new(None)),
        }
    }

    fn watch_state(&self) {
        let Some(slot) = &self.state_watch else {
            return;
        };
        let mut slot = lock(slot);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(spawn_state_watch(
            self.inner.transport.subscribe_state(),
            move |change| match weak.upgrade() {
                Some(inner) => {
                    inner.on_state_change(change);
                    true
                }
                None => false,
            },
        ));
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Start the keep-alive and status poll. Both follow the connection
    /// state on their own; calling this again is a no-op.
    pub fn start(&self) {
        self.watch_state();
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            return;
        }
        let config = &self.inner.config;
        if config.keepalive.enabled {
            tasks.push(self.inner.keepalive.spawn());
        }
        if config.poll_enabled {
            let inner = self.inner.clone();
            tasks.push(spawn_while_connected(
                "status poll",
                self.inner.transport.subscribe_state(),
                config.poll_interval,
                config.poll_interval,
                || {},
                move || {
                    let inner = inner.clone();
                    async move {
                        if let Err(e) = inner.poll_status().await {
                            debug!("Status poll failed: {}", e);
                        }
                    }
                },
            ));
        }
    }

    /// Stop the background tasks and wait for them.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        if let Some(slot) = &self.state_watch {
            tasks.extend(lock(slot).take());
        }
        for task in tasks {
            task.stop().await;
        }
    }

    // ========================================================================
    // Single-axis commands
    // ========================================================================

    pub async fn set_control_bit(&self, bit: ControlBit, value: bool) -> ModbusResult<()> {
        let result = self.inner.control.set_control_bit(bit, value).await.map(|_| ());
        let detail = format!("{} {}", bit.name(), if value { "on" } else { "off" });
        self.inner.record("control bit", detail, result)
    }

    pub async fn set_enable(&self, enable: bool) -> ModbusResult<()> {
        self.set_control_bit(ControlBit::Enable, enable).await
    }

    /// `true` selects automatic mode, `false` manual
    pub async fn set_run_mode(&self, automatic: bool) -> ModbusResult<()> {
        self.set_control_bit(ControlBit::RunMode, automatic).await
    }

    pub async fn set_manual_allow(&self, allow: bool) -> ModbusResult<()> {
        self.set_control_bit(ControlBit::ManualAllow, allow).await
    }

    pub async fn set_auto_run(&self, run: bool) -> ModbusResult<()> {
        self.set_control_bit(ControlBit::AutoRun, run).await
    }

    pub async fn jog(&self, direction: JogDirection) -> ModbusResult<()> {
        let result = self.inner.control.jog(direction).await;
        let detail = match direction {
            JogDirection::Stop => "stop",
            JogDirection::Left => "left",
            JogDirection::Right => "right",
        };
        self.inner.record("jog", detail.to_string(), result)
    }

    async fn write_i32(&self, operation: &str, address: u16, value: i32) -> ModbusResult<()> {
        let result = self
            .inner
            .client
            .write_i32(address, value, self.inner.config.sync_timeout)
            .await;
        self.inner.record(operation, value.to_string(), result)
    }

    async fn write_u16(&self, operation: &str, address: u16, value: u16) -> ModbusResult<()> {
        let result = self
            .inner
            .client
            .write_register(address, value, self.inner.config.sync_timeout)
            .await;
        self.inner.record(operation, value.to_string(), result)
    }

    pub async fn set_auto_speed(&self, speed: i32) -> ModbusResult<()> {
        self.write_i32("auto speed", single_axis::AUTO_SPEED_LOW, speed)
            .await
    }

    pub async fn set_jog_speed(&self, speed: i32) -> ModbusResult<()> {
        self.write_i32("jog speed", single_axis::JOG_SPEED_LOW, speed)
            .await
    }

    pub async fn set_jog_position(&self, position: i16) -> ModbusResult<()> {
        self.write_u16("jog position", single_axis::JOG_POSITION, position as u16)
            .await
    }

    /// Current control word, straight from the controller
    pub async fn read_control_word(&self) -> ModbusResult<u16> {
        self.inner
            .control
            .read_control_word(self.inner.config.sync_timeout)
            .await
    }

    // ========================================================================
    // Multi-axis commands
    // ========================================================================

    fn axis_address(base: u16, mover_id: u16) -> ModbusResult<u16> {
        base.checked_add(mover_id).ok_or_else(|| {
            ModbusError::invalid_data(format!("Mover id {} out of range", mover_id))
        })
    }

    pub async fn set_axis_enable(&self, mover_id: u16, enable: bool) -> ModbusResult<()> {
        let address = Self::axis_address(multi_axis::ENABLE_BASE, mover_id)?;
        self.write_u16("axis enable", address, u16::from(enable))
            .await
    }

    pub async fn set_axis_speed(&self, mover_id: u16, speed: u16) -> ModbusResult<()> {
        let address = Self::axis_address(multi_axis::SPEED_BASE, mover_id)?;
        self.write_u16("axis speed", address, speed).await
    }

    /// Send mover `mover_id` to `position_mm`.
    pub async fn move_to(&self, mover_id: u16, position_mm: f64) -> ModbusResult<()> {
        let address = mover_status_address(mover_id)
            .and_then(|base| base.checked_add(mover_status::TARGET_LOW))
            .ok_or_else(|| {
                ModbusError::invalid_data(format!("Mover id {} out of range", mover_id))
            })?;
        let raw = to_scaled(position_mm, mover_status::SCALE).ok_or_else(|| {
            ModbusError::invalid_data(format!("Target position {} mm out of range", position_mm))
        })?;
        self.write_i32("move to", address, raw).await
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Read and decode every configured mover.
    ///
    /// A short read is rejected and the previous snapshot kept.
    pub async fn read_all_status(&self) -> ModbusResult<Vec<MoverStatusRecord>> {
        let result = self.inner.poll_status().await;
        let detail = format!("{} movers", self.inner.config.axis_count);
        self.inner.record("read status", detail, result)
    }

    pub async fn read_system_status(&self) -> ModbusResult<SystemStatus> {
        let result = async {
            let block = self
                .inner
                .client
                .read_registers(
                    system_status::SYSTEM_READY,
                    system_status::BLOCK_LEN,
                    self.inner.config.sync_timeout,
                )
                .await?;
            SystemStatus::decode(&block)
        }
        .await;

        if let Ok(status) = &result {
            *lock(&self.inner.system) = Some(*status);
            self.inner.events.publish(LinkEvent::SystemStatus(*status));
        }
        self.inner
            .record("read system status", "system flags".to_string(), result)
    }

    /// Latest decoded record of every mover
    pub fn movers(&self) -> Vec<MoverStatusRecord> {
        lock(&self.inner.status).records().to_vec()
    }

    pub fn mover(&self, mover_id: u16) -> Option<MoverStatusRecord> {
        lock(&self.inner.status).get(mover_id).cloned()
    }

    pub fn system_status(&self) -> Option<SystemStatus> {
        *lock(&self.inner.system)
    }

    // ========================================================================
    // Recipes
    // ========================================================================

    /// The station table and complete recipes, for direct edits
    pub fn recipe_store(&self) -> &Mutex<RecipeStore> {
        &self.inner.store
    }

    fn recipe_changed(&self, change: RecipeChange) {
        self.inner.events.publish(LinkEvent::RecipeChanged(change));
    }

    pub async fn add_station(&self, station: StationRecipe) -> usize {
        let index = self.inner.store.lock().await.add_station(station);
        self.recipe_changed(RecipeChange::StationAdded(index));
        index
    }

    pub async fn update_station(&self, index: usize, station: StationRecipe) -> ModbusResult<()> {
        self.inner.store.lock().await.update_station(index, station)?;
        self.recipe_changed(RecipeChange::StationUpdated(index));
        Ok(())
    }

    pub async fn remove_station(&self, index: usize) -> ModbusResult<StationRecipe> {
        let removed = self.inner.store.lock().await.remove_station(index)?;
        self.recipe_changed(RecipeChange::StationRemoved(index));
        Ok(removed)
    }

    /// Update one station and write its block to the controller
    pub async fn save_station(&self, index: usize, station: StationRecipe) -> ModbusResult<()> {
        let result = self
            .inner
            .store
            .lock()
            .await
            .save_station(index, station, &self.inner.writer)
            .await;
        if result.is_ok() {
            self.recipe_changed(RecipeChange::StationUpdated(index));
        }
        self.inner
            .record("save station", format!("station {}", index + 1), result)
    }

    /// Write the whole station table to the controller
    pub async fn save_all_stations(&self) -> ModbusResult<()> {
        let store = self.inner.store.lock().await;
        let result = store.save_all(&self.inner.writer).await;
        let detail = format!("{} stations", store.table().len());
        self.inner.record("save all stations", detail, result)
    }

    /// Read one station block back from the controller
    pub async fn read_station(&self, index: usize) -> ModbusResult<StationRecipe> {
        self.inner.writer.read_station(index).await
    }

    pub async fn save_complete_recipe(&self, name: &str, description: &str) -> ModbusResult<()> {
        let result = self
            .inner
            .store
            .lock()
            .await
            .save(name, description)
            .map(|_| ());
        if result.is_ok() {
            self.recipe_changed(RecipeChange::Saved(name.to_string()));
        }
        self.inner.record("save recipe", name.to_string(), result)
    }

    /// Replace the station table with a saved recipe; no device I/O
    pub async fn load_complete_recipe(&self, name: &str) -> ModbusResult<()> {
        let result = self.inner.store.lock().await.load(name);
        if result.is_ok() {
            self.recipe_changed(RecipeChange::Loaded(name.to_string()));
        }
        self.inner.record("load recipe", name.to_string(), result)
    }

    /// Load a saved recipe and write it to the controller.
    ///
    /// A failure names the step that failed; the controller must then get a
    /// full rewrite.
    pub async fn apply_complete_recipe(&self, name: &str) -> ModbusResult<()> {
        let result = self
            .inner
            .store
            .lock()
            .await
            .apply(name, &self.inner.writer)
            .await;
        if result.is_ok() {
            self.recipe_changed(RecipeChange::Applied(name.to_string()));
        }
        self.inner.record("apply recipe", name.to_string(), result)
    }

    pub async fn delete_complete_recipe(&self, name: &str) -> ModbusResult<()> {
        let result = self.inner.store.lock().await.delete(name).map(|_| ());
        if result.is_ok() {
            self.recipe_changed(RecipeChange::Deleted(name.to_string()));
        }
        self.inner.record("delete recipe", name.to_string(), result)
    }

    pub async fn rename_complete_recipe(&self, old_name: &str, new_name: &str) -> ModbusResult<()> {
        let result = self.inner.store.lock().await.rename(old_name, new_name);
        if result.is_ok() {
            self.recipe_changed(RecipeChange::Renamed {
                from: old_name.to_string(),
                to: new_name.to_string(),
            });
        }
        let detail = format!("{} -> {}", old_name, new_name);
        self.inner.record("rename recipe", detail, result)
    }

    pub async fn complete_recipe_names(&self) -> Vec<String> {
        self.inner.store.lock().await.names()
    }

    pub async fn current_recipe_name(&self) -> Option<String> {
        self.inner
            .store
            .lock()
            .await
            .current_name()
            .map(str::to_string)
    }

    pub async fn save_recipes_to_file(&self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let path = path.as_ref();
        let result = self.inner.store.lock().await.save_to_file(path);
        self.inner
            .record("save recipe file", path.display().to_string(), result)
    }

    pub async fn load_recipes_from_file(&self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let path = path.as_ref();
        let result = self.inner.store.lock().await.load_from_file(path);
        if result.is_ok() {
            self.recipe_changed(RecipeChange::FileLoaded);
        }
        self.inner
            .record("load recipe file", path.display().to_string(), result)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn operation_stats(&self) -> OperationStats {
        OperationStats {
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    pub fn bit_update_stats(&self) -> BitUpdateStats {
        self.inner.control.stats()
    }

    pub fn heartbeat(&self) -> HeartbeatState {
        self.inner.keepalive.state()
    }
}
