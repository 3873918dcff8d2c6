//! # Station recipes
//!
//! Every process station is configured by an 8-register block at
//! `recipe::BASE + index * 8`:
//!
//! | Offset | Low byte | High byte |
//! |---|---|---|
//! | 0 | station number | task / process id |
//! | 1 | segment number | next station id |
//! | 2 | segment position ||
//! | 3 | segment speed ||
//! | 4 | start position ||
//! | 5 | end position ||
//! | 6 | arrival delay (ms) ||
//! | 7 | ferry position | station mask (0/1) |
//!
//! A full-table write sends the station count to `recipe::STATION_COUNT`
//! first, then every station block in index order, one request per block.
//! The first failure aborts the sequence. The controller then holds a count
//! that may exceed the blocks actually written; the table must be rewritten
//! in full, never resumed.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bytes::{pack_bytes, unpack_bytes};
use crate::client::SyncClient;
use crate::error::{ModbusError, ModbusResult, TableWriteStep};
use crate::register_map::{recipe, station_address};
use crate::transport::RegisterTransport;

/// Number of stations in a fresh table.
pub const DEFAULT_STATION_COUNT: usize = 10;

// ============================================================================
// Field enums
// ============================================================================

/// Ferry position of a station, as the controller encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FerryPosition {
    #[default]
    None = 0,
    Pos1 = 1,
    Pos2 = 2,
}

impl TryFrom<u8> for FerryPosition {
    type Error = ModbusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Pos1),
            2 => Ok(Self::Pos2),
            other => Err(ModbusError::invalid_data(format!(
                "Unknown ferry position {}",
                other
            ))),
        }
    }
}

impl From<FerryPosition> for u8 {
    fn from(value: FerryPosition) -> Self {
        value as u8
    }
}

/// Process step a station performs, carried in the task id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    Winding = 1,
    Gluing = 2,
    Welding = 3,
    Molding = 4,
    Unloading = 5,
}

impl ProcessType {
    pub const ALL: [ProcessType; 5] = [
        Self::Winding,
        Self::Gluing,
        Self::Welding,
        Self::Molding,
        Self::Unloading,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| *p as u8 == id)
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Winding => "winding",
            Self::Gluing => "gluing",
            Self::Welding => "welding",
            Self::Molding => "molding",
            Self::Unloading => "unloading",
        }
    }

    /// Case-insensitive inverse of [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Winding => "coil winding",
            Self::Gluing => "glue coil to bobbin",
            Self::Welding => "solder coil leads to PCB",
            Self::Molding => "over-mould coil module",
            Self::Unloading => "sort finished parts",
        }
    }

    /// Station numbers (1-based) assigned to this process.
    pub fn stations(self) -> RangeInclusive<u8> {
        let first = (self as u8 - 1) * 2 + 1;
        first..=first + 1
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Station numbers of `process`, in order.
pub fn stations_for(process: ProcessType) -> Vec<u8> {
    process.stations().collect()
}

// ============================================================================
// Station record
// ============================================================================

/// Configuration of one process station.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationRecipe {
    pub station_no: u8,
    /// Raw process id; see [`ProcessType`].
    pub task_id: u8,
    pub segment_no: u8,
    pub next_station_id: u8,
    pub segment_position: u16,
    pub segment_speed: u16,
    pub start_position: u16,
    pub end_position: u16,
    /// ms
    pub arrival_delay: u16,
    #[serde(rename = "ferryPos")]
    pub ferry_position: FerryPosition,
    pub station_mask: bool,
    /// Host-side bookkeeping only; never sent to the controller.
    pub recipe_id: u16,
}

impl StationRecipe {
    /// Registers per station block.
    pub const REGISTERS: usize = recipe::STATION_SIZE as usize;

    pub fn process_type(&self) -> Option<ProcessType> {
        ProcessType::from_id(self.task_id)
    }

    pub fn encode(&self) -> [u16; Self::REGISTERS] {
        [
            pack_bytes(self.station_no, self.task_id),
            pack_bytes(self.segment_no, self.next_station_id),
            self.segment_position,
            self.segment_speed,
            self.start_position,
            self.end_position,
            self.arrival_delay,
            pack_bytes(self.ferry_position.into(), u8::from(self.station_mask)),
        ]
    }

    /// Decode a block read from the controller. `recipe_id` is not on the
    /// wire and comes back as 0.
    pub fn decode(block: &[u16]) -> ModbusResult<Self> {
        if block.len() < Self::REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "Station block has {} registers, expected {}",
                block.len(),
                Self::REGISTERS
            )));
        }
        let (station_no, task_id) = unpack_bytes(block[0]);
        let (segment_no, next_station_id) = unpack_bytes(block[1]);
        let (ferry, mask) = unpack_bytes(block[7]);
        Ok(Self {
            station_no,
            task_id,
            segment_no,
            next_station_id,
            segment_position: block[2],
            segment_speed: block[3],
            start_position: block[4],
            end_position: block[5],
            arrival_delay: block[6],
            ferry_position: FerryPosition::try_from(ferry)?,
            station_mask: mask != 0,
            recipe_id: 0,
        })
    }
}

/// The factory table: ten winding stations on consecutive segments, each
/// pointing at the next, the last wrapping to the first.
pub fn default_stations() -> Vec<StationRecipe> {
    (0..DEFAULT_STATION_COUNT)
        .map(|i| {
            let n = i as u8;
            StationRecipe {
                station_no: n + 1,
                task_id: ProcessType::Winding.id(),
                segment_no: n + 1,
                next_station_id: if i + 1 < DEFAULT_STATION_COUNT { n + 2 } else { 1 },
                segment_position: 188 + 120 * i as u16,
                segment_speed: 1000,
                start_position: 0,
                end_position: 100,
                arrival_delay: 500,
                ferry_position: if i == 0 {
                    FerryPosition::Pos1
                } else {
                    FerryPosition::None
                },
                station_mask: false,
                recipe_id: 1,
            }
        })
        .collect()
}

// ============================================================================
// Station table
// ============================================================================

/// Ordered list of station recipes; the index is the station's slot on the
/// controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeTable {
    stations: Vec<StationRecipe>,
}

impl RecipeTable {
    pub fn new(stations: Vec<StationRecipe>) -> Self {
        Self { stations }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_stations())
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn stations(&self) -> &[StationRecipe] {
        &self.stations
    }

    fn check_index(&self, index: usize) -> ModbusResult<()> {
        if index < self.stations.len() {
            Ok(())
        } else {
            Err(ModbusError::StationIndex {
                index,
                count: self.stations.len(),
            })
        }
    }

    pub fn get(&self, index: usize) -> ModbusResult<&StationRecipe> {
        self.check_index(index)?;
        Ok(&self.stations[index])
    }

    /// Append a station, returning its index.
    pub fn add(&mut self, station: StationRecipe) -> usize {
        self.stations.push(station);
        self.stations.len() - 1
    }

    pub fn remove(&mut self, index: usize) -> ModbusResult<StationRecipe> {
        self.check_index(index)?;
        Ok(self.stations.remove(index))
    }

    pub fn update(&mut self, index: usize, station: StationRecipe) -> ModbusResult<()> {
        self.check_index(index)?;
        self.stations[index] = station;
        Ok(())
    }

    /// Swap in a whole new list.
    pub fn replace(&mut self, stations: Vec<StationRecipe>) {
        self.stations = stations;
    }
}

// ============================================================================
// Device writer
// ============================================================================

/// Writes and reads station blocks on the controller.
pub struct RecipeWriter<T: RegisterTransport> {
    client: SyncClient<T>,
    timeout: Duration,
}

impl<T: RegisterTransport> RecipeWriter<T> {
    /// `timeout` bounds each individual request
    pub fn new(client: SyncClient<T>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn address_of(index: usize, count: usize) -> ModbusResult<u16> {
        station_address(index).ok_or(ModbusError::StationIndex { index, count })
    }

    pub async fn write_station_count(&self, count: u16) -> ModbusResult<()> {
        self.client
            .write_register(recipe::STATION_COUNT, count, self.timeout)
            .await
    }

    /// Write one station block in a single request
    pub async fn write_station(&self, index: usize, station: &StationRecipe) -> ModbusResult<()> {
        let address = Self::address_of(index, index + 1)?;
        self.client
            .write_registers(address, &station.encode(), self.timeout)
            .await?;
        debug!("Station {} written at 0x{:04X}", index + 1, address);
        Ok(())
    }

    /// Write the count, then every station in order. Stops at the first
    /// failure and reports which step failed.
    pub async fn write_table(&self, table: &RecipeTable) -> ModbusResult<()> {
        if table.is_empty() {
            return Err(ModbusError::EmptyTable);
        }
        if !self.client.transport().is_connected() {
            return Err(ModbusError::NotConnected);
        }
        let count = u16::try_from(table.len()).map_err(|_| ModbusError::StationIndex {
            index: table.len() - 1,
            count: table.len(),
        })?;
        // Refuse up front rather than after a partial write.
        Self::address_of(table.len() - 1, table.len())?;

        if let Err(e) = self.write_station_count(count).await {
            warn!("Station table write aborted at station count: {}", e);
            return Err(ModbusError::TableWrite {
                step: TableWriteStep::StationCount,
                reason: e.to_string(),
            });
        }
        for (index, station) in table.stations().iter().enumerate() {
            if let Err(e) = self.write_station(index, station).await {
                warn!("Station table write aborted at station {}: {}", index + 1, e);
                return Err(ModbusError::TableWrite {
                    step: TableWriteStep::Station(index),
                    reason: e.to_string(),
                });
            }
        }
        info!("Station table written ({} stations)", count);
        Ok(())
    }

    pub async fn read_station_count(&self) -> ModbusResult<u16> {
        self.client
            .read_register(recipe::STATION_COUNT, self.timeout)
            .await
    }

    /// Read one station block back from the controller
    pub async fn read_station(&self, index: usize) -> ModbusResult<StationRecipe> {
        let address = Self::address_of(index, index + 1)?;
        let block = self
            .client
            .read_registers(address, recipe::STATION_SIZE, self.timeout)
            .await?;
        StationRecipe::decode(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;
    use crate::test_support::SimulatedDevice;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn writer(device: &Arc<SimulatedDevice>) -> RecipeWriter<SimulatedDevice> {
        RecipeWriter::new(SyncClient::new(device.clone()), Duration::from_millis(200))
    }

    fn station_strategy() -> impl Strategy<Value = StationRecipe> {
        (
            (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>()),
            (any::<u16>(), any::<u16>(), any::<u16>(), any::<u16>(), any::<u16>()),
            (0u8..3, any::<bool>()),
        )
            .prop_map(|((no, task, seg, next), (pos, speed, start, end, delay), (ferry, mask))| {
                StationRecipe {
                    station_no: no,
                    task_id: task,
                    segment_no: seg,
                    next_station_id: next,
                    segment_position: pos,
                    segment_speed: speed,
                    start_position: start,
                    end_position: end,
                    arrival_delay: delay,
                    ferry_position: FerryPosition::try_from(ferry).unwrap(),
                    station_mask: mask,
                    recipe_id: 0,
                }
            })
    }

    #[test]
    fn test_encode_layout() {
        let station = StationRecipe {
            station_no: 3,
            task_id: 2,
            segment_no: 4,
            next_station_id: 5,
            segment_position: 428,
            segment_speed: 1000,
            start_position: 10,
            end_position: 90,
            arrival_delay: 500,
            ferry_position: FerryPosition::Pos2,
            station_mask: true,
            recipe_id: 7,
        };
        assert_eq!(
            station.encode(),
            [0x0203, 0x0504, 428, 1000, 10, 90, 500, 0x0102]
        );
        assert_eq!(station.process_type(), Some(ProcessType::Gluing));
    }

    #[test]
    fn test_decode_rejects_bad_blocks() {
        assert!(StationRecipe::decode(&[0; 7]).is_err());
        let mut block = [0u16; 8];
        block[7] = 0x0003;
        assert!(StationRecipe::decode(&block).is_err());
    }

    #[test]
    fn test_default_stations() {
        let stations = default_stations();
        assert_eq!(stations.len(), 10);
        assert_eq!(stations[0].ferry_position, FerryPosition::Pos1);
        assert_eq!(stations[1].ferry_position, FerryPosition::None);
        assert_eq!(stations[0].next_station_id, 2);
        assert_eq!(stations[9].station_no, 10);
        assert_eq!(stations[9].next_station_id, 1);
        assert_eq!(stations[9].segment_position, 188 + 9 * 120);
        assert!(stations
            .iter()
            .all(|s| s.process_type() == Some(ProcessType::Winding) && s.recipe_id == 1));
    }

    #[test]
    fn test_process_types() {
        assert_eq!(stations_for(ProcessType::Winding), vec![1, 2]);
        assert_eq!(stations_for(ProcessType::Unloading), vec![9, 10]);
        assert_eq!(ProcessType::from_id(3), Some(ProcessType::Welding));
        assert_eq!(ProcessType::from_id(0), None);
        assert_eq!(ProcessType::from_name(" Molding "), Some(ProcessType::Molding));
        assert_eq!(ProcessType::from_name("painting"), None);
    }

    #[test]
    fn test_table_bounds() {
        let mut table = RecipeTable::with_defaults();
        assert!(matches!(
            table.get(10),
            Err(ModbusError::StationIndex { index: 10, count: 10 })
        ));
        let index = table.add(StationRecipe::default());
        assert_eq!(index, 10);
        table.remove(0).unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.get(0).unwrap().station_no, 2);
        assert!(table.update(10, StationRecipe::default()).is_err());
    }

    #[tokio::test]
    async fn test_count_written_before_blocks() {
        let device = Arc::new(SimulatedDevice::new());
        let table = RecipeTable::new(default_stations().into_iter().take(5).collect());

        writer(&device).write_table(&table).await.unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 6);
        assert_eq!(writes[0].address, recipe::STATION_COUNT);
        assert_eq!(writes[0].data, vec![5]);
        for (i, write) in writes[1..].iter().enumerate() {
            assert_eq!(write.function, ModbusFunction::WriteMultipleRegisters);
            assert_eq!(write.address, recipe::BASE + 8 * i as u16);
            assert_eq!(write.data, table.stations()[i].encode().to_vec());
        }
    }

    #[tokio::test]
    async fn test_failed_station_aborts_and_is_named() {
        let device = Arc::new(SimulatedDevice::new());
        // Third station (index 2) fails.
        device.fail_writes_at(Some(recipe::BASE + 2 * 8 + 3));
        let table = RecipeTable::with_defaults();

        let err = writer(&device).write_table(&table).await.unwrap_err();
        match &err {
            ModbusError::TableWrite { step, .. } => {
                assert_eq!(*step, TableWriteStep::Station(2));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("station 3"));
        // Count plus two stations made it; nothing after the failure.
        assert_eq!(device.writes().len(), 3);
        assert_eq!(device.register(recipe::STATION_COUNT), 10);
    }

    #[tokio::test]
    async fn test_failed_count_writes_no_blocks() {
        let device = Arc::new(SimulatedDevice::new());
        device.fail_writes_at(Some(recipe::STATION_COUNT));

        let err = writer(&device)
            .write_table(&RecipeTable::with_defaults())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModbusError::TableWrite {
                step: TableWriteStep::StationCount,
                ..
            }
        ));
        assert!(device.writes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_table_rejected() {
        let device = Arc::new(SimulatedDevice::new());
        let err = writer(&device)
            .write_table(&RecipeTable::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::EmptyTable));
        assert_eq!(device.request_count(), 0);
    }

    #[tokio::test]
    async fn test_station_read_back() {
        let device = Arc::new(SimulatedDevice::new());
        let writer = writer(&device);
        let mut station = default_stations()[3].clone();
        writer.write_station(3, &station).await.unwrap();

        let read = writer.read_station(3).await.unwrap();
        station.recipe_id = 0;
        assert_eq!(read, station);
    }

    proptest! {
        #[test]
        fn prop_station_round_trip(station in station_strategy()) {
            prop_assert_eq!(StationRecipe::decode(&station.encode()).unwrap(), station);
        }
    }
}
