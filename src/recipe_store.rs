//! # Complete-recipe store
//!
//! Holds the working station table plus named snapshots of it ("complete
//! recipes"). Everything here is in memory or on disk; the controller is
//! only touched by the explicit device paths ([`RecipeStore::save_all`],
//! [`RecipeStore::save_station`], [`RecipeStore::apply`]).
//!
//! The file format is one JSON document:
//!
//! ```json
//! {
//!   "stations": [ { "stationNo": 1, "taskId": 1, ... } ],
//!   "completeRecipes": {
//!     "line A": {
//!       "recipeName": "line A",
//!       "description": "",
//!       "createTime": "2024-05-01T08:00:00Z",
//!       "modifyTime": "2024-05-01T08:00:00Z",
//!       "stationRecipes": [ ... ]
//!     }
//!   },
//!   "currentCompleteRecipeName": "line A"
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ModbusError, ModbusResult};
use crate::recipe::{RecipeTable, RecipeWriter, StationRecipe};
use crate::transport::RegisterTransport;

/// Named snapshot of a whole station table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRecipe {
    pub recipe_name: String,
    #[serde(default)]
    pub description: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    #[serde(default)]
    pub station_recipes: Vec<StationRecipe>,
}

impl CompleteRecipe {
    pub fn is_valid(&self) -> bool {
        !self.recipe_name.is_empty() && !self.station_recipes.is_empty()
    }

    pub fn station_count(&self) -> usize {
        self.station_recipes.len()
    }
}

/// What changed in the store, for event consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeChange {
    StationAdded(usize),
    StationUpdated(usize),
    StationRemoved(usize),
    Saved(String),
    Loaded(String),
    Deleted(String),
    Renamed { from: String, to: String },
    Applied(String),
    FileLoaded,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RecipeDocument {
    stations: RecipeTable,
    complete_recipes: BTreeMap<String, CompleteRecipe>,
    current_complete_recipe_name: String,
}

/// Working station table and named recipes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeStore {
    table: RecipeTable,
    recipes: BTreeMap<String, CompleteRecipe>,
    current: Option<String>,
}

impl Default for RecipeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeStore {
    /// Store with the default ten-station table and no saved recipes
    pub fn new() -> Self {
        Self::with_table(RecipeTable::with_defaults())
    }

    pub fn with_table(table: RecipeTable) -> Self {
        Self {
            table,
            recipes: BTreeMap::new(),
            current: None,
        }
    }

    pub fn table(&self) -> &RecipeTable {
        &self.table
    }

    pub fn station(&self, index: usize) -> ModbusResult<&StationRecipe> {
        self.table.get(index)
    }

    pub fn add_station(&mut self, station: StationRecipe) -> usize {
        self.table.add(station)
    }

    pub fn update_station(&mut self, index: usize, station: StationRecipe) -> ModbusResult<()> {
        self.table.update(index, station)
    }

    pub fn remove_station(&mut self, index: usize) -> ModbusResult<StationRecipe> {
        self.table.remove(index)
    }

    /// Name of the recipe last saved, loaded or applied
    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Saved recipe names, sorted
    pub fn names(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&CompleteRecipe> {
        self.recipes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.recipes.contains_key(name)
    }

    fn require(&self, name: &str) -> ModbusResult<&CompleteRecipe> {
        self.recipes.get(name).ok_or_else(|| ModbusError::RecipeNotFound {
            name: name.to_string(),
        })
    }

    /// Snapshot the working table under `name`.
    ///
    /// Overwriting keeps the original creation time.
    pub fn save(&mut self, name: &str, description: &str) -> ModbusResult<&CompleteRecipe> {
        self.save_at(name, description, Utc::now())
    }

    pub fn save_at(
        &mut self,
        name: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> ModbusResult<&CompleteRecipe> {
        if name.trim().is_empty() {
            return Err(ModbusError::EmptyRecipeName);
        }
        let create_time = self
            .recipes
            .get(name)
            .map_or(now, |existing| existing.create_time);
        let recipe = CompleteRecipe {
            recipe_name: name.to_string(),
            description: description.to_string(),
            create_time,
            modify_time: now,
            station_recipes: self.table.stations().to_vec(),
        };
        self.current = Some(name.to_string());
        info!("Recipe '{}' saved ({} stations)", name, recipe.station_count());
        self.recipes.insert(name.to_string(), recipe);
        self.require(name)
    }

    /// Replace the working table with a saved recipe. No device I/O.
    pub fn load(&mut self, name: &str) -> ModbusResult<()> {
        let stations = self.require(name)?.station_recipes.clone();
        self.table.replace(stations);
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> ModbusResult<CompleteRecipe> {
        let removed = self
            .recipes
            .remove(name)
            .ok_or_else(|| ModbusError::RecipeNotFound {
                name: name.to_string(),
            })?;
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        Ok(removed)
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> ModbusResult<()> {
        if new_name.trim().is_empty() {
            return Err(ModbusError::EmptyRecipeName);
        }
        self.require(old_name)?;
        if self.recipes.contains_key(new_name) {
            return Err(ModbusError::RecipeExists {
                name: new_name.to_string(),
            });
        }
        if let Some(mut recipe) = self.recipes.remove(old_name) {
            recipe.recipe_name = new_name.to_string();
            recipe.modify_time = Utc::now();
            self.recipes.insert(new_name.to_string(), recipe);
        }
        if self.current.as_deref() == Some(old_name) {
            self.current = Some(new_name.to_string());
        }
        Ok(())
    }

    // ========================================================================
    // Device paths
    // ========================================================================

    /// Write the whole working table to the controller
    pub async fn save_all<T: RegisterTransport>(&self, writer: &RecipeWriter<T>) -> ModbusResult<()> {
        writer.write_table(&self.table).await
    }

    /// Update one station in the working table and write its block
    pub async fn save_station<T: RegisterTransport>(
        &mut self,
        index: usize,
        station: StationRecipe,
        writer: &RecipeWriter<T>,
    ) -> ModbusResult<()> {
        self.table.update(index, station)?;
        writer.write_station(index, self.table.get(index)?).await
    }

    /// Load `name` into the working table, then write the table.
    ///
    /// On a write failure the working table still holds the recipe and the
    /// controller may hold part of it.
    pub async fn apply<T: RegisterTransport>(
        &mut self,
        name: &str,
        writer: &RecipeWriter<T>,
    ) -> ModbusResult<()> {
        self.load(name)?;
        self.save_all(writer).await
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn to_json(&self) -> ModbusResult<String> {
        let document = RecipeDocument {
            stations: self.table.clone(),
            complete_recipes: self.recipes.clone(),
            current_complete_recipe_name: self.current.clone().unwrap_or_default(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Replace the whole store with the contents of a JSON document
    pub fn load_json(&mut self, json: &str) -> ModbusResult<()> {
        let document: RecipeDocument = serde_json::from_str(json)?;
        self.table = document.stations;
        self.recipes = document.complete_recipes;
        self.current = Some(document.current_complete_recipe_name).filter(|n| !n.is_empty());
        Ok(())
    }

    /// Write the store to `path`, creating parent directories
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        info!("Recipe data saved to {}", path.display());
        Ok(())
    }

    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> ModbusResult<()> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        self.load_json(&json)?;
        info!(
            "Recipe data loaded from {} ({} recipes)",
            path.display(),
            self.recipes.len()
        );
        Ok(())
    }
}
