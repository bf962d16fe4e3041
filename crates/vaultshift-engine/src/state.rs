//! Durable run state
//!
//! A [`RunState`] is written as one JSON document. Saves go to a temporary
//! file next to the target, are flushed to disk, and then renamed over the
//! target, so readers only ever see a complete previous or complete new file.

use crate::task::{MigrationTask, TaskState};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use vaultshift_types::{Error, Item, ItemId, Result};

/// Version of the state file layout written by this build
pub const SCHEMA_VERSION: u32 = 1;

const FILE_PREFIX: &str = ".vaultshift-";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Accounts and vaults a run migrates between
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    /// Account owning the source vault
    pub source_account: String,
    /// Account owning the destination vault
    pub dest_account: String,
    /// Source vault name
    pub source_vault: String,
    /// Destination vault reference
    pub dest_vault: String,
}

/// The persisted unit of a run: frozen inventory plus every task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Layout version, checked before anything else is read
    pub schema_version: u32,
    /// Identity of the run, stable across resumes
    pub run_id: Uuid,
    /// What is being migrated
    pub context: RunContext,
    /// Inventory as loaded when the run was created
    pub inventory: Vec<Item>,
    /// One task per inventory item
    pub tasks: BTreeMap<ItemId, MigrationTask>,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// When the state was last saved
    pub updated_at: DateTime<Utc>,
}

/// Borrowed view of a [`RunState`] with the same serialized layout
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RunStateView<'a> {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub context: &'a RunContext,
    pub inventory: &'a [Item],
    pub tasks: &'a BTreeMap<ItemId, MigrationTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Create a fresh run with one pending task per item
    pub fn new(context: RunContext, inventory: Vec<Item>) -> Self {
        let now = Utc::now();
        let tasks = inventory
            .iter()
            .map(|item| (item.id.clone(), MigrationTask::new(item.id.clone())))
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            context,
            inventory,
            tasks,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check that tasks and inventory describe the same set of items
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.tasks.len() != self.inventory.len() {
            return Err(format!(
                "{} tasks for {} inventory items",
                self.tasks.len(),
                self.inventory.len()
            ));
        }
        for item in &self.inventory {
            match self.tasks.get(&item.id) {
                Some(task) if task.item_id == item.id => {}
                Some(_) => return Err(format!("task key {} does not match its item", item.id)),
                None => return Err(format!("no task for item {}", item.id)),
            }
        }
        Ok(())
    }

    /// Number of tasks in each state
    pub fn state_counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn view(&self) -> RunStateView<'_> {
        RunStateView {
            schema_version: self.schema_version,
            run_id: self.run_id,
            context: &self.context,
            inventory: &self.inventory,
            tasks: &self.tasks,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Reads and atomically writes one state file
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given state file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the state file exists
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Atomically replace the state file with `state`
    pub fn save(&self, state: &RunState) -> Result<()> {
        self.save_view(&state.view())
    }

    pub(crate) fn save_view(&self, view: &RunStateView<'_>) -> Result<()> {
        let tmp = self.write_temp(view)?;
        self.commit(&tmp)?;
        debug!(path = %self.path.display(), tasks = view.tasks.len(), "State saved");
        Ok(())
    }

    /// Load and validate the state file
    pub fn load(&self) -> Result<RunState> {
        Self::load_from(&self.path)
    }

    /// Load and validate a state file
    pub fn load_from(path: &Path) -> Result<RunState> {
        let raw = fs::read_to_string(path)?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| Error::state_corrupt(path, e.to_string()))?;

        let version = value
            .get("schemaVersion")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::state_corrupt(path, "missing schemaVersion"))?;
        if version != u64::from(SCHEMA_VERSION) {
            return Err(Error::SchemaMismatch {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                expected: SCHEMA_VERSION,
            });
        }

        let state: RunState =
            serde_json::from_value(value).map_err(|e| Error::state_corrupt(path, e.to_string()))?;
        state
            .validate()
            .map_err(|message| Error::state_corrupt(path, message))?;

        info!(
            path = %path.display(),
            run_id = %state.run_id,
            tasks = state.tasks.len(),
            "State loaded"
        );
        Ok(state)
    }

    /// Default state file name for a run started at `started`
    pub fn default_file_name(context: &RunContext, started: DateTime<Utc>) -> String {
        format!(
            "{}{}.json",
            Self::file_prefix(context),
            started.format(TIMESTAMP_FORMAT)
        )
    }

    /// Newest state file in `dir` for the given account and vault
    pub fn discover_latest(dir: &Path, context: &RunContext) -> Result<Option<PathBuf>> {
        let prefix = Self::file_prefix(context);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<(String, PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(stamp) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            if NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_err() {
                continue;
            }
            let is_newer = match &newest {
                Some((best, _)) => name > *best,
                None => true,
            };
            if is_newer {
                newest = Some((name, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn file_prefix(context: &RunContext) -> String {
        format!(
            "{}{}-{}-",
            FILE_PREFIX,
            sanitize(&context.source_account),
            sanitize(&context.source_vault)
        )
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("state.json");
        self.path
            .with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
    }

    fn write_temp(&self, view: &RunStateView<'_>) -> Result<PathBuf> {
        if let Some(parent) = self.parent_dir() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, view)
            .map_err(|e| Error::other(format!("Failed to encode state: {}", e)))?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| Error::from(e.into_error()))?
            .sync_all()?;
        Ok(tmp)
    }

    fn commit(&self, tmp: &Path) -> Result<()> {
        fs::rename(tmp, &self.path)?;
        #[cfg(unix)]
        if let Some(parent) = self.parent_dir() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    fn parent_dir(&self) -> Option<&Path> {
        self.path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
