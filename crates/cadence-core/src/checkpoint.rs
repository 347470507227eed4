//! Versioned snapshots of a run and their on-disk form.
//!
//! A [`Snapshot`] is taken synchronously at a tick boundary, so it never
//! observes a partially applied tick. Its `tick` is the next tick to
//! execute. Together with the random stream position and the entity id
//! counter this is enough for a restored run to reproduce the
//! uninterrupted one, given the same unit set and the same external call
//! results.
//!
//! Files are written atomically (temp file, fsync, rename). A `.gz`
//! extension selects gzip compression on both save and load.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use cadence_store::{RecordRegistry, StateStore, StoreError};
use cadence_types::{EntityId, RngState, RunId};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CheckpointConfig;
use crate::scheduler::SchedulerState;

/// Format version written by this build. Any other version is refused.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "checkpoint-";

/// Errors raised while capturing, storing or restoring snapshots.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The document was written by an incompatible format version.
    #[error("incompatible snapshot version {found} (this build reads version {expected})")]
    IncompatibleSnapshotVersion {
        /// Version found in the document.
        found: u64,
        /// Version this build understands.
        expected: u32,
    },

    /// The document lacks required structure.
    #[error("malformed snapshot: {reason}")]
    Malformed {
        /// What is wrong.
        reason: String,
    },

    /// A record in the document has a kind with no registered decoder.
    #[error("snapshot entity {entity_id} holds unknown record kind {kind}")]
    UnknownRecordKind {
        /// Entity holding the record.
        entity_id: EntityId,
        /// Unregistered kind name.
        kind: String,
    },

    /// The restored entities are inconsistent.
    #[error("store error: {source}")]
    Store {
        /// Underlying store error.
        #[from]
        source: StoreError,
    },

    /// JSON encoding or decoding failed.
    #[error("snapshot JSON error: {source}")]
    Json {
        /// Underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// Reading or writing a checkpoint file failed.
    #[error("checkpoint I/O error at {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl CheckpointError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One serialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Registered kind name.
    #[serde(rename = "type")]
    pub kind: String,
    /// Serialization form of the record.
    pub data: Value,
}

/// One serialized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity identifier.
    pub id: EntityId,
    /// Every record attached to the entity.
    pub records: Vec<RecordSnapshot>,
}

/// Versioned document capturing a run at a tick boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Always [`SNAPSHOT_FORMAT_VERSION`] when written by this build.
    pub format_version: u32,
    /// Run the snapshot belongs to.
    pub run_id: RunId,
    /// Wall-clock capture time.
    pub created_at: DateTime<Utc>,
    /// Next tick to execute.
    pub tick: u64,
    /// Position of the run's random stream.
    pub rng_state: RngState,
    /// Next entity id the store would issue.
    pub next_entity_id: EntityId,
    /// Next action key the protocol would issue.
    #[serde(default)]
    pub next_action_key: u64,
    /// Per-unit failure counters.
    #[serde(default)]
    pub scheduler: SchedulerState,
    /// Every live entity, ascending by id.
    pub entities: Vec<EntitySnapshot>,
}

/// Everything [`Snapshot::restore`] rebuilds.
#[derive(Debug)]
pub struct Restored {
    /// The rebuilt store.
    pub store: StateStore,
    /// Next tick to execute.
    pub tick: u64,
    /// Random stream position to resume from.
    pub rng_state: RngState,
    /// Run the snapshot belongs to.
    pub run_id: RunId,
    /// Per-unit failure counters.
    pub scheduler: SchedulerState,
    /// Next action key to issue.
    pub next_action_key: u64,
}

impl Snapshot {
    /// Capture `store` as it is now.
    pub fn capture(
        store: &StateStore,
        tick: u64,
        rng_state: RngState,
        run_id: RunId,
    ) -> Result<Self, CheckpointError> {
        let mut entities = Vec::with_capacity(store.entity_count());
        for id in store.entities() {
            let records = store
                .records_of(id)
                .map(|record| {
                    Ok(RecordSnapshot {
                        kind: record.kind().as_str().to_owned(),
                        data: record.to_value()?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            entities.push(EntitySnapshot { id, records });
        }

        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            run_id,
            created_at: Utc::now(),
            tick,
            rng_state,
            next_entity_id: store.next_entity_id(),
            next_action_key: 0,
            scheduler: SchedulerState::default(),
            entities,
        })
    }

    /// Attach scheduler failure counters.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerState) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Record the protocol's next action key.
    #[must_use]
    pub const fn with_next_action_key(mut self, next_action_key: u64) -> Self {
        self.next_action_key = next_action_key;
        self
    }

    /// Number of entities captured.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Rebuild the store, decoding records through `registry`.
    ///
    /// Nothing is restored unless every record decodes.
    pub fn restore(self, registry: &RecordRegistry) -> Result<Restored, CheckpointError> {
        check_version(u64::from(self.format_version))?;

        let mut entities = Vec::with_capacity(self.entities.len());
        for entity in self.entities {
            let records = entity
                .records
                .into_iter()
                .map(|record| {
                    registry.decode(&record.kind, record.data).map_err(|e| match e {
                        StoreError::UnknownRecordKind { kind } => CheckpointError::UnknownRecordKind {
                            entity_id: entity.id,
                            kind,
                        },
                        other => CheckpointError::from(other),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            entities.push((entity.id, records));
        }
        let store = StateStore::from_parts(entities, self.next_entity_id)?;

        Ok(Restored {
            store,
            tick: self.tick,
            rng_state: self.rng_state,
            run_id: self.run_id,
            scheduler: self.scheduler,
            next_action_key: self.next_action_key,
        })
    }

    /// Encode as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode a JSON document, checking the format version before
    /// anything else.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let value: Value = serde_json::from_str(json)?;
        let found = value
            .get("formatVersion")
            .and_then(Value::as_u64)
            .ok_or_else(|| CheckpointError::Malformed {
                reason: "missing or non-numeric formatVersion".to_owned(),
            })?;
        check_version(found)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Write to `path` atomically, gzipped when it ends in `.gz`.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = self.to_json()?;
        let tmp_path = path.with_extension("tmp");

        {
            let tmp_file = File::create(&tmp_path).map_err(CheckpointError::io(&tmp_path))?;
            let file = if is_compressed(path) {
                let mut encoder = GzEncoder::new(tmp_file, Compression::default());
                encoder
                    .write_all(json.as_bytes())
                    .map_err(CheckpointError::io(&tmp_path))?;
                encoder.finish().map_err(CheckpointError::io(&tmp_path))?
            } else {
                let mut file = tmp_file;
                file.write_all(json.as_bytes())
                    .map_err(CheckpointError::io(&tmp_path))?;
                file
            };
            file.sync_all().map_err(CheckpointError::io(&tmp_path))?;
        }

        fs::rename(&tmp_path, path).map_err(CheckpointError::io(path))?;
        Ok(())
    }

    /// Read from `path`, gunzipping when it ends in `.gz`.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let file = File::open(path).map_err(CheckpointError::io(path))?;
        let mut json = String::new();
        if is_compressed(path) {
            GzDecoder::new(file)
                .read_to_string(&mut json)
                .map_err(CheckpointError::io(path))?;
        } else {
            let mut file = file;
            file.read_to_string(&mut json)
                .map_err(CheckpointError::io(path))?;
        }
        Self::from_json(&json)
    }
}

fn check_version(found: u64) -> Result<(), CheckpointError> {
    if found == u64::from(SNAPSHOT_FORMAT_VERSION) {
        Ok(())
    } else {
        Err(CheckpointError::IncompatibleSnapshotVersion {
            found,
            expected: SNAPSHOT_FORMAT_VERSION,
        })
    }
}

fn is_compressed(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("gz")
}

/// Writes periodic checkpoints and prunes old ones.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    config: CheckpointConfig,
}

impl CheckpointManager {
    /// Create a manager for `config`.
    pub const fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub const fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Whether a checkpoint is due once `completed` ticks have run.
    pub fn due(&self, completed: u64) -> bool {
        completed > 0 && completed.checked_rem(self.config.interval) == Some(0)
    }

    /// File path for a checkpoint whose next tick is `tick`.
    ///
    /// The tick is zero-padded so names sort chronologically.
    pub fn path_for(&self, tick: u64) -> PathBuf {
        let extension = if self.config.compress { "json.gz" } else { "json" };
        self.config
            .directory
            .join(format!("{FILE_PREFIX}{tick:020}.{extension}"))
    }

    /// Save `snapshot` into the checkpoint directory, then prune.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.config.directory)
            .map_err(CheckpointError::io(&self.config.directory))?;
        let path = self.path_for(snapshot.tick);
        snapshot.save(&path)?;
        info!(
            tick = snapshot.tick,
            entities = snapshot.entity_count(),
            path = %path.display(),
            "Checkpoint written"
        );
        self.prune()?;
        Ok(path)
    }

    /// Delete checkpoints beyond the newest `keep_last`. Returns how many
    /// were deleted.
    pub fn prune(&self) -> Result<usize, CheckpointError> {
        if self.config.keep_last == 0 {
            return Ok(0);
        }
        let checkpoints = list_checkpoints(&self.config.directory)?;
        let excess = checkpoints.len().saturating_sub(self.config.keep_last);
        let mut deleted = 0_usize;
        for path in checkpoints.iter().take(excess) {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted old checkpoint");
                    deleted = deleted.saturating_add(1);
                }
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to delete old checkpoint"),
            }
        }
        Ok(deleted)
    }
}

/// Checkpoint files in `directory`, oldest first.
pub fn list_checkpoints(directory: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
    let entries = fs::read_dir(directory).map_err(CheckpointError::io(directory))?;
    let mut checkpoints = Vec::new();
    for entry in entries {
        let path = entry.map_err(CheckpointError::io(directory))?.path();
        if !path.is_file() {
            continue;
        }
        let is_checkpoint = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.starts_with(FILE_PREFIX)
                    && (name.ends_with(".json") || name.ends_with(".json.gz"))
            });
        if is_checkpoint {
            checkpoints.push(path);
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

/// The newest checkpoint in `directory`, if any.
pub fn latest_checkpoint(directory: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    Ok(list_checkpoints(directory)?.pop())
}
