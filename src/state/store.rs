use crate::state::run::{RunId, RunState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Error type for state store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Run already exists: {0}")]
    AlreadyExists(RunId),

    #[error("Version conflict on {run_id}: expected {expected}, found {found}")]
    Conflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record for {run_id}: {detail}")]
    Corrupt { run_id: RunId, detail: String },
}

/// Persistence backend for run state.
///
/// Writes use optimistic concurrency: `update` succeeds only when
/// `expected` matches the stored version, so two writers can never both
/// commit against the same snapshot. The drive loop is the only writer
/// for an active run; the version check catches anything that violates
/// that.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Persist a new run. Fails with `AlreadyExists` if the id is taken.
    /// Returns the initial version.
    async fn create(&self, state: &RunState) -> Result<u64, StoreError>;

    /// Replace the stored state if `expected` matches the current
    /// version. Returns the new version.
    async fn update(&self, run_id: &RunId, state: &RunState, expected: u64)
        -> Result<u64, StoreError>;

    /// Load a run and its current version
    async fn get(&self, run_id: &RunId) -> Result<(RunState, u64), StoreError>;

    /// All non-terminal runs for a work item under a given workflow
    async fn list_active(
        &self,
        work_item_id: &str,
        workflow: &str,
    ) -> Result<Vec<RunState>, StoreError>;

    /// Every stored run, any status. Used at startup to find resumable work.
    async fn list_all(&self) -> Result<Vec<RunState>, StoreError>;
}

/// On-disk envelope around a run state. The state is kept as the raw
/// JSON fragment it was written as and the checksum covers exactly
/// those bytes, so a torn or tampered file is detected on load rather
/// than silently resumed from. Hashing a re-serialization would not
/// work: map key order is not stable across serializations.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRun {
    version: u64,
    checksum: String,
    state: Box<serde_json::value::RawValue>,
}

impl PersistedRun {
    fn encode(state: &RunState, version: u64) -> Result<Self, StoreError> {
        let json =
            serde_json::to_string(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let checksum = checksum_of(json.as_bytes());
        let state = serde_json::value::RawValue::from_string(json)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(PersistedRun {
            version,
            checksum,
            state,
        })
    }
}

fn checksum_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// In-memory state store (for testing)
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, (u64, RunState)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            runs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create(&self, state: &RunState) -> Result<u64, StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&state.run_id) {
            return Err(StoreError::AlreadyExists(state.run_id.clone()));
        }
        runs.insert(state.run_id.clone(), (1, state.clone()));
        Ok(1)
    }

    async fn update(
        &self,
        run_id: &RunId,
        state: &RunState,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.clone()))?;

        if entry.0 != expected {
            return Err(StoreError::Conflict {
                run_id: run_id.clone(),
                expected,
                found: entry.0,
            });
        }

        entry.0 += 1;
        entry.1 = state.clone();
        Ok(entry.0)
    }

    async fn get(&self, run_id: &RunId) -> Result<(RunState, u64), StoreError> {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some((version, state)) => Ok((state.clone(), *version)),
            None => Err(StoreError::NotFound(run_id.clone())),
        }
    }

    async fn list_active(
        &self,
        work_item_id: &str,
        workflow: &str,
    ) -> Result<Vec<RunState>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|(_, s)| {
                s.work_item_id() == work_item_id
                    && s.workflow == workflow
                    && !s.status.is_terminal()
            })
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<RunState>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs.values().map(|(_, s)| s.clone()).collect())
    }
}

/// File-backed state store. One JSON file per run, written via a
/// temporary file, fsynced, then atomically renamed into place so a
/// crash mid-write leaves the previous snapshot intact.
pub struct FileStore {
    base_dir: PathBuf,
    // Serializes read-check-write so the version compare and the rename
    // happen as one step
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_dir: PathBuf) -> Self {
        FileStore {
            base_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    async fn write_record(&self, run_id: &RunId, record: &PersistedRun) -> Result<(), StoreError> {
        let path = self.path_for(run_id);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &data).await?;

        let file = tokio::fs::File::open(&temp_path).await?;
        file.sync_all().await?;

        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn read_record(&self, run_id: &RunId) -> Result<(u64, RunState), StoreError> {
        let path = self.path_for(run_id);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.clone()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        let record: PersistedRun = serde_json::from_slice(&data).map_err(|e| {
            StoreError::Corrupt {
                run_id: run_id.clone(),
                detail: e.to_string(),
            }
        })?;

        let actual = checksum_of(record.state.get().as_bytes());
        if actual != record.checksum {
            return Err(StoreError::Corrupt {
                run_id: run_id.clone(),
                detail: format!("checksum mismatch: stored {}, computed {actual}", record.checksum),
            });
        }

        let state: RunState =
            serde_json::from_str(record.state.get()).map_err(|e| StoreError::Corrupt {
                run_id: run_id.clone(),
                detail: e.to_string(),
            })?;

        Ok((record.version, state))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn create(&self, state: &RunState) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        match self.read_record(&state.run_id).await {
            Ok(_) => return Err(StoreError::AlreadyExists(state.run_id.clone())),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let record = PersistedRun::encode(state, 1)?;
        self.write_record(&state.run_id, &record).await?;
        Ok(1)
    }

    async fn update(
        &self,
        run_id: &RunId,
        state: &RunState,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;

        let (found, _) = self.read_record(run_id).await?;
        if found != expected {
            return Err(StoreError::Conflict {
                run_id: run_id.clone(),
                expected,
                found,
            });
        }

        let record = PersistedRun::encode(state, expected + 1)?;
        self.write_record(run_id, &record).await?;
        Ok(record.version)
    }

    async fn get(&self, run_id: &RunId) -> Result<(RunState, u64), StoreError> {
        let (version, state) = self.read_record(run_id).await?;
        Ok((state, version))
    }

    async fn list_active(
        &self,
        work_item_id: &str,
        workflow: &str,
    ) -> Result<Vec<RunState>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|s| {
                s.work_item_id() == work_item_id
                    && s.workflow == workflow
                    && !s.status.is_terminal()
            })
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<RunState>, StoreError> {
        let mut states = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(states),
            Err(e) => return Err(StoreError::Io(e)),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let (_, state) = self.read_record(&RunId::from(stem)).await?;
            states.push(state);
        }

        Ok(states)
    }
}
