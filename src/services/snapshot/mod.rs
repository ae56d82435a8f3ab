use crate::error::MfResult;
use crate::models::ModelSnapshot;
use crate::utils::validation::validate_snapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies one saved version of the snapshot. Two stamps compare equal
/// only if nothing was saved in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotStamp(String);

impl SnapshotStamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SnapshotStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable home of the single model snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replaces the previous snapshot as one atomic step and returns the
    /// stamp of the version just written.
    async fn save(&self, snapshot: &ModelSnapshot) -> MfResult<SnapshotStamp>;

    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> MfResult<Option<ModelSnapshot>>;

    /// Stamp of the current snapshot without reading it.
    async fn stamp(&self) -> MfResult<Option<SnapshotStamp>>;
}

fn file_stamp(metadata: &std::fs::Metadata) -> SnapshotStamp {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    SnapshotStamp(format!("{}-{}", modified, metadata.len()))
}

/// JSON snapshot on local disk.
///
/// Writes go to a uniquely named sibling file which is fsynced and then
/// renamed over the target, so readers only ever see a complete snapshot.
/// The stamp is the file's modification time and length.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    async fn write_temp(&self, tmp: &Path, bytes: &[u8]) -> MfResult<SnapshotStamp> {
        let mut file = tokio::fs::File::create(tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        // rename keeps the metadata, so this is also the stamp of the target
        Ok(file_stamp(&file.metadata().await?))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &ModelSnapshot) -> MfResult<SnapshotStamp> {
        let bytes = serde_json::to_vec(snapshot)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp = self.temp_path();
        let stamp = match self.write_temp(&tmp, &bytes).await {
            Ok(stamp) => stamp,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(
            path = %self.path.display(),
            n_users = snapshot.n_users,
            n_items = snapshot.n_items,
            bytes = bytes.len(),
            %stamp,
            "Saved model snapshot"
        );
        Ok(stamp)
    }

    async fn load(&self) -> MfResult<Option<ModelSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot on disk");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: ModelSnapshot = serde_json::from_slice(&bytes)?;
        validate_snapshot(&snapshot)?;
        Ok(Some(snapshot))
    }

    async fn stamp(&self) -> MfResult<Option<SnapshotStamp>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => Ok(Some(file_stamp(&metadata))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    bytes: Option<Vec<u8>>,
    saves: usize,
}

/// Keeps the serialized snapshot in memory. Goes through the same JSON
/// encoding as the file store. The stamp is the save counter.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    slot: Mutex<Slot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.slot.lock().saves
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &ModelSnapshot) -> MfResult<SnapshotStamp> {
        let bytes = serde_json::to_vec(snapshot)?;
        let mut slot = self.slot.lock();
        slot.bytes = Some(bytes);
        slot.saves += 1;
        Ok(SnapshotStamp(format!("mem-{}", slot.saves)))
    }

    async fn load(&self) -> MfResult<Option<ModelSnapshot>> {
        let bytes = self.slot.lock().bytes.clone();
        match bytes {
            Some(bytes) => {
                let snapshot: ModelSnapshot = serde_json::from_slice(&bytes)?;
                validate_snapshot(&snapshot)?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn stamp(&self) -> MfResult<Option<SnapshotStamp>> {
        let slot = self.slot.lock();
        Ok(slot
            .bytes
            .as_ref()
            .map(|_| SnapshotStamp(format!("mem-{}", slot.saves))))
    }
}
