//! Durable on-disk store of capture records.
//!
//! The whole collection is persisted as a JSON array in `captures.json`.
//! Every mutation rewrites the file with a tmp-write + fsync + rename, so a
//! crash mid-write leaves the previous file intact. Image bytes live next to
//! it in `images/`, one file per record.
//!
//! # Concurrency
//!
//! Mutations are serialized by a writer lock. Readers never wait on a
//! write in progress: they clone an `Arc` of the last committed snapshot.
//! The in-memory snapshot only advances after the file write succeeds.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::types::{CaptureRecord, SyncStatus};
use crate::{MealSyncError, Result};

const RECORDS_FILE: &str = "captures.json";
const IMAGES_DIR: &str = "images";

/// Where the store keeps its files.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding `captures.json` and `images/`.
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
        }
    }
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Default data directory: `<platform data dir>/mealsync`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("mealsync")
}

/// Atomic, crash-safe record store.
pub struct RecordStore {
    path: PathBuf,
    images: PathBuf,
    writer: Mutex<()>,
    snapshot: RwLock<Arc<Vec<CaptureRecord>>>,
    /// Entries this version cannot read, written back verbatim on every commit.
    preserved: Vec<Value>,
    preserved_ids: HashSet<String>,
}

impl RecordStore {
    /// Open (or create) the store under `config.dir`.
    ///
    /// A corrupt records file never fails the open: it is moved aside to
    /// `captures.json.corrupt` and the store starts empty. Individual entries
    /// that do not parse (for example, written by a newer version) are hidden
    /// from readers but kept in the file untouched.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let images = config.dir.join(IMAGES_DIR);
        fs::create_dir_all(&images).map_err(|e| {
            MealSyncError::Storage(format!("failed to create {}: {e}", images.display()))
        })?;
        let path = config.dir.join(RECORDS_FILE);
        let Loaded { records, preserved } = load_records(&path);
        info!(
            path = %path.display(),
            records = records.len(),
            unreadable = preserved.len(),
            "opened record store"
        );
        let preserved_ids = preserved
            .iter()
            .filter_map(|v| v.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        Ok(Self {
            path,
            images,
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(records)),
            preserved,
            preserved_ids,
        })
    }

    /// Path of the records file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding image blobs.
    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    /// Current committed records, oldest first by insertion.
    pub fn snapshot(&self) -> Arc<Vec<CaptureRecord>> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries this version could not read.
    pub fn unreadable_len(&self) -> usize {
        self.preserved.len()
    }

    /// Insert a new record. Durable once this returns `Ok`.
    pub fn put(&self, record: CaptureRecord) -> Result<()> {
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id)
                || self.preserved_ids.contains(&record.id)
            {
                return Err(MealSyncError::DuplicateRecord(record.id.clone()));
            }
            debug!(id = %record.id, "storing capture record");
            records.push(record);
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Option<CaptureRecord> {
        self.snapshot().iter().find(|r| r.id == id).cloned()
    }

    /// Apply `mutator` to the record and persist. Returns the updated copy.
    ///
    /// The mutator must not change the record's id.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<CaptureRecord>
    where
        F: FnOnce(&mut CaptureRecord),
    {
        self.mutate(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| MealSyncError::RecordNotFound(id.to_string()))?;
            mutator(record);
            record.id = id.to_string();
            Ok(record.clone())
        })
    }

    /// Apply `mutator` to every record matching `predicate` in one atomic write.
    ///
    /// Returns the ids that were changed. Nothing is written when none match.
    pub fn update_where<P, F>(&self, mut predicate: P, mut mutator: F) -> Result<Vec<String>>
    where
        P: FnMut(&CaptureRecord) -> bool,
        F: FnMut(&mut CaptureRecord),
    {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = self.snapshot().as_ref().clone();
        let mut changed = Vec::new();
        for record in records.iter_mut().filter(|r| predicate(r)) {
            let id = record.id.clone();
            mutator(record);
            record.id = id.clone();
            changed.push(id);
        }
        if !changed.is_empty() {
            self.commit(records)?;
        }
        Ok(changed)
    }

    /// Remove a record and its image blob. Returns the removed record.
    pub fn delete(&self, id: &str) -> Result<Option<CaptureRecord>> {
        let removed = self.remove_where(|r| r.id == id)?;
        Ok(removed.into_iter().next())
    }

    /// Remove every record matching `predicate`, plus their blobs.
    pub fn remove_where<P>(&self, mut predicate: P) -> Result<Vec<CaptureRecord>>
    where
        P: FnMut(&CaptureRecord) -> bool,
    {
        let removed = {
            let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            let (removed, kept): (Vec<_>, Vec<_>) = self
                .snapshot()
                .iter()
                .cloned()
                .partition(|r| predicate(r));
            if !removed.is_empty() {
                self.commit(kept)?;
            }
            removed
        };
        for record in &removed {
            if let Some(blob) = record.blob() {
                self.remove_blob(blob);
            }
        }
        Ok(removed)
    }

    /// Records in `status`, oldest capture first.
    pub fn list_by_state(&self, status: SyncStatus) -> Vec<CaptureRecord> {
        let mut records: Vec<_> = self
            .snapshot()
            .iter()
            .filter(|r| r.status() == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Records whose status is any of `statuses`, oldest capture first.
    pub fn list_by_states(&self, statuses: &[SyncStatus]) -> Vec<CaptureRecord> {
        let wanted: HashSet<_> = statuses.iter().copied().collect();
        let mut records: Vec<_> = self
            .snapshot()
            .iter()
            .filter(|r| wanted.contains(&r.status()))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    // ========================================================================
    // Image blobs
    // ========================================================================

    /// Write image bytes for `id`. Returns the blob file name.
    pub fn write_blob(&self, id: &str, extension: &str, bytes: &[u8]) -> Result<String> {
        let name = format!("{id}.{extension}");
        let path = self.images.join(&name);
        write_atomic(&path, bytes)?;
        Ok(name)
    }

    /// Read image bytes for a blob name.
    pub async fn read_blob(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.images.join(name);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MealSyncError::InvalidInput(format!("image blob {name} is missing"))
            } else {
                MealSyncError::Storage(format!("failed to read {}: {e}", path.display()))
            }
        })
    }

    /// Best-effort blob removal; a leftover file never fails a delete.
    pub fn remove_blob(&self, name: &str) {
        let path = self.images.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove image blob"),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Copy the snapshot, apply `f`, persist, then publish the new snapshot.
    fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<CaptureRecord>) -> Result<T>,
    {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut records = self.snapshot().as_ref().clone();
        let out = f(&mut records)?;
        self.commit(records)?;
        Ok(out)
    }

    /// Persist `records` and publish them. Caller holds the writer lock.
    fn commit(&self, records: Vec<CaptureRecord>) -> Result<()> {
        let mut entries = records
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        entries.extend(self.preserved.iter().cloned());
        let json = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.path, &json)?;
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *snapshot = Arc::new(records);
        Ok(())
    }
}

/// Write `bytes` to `path` via a synced tmp file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        // Persist the rename itself.
        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        MealSyncError::Storage(format!("failed to write {}: {e}", path.display()))
    })
}

#[derive(Default)]
struct Loaded {
    records: Vec<CaptureRecord>,
    preserved: Vec<Value>,
}

/// Load records, degrading to empty on a corrupt file.
///
/// Entries that do not parse, and repeats of an id already loaded, are
/// returned raw in `preserved` so the next commit writes them back.
fn load_records(path: &Path) -> Loaded {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read record store, starting empty");
            return Loaded::default();
        }
    };

    let values = match serde_json::from_slice::<Value>(&content) {
        Ok(Value::Array(values)) => values,
        Ok(_) => {
            quarantine(path, "records file is not a JSON array");
            return Loaded::default();
        }
        Err(e) => {
            quarantine(path, &e.to_string());
            return Loaded::default();
        }
    };

    let mut seen = HashSet::new();
    let mut loaded = Loaded::default();
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<CaptureRecord>(value.clone()) {
            Ok(record) if seen.insert(record.id.clone()) => loaded.records.push(record),
            Ok(record) => {
                warn!(id = %record.id, "duplicate record id in store, keeping the first");
                loaded.preserved.push(value);
            }
            Err(e) => {
                warn!(index, error = %e, "unreadable capture record, keeping it as is");
                loaded.preserved.push(value);
            }
        }
    }
    loaded
}

/// Move a corrupt records file aside so it can be inspected later.
fn quarantine(path: &Path, reason: &str) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    let aside = PathBuf::from(aside);
    warn!(
        path = %path.display(),
        moved_to = %aside.display(),
        reason,
        "record store is corrupt, starting empty"
    );
    if let Err(e) = fs::rename(path, &aside) {
        warn!(path = %path.display(), error = %e, "failed to move corrupt record store aside");
    }
}
