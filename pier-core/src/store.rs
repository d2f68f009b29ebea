// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Durable pier records.
//!
//! One record per pier. `running` is never stored: liveness is re-derived
//! at startup from `last_pid`, which is only a probe hint.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::boot::PierStatus;
use crate::error::{HardValidationError, PierError, PierResult};
use crate::types::{PierId, Port, PortPair};

/// Persisted state of one pier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PierRecord {
    pub id: PierId,
    pub directory: PathBuf,
    pub web_port: u16,
    pub loopback_port: u16,
    pub booted: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Unix milliseconds.
    pub created_at: u64,
    #[serde(default)]
    pub last_started_at: Option<u64>,
    /// Pid of the last process started for this pier, while it runs.
    #[serde(default)]
    pub last_pid: Option<u32>,
}

impl PierRecord {
    pub fn ports(&self) -> Result<PortPair, HardValidationError> {
        PortPair::new(Port::new(self.web_port)?, Port::new(self.loopback_port)?)
    }
}

/// Read-only view of a pier handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PierSnapshot {
    pub id: PierId,
    pub directory: PathBuf,
    pub web_port: u16,
    pub loopback_port: u16,
    pub booted: bool,
    pub running: bool,
    pub status: PierStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub last_started_at: Option<u64>,
}

/// Where pier records live.
pub trait PierStore: Send + Sync + std::fmt::Debug {
    /// Every stored record.
    fn load_all(&self) -> PierResult<Vec<PierRecord>>;

    /// Insert or replace the record for `record.id`.
    fn save(&self, record: &PierRecord) -> PierResult<()>;

    /// Remove the record for `id`. Removing an absent record is not an error.
    fn remove(&self, id: &PierId) -> PierResult<()>;
}

/// One JSON file per pier under a directory, replaced atomically.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> PierResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| unavailable(format!("create {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &PierId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

fn unavailable(context: String, source: std::io::Error) -> PierError {
    PierError::StoreUnavailable { context, source }
}

impl PierStore for FileStore {
    fn load_all(&self) -> PierResult<Vec<PierRecord>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| unavailable(format!("read {}", self.dir.display()), e))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| unavailable(format!("read {}", self.dir.display()), e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let content = fs::read_to_string(&path)
                .map_err(|e| unavailable(format!("read {}", path.display()), e))?;
            match serde_json::from_str::<PierRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable pier record");
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn save(&self, record: &PierRecord) -> PierResult<()> {
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let context = || format!("write {}", path.display());

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| {
            unavailable(context(), std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut file = fs::File::create(&tmp).map_err(|e| unavailable(context(), e))?;
        file.write_all(&bytes).map_err(|e| unavailable(context(), e))?;
        file.sync_all().map_err(|e| unavailable(context(), e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| unavailable(context(), e))?;

        tracing::trace!(pier_id = %record.id, path = %path.display(), "Saved pier record");
        Ok(())
    }

    fn remove(&self, id: &PierId) -> PierResult<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(format!("remove {}", path.display()), e)),
        }
    }
}

/// In-process store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<PierId, PierRecord>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = PierRecord>) -> Self {
        let store = Self::new();
        store
            .lock()
            .extend(records.into_iter().map(|r| (r.id.clone(), r)));
        store
    }

    /// Make every subsequent write fail with `StoreUnavailable`.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn get(&self, id: &PierId) -> Option<PierRecord> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PierId, PierRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self, what: &str) -> PierResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(unavailable(
                what.to_string(),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "store is read-only"),
            ));
        }
        Ok(())
    }
}

impl PierStore for MemoryStore {
    fn load_all(&self) -> PierResult<Vec<PierRecord>> {
        let mut records: Vec<PierRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn save(&self, record: &PierRecord) -> PierResult<()> {
        self.check_writable("save")?;
        self.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &PierId) -> PierResult<()> {
        self.check_writable("remove")?;
        self.lock().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, created_at: u64) -> PierRecord {
        PierRecord {
            id: PierId::new(id).unwrap(),
            directory: PathBuf::from(format!("/srv/piers/{}", id)),
            web_port: 8080,
            loopback_port: 12321,
            booted: false,
            last_error: None,
            created_at,
            last_started_at: None,
            last_pid: None,
        }
    }

    #[test]
    fn test_file_store_save_load_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("piers.d")).unwrap();

        let mut zod = record("zod", 2);
        store.save(&record("bus", 1)).unwrap();
        store.save(&zod).unwrap();

        zod.booted = true;
        zod.last_error = Some("exit code 1".to_string());
        store.save(&zod).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.as_str(), "bus");
        assert_eq!(loaded[1], zod);

        store.remove(&zod.id).unwrap();
        store.remove(&zod.id).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_ignores_stray_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save(&record("zod", 1)).unwrap();

        fs::write(dir.path().join("zod.json.tmp"), b"{").unwrap();
        fs::write(dir.path().join("garbage.json"), b"not json").unwrap();
        fs::write(dir.path().join("README"), b"hello").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_file_store_unwritable_dir() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let result = FileStore::open(blocker.join("piers.d"));
        assert!(matches!(result, Err(PierError::StoreUnavailable { .. })));
    }

    #[test]
    fn test_old_records_without_optional_fields() {
        let json = r#"{
            "id": "zod",
            "directory": "/srv/piers/zod",
            "web_port": 8080,
            "loopback_port": 12321,
            "booted": true,
            "created_at": 5
        }"#;
        let rec: PierRecord = serde_json::from_str(json).unwrap();
        assert!(rec.last_pid.is_none());
        assert_eq!(rec.ports().unwrap().web.value(), 8080);
    }

    #[test]
    fn test_memory_store_read_only() {
        let store = MemoryStore::new();
        store.save(&record("zod", 1)).unwrap();

        store.set_read_only(true);
        let err = store.save(&record("bus", 2)).unwrap_err();
        assert!(matches!(err, PierError::StoreUnavailable { .. }));
        assert!(store.remove(&PierId::new("zod").unwrap()).is_err());

        store.set_read_only(false);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
