//! World persistence
//!
//! The world record is an opaque bincode blob behind [`BlobStore`]. The
//! server only reads and writes three things in it: the current scene, the
//! building list and the set of looted loot spawns.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::vec3::Vec3;

const WORLD_KEY: &str = "world";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode record: {0}")]
    Encode(String),
    #[error("Failed to decode record: {0}")]
    Decode(String),
}

/// Key/value store for opaque blobs
pub trait BlobStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError>;
}

/// Volatile store (no `SAVE_DIR` configured, and tests)
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        self.blobs.lock().insert(key.to_string(), blob.to_vec());
        Ok(())
    }
}

/// One file per key under a directory. Writes go to a temp file first.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", key))
    }
}

impl BlobStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path(key);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingRecord {
    pub building_type: String,
    /// Display name of the placing player; ownership survives reconnects
    pub owner_name: String,
    pub scene_id: String,
    pub position: Vec3,
    pub rotation: f32,
    pub level: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldRecord {
    pub current_scene: Option<String>,
    pub buildings: Vec<BuildingRecord>,
    pub looted_spawns: BTreeSet<String>,
}

pub fn encode_record(record: &WorldRecord) -> Result<Vec<u8>, PersistenceError> {
    bincode::serde::encode_to_vec(record, bincode::config::legacy())
        .map_err(|e| PersistenceError::Encode(e.to_string()))
}

pub fn decode_record(data: &[u8]) -> Result<WorldRecord, PersistenceError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(record, _)| record)
        .map_err(|e| PersistenceError::Decode(e.to_string()))
}

/// In-memory world record with write-back to a [`BlobStore`]
pub struct WorldPersistence {
    store: Arc<dyn BlobStore>,
    record: Mutex<WorldRecord>,
    dirty: AtomicBool,
}

impl WorldPersistence {
    /// Load the world record, starting fresh if none exists
    pub fn load(store: Arc<dyn BlobStore>) -> Result<Self, PersistenceError> {
        let record = match store.load(WORLD_KEY)? {
            Some(blob) => decode_record(&blob)?,
            None => WorldRecord::default(),
        };

        tracing::info!(
            "World record loaded: scene={:?}, {} buildings, {} looted spawns",
            record.current_scene,
            record.buildings.len(),
            record.looted_spawns.len()
        );

        Ok(Self {
            store,
            record: Mutex::new(record),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn current_scene(&self) -> Option<String> {
        self.record.lock().current_scene.clone()
    }

    pub fn set_current_scene(&self, scene_id: Option<String>) {
        let mut record = self.record.lock();
        if record.current_scene != scene_id {
            record.current_scene = scene_id;
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn buildings(&self) -> Vec<BuildingRecord> {
        self.record.lock().buildings.clone()
    }

    pub fn set_buildings(&self, buildings: Vec<BuildingRecord>) {
        self.record.lock().buildings = buildings;
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn is_looted(&self, spawn_id: &str) -> bool {
        self.record.lock().looted_spawns.contains(spawn_id)
    }

    pub fn mark_looted(&self, spawn_id: &str) {
        if self.record.lock().looted_spawns.insert(spawn_id.to_string()) {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Write the record if anything changed. Returns whether a write happened.
    pub fn save(&self) -> Result<bool, PersistenceError> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }

        let blob = {
            let record = self.record.lock();
            encode_record(&record)
        };
        let result = blob.and_then(|blob| self.store.save(WORLD_KEY, &blob));
        if result.is_err() {
            // Retry on the next save
            self.dirty.store(true, Ordering::Relaxed);
        }
        result.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorldRecord {
        WorldRecord {
            current_scene: Some("farm".to_string()),
            buildings: vec![BuildingRecord {
                building_type: "wall_wood".to_string(),
                owner_name: "alice".to_string(),
                scene_id: "farm".to_string(),
                position: Vec3::new(1.0, 0.0, 2.0),
                rotation: 1.5,
                level: 2,
            }],
            looted_spawns: ["farm_crate_1".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_record_blob_roundtrip() {
        let record = sample();
        let blob = encode_record(&record).unwrap();
        assert_eq!(decode_record(&blob).unwrap(), record);
    }

    #[test]
    fn test_corrupt_blob_is_decode_error() {
        assert!(matches!(
            decode_record(&[0xFF, 0x01]),
            Err(PersistenceError::Decode(_))
        ));
    }

    #[test]
    fn test_fresh_world_when_store_empty() {
        let world = WorldPersistence::load(Arc::new(MemoryStore::new())).unwrap();
        assert!(world.current_scene().is_none());
        assert!(world.buildings().is_empty());
        assert!(!world.is_dirty());
    }

    #[test]
    fn test_save_only_when_dirty_and_reload() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
        let world = WorldPersistence::load(store.clone()).unwrap();

        assert!(!world.save().unwrap());

        world.set_current_scene(Some("farm".to_string()));
        world.mark_looted("farm_crate_1");
        world.mark_looted("farm_crate_1");
        assert!(world.save().unwrap());
        assert!(!world.save().unwrap());

        let reloaded = WorldPersistence::load(store).unwrap();
        assert_eq!(reloaded.current_scene().as_deref(), Some("farm"));
        assert!(reloaded.is_looted("farm_crate_1"));
        assert!(!reloaded.is_looted("farm_crate_2"));
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("coop-authority-test-{}", std::process::id()));
        let store = FileStore::new(&dir).unwrap();

        assert!(store.load("world").unwrap().is_none());
        store.save("world", b"blob").unwrap();
        assert_eq!(store.load("world").unwrap().as_deref(), Some(&b"blob"[..]));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
