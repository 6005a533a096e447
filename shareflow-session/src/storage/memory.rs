//! In-memory data store, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DataStore, StoreError};
use crate::room::{FileRef, RoomId, RoomRecord};

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, RoomRecord>,
    files: HashMap<Uuid, FileRef>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl DataStore for MemoryStore {
    fn get_room(&self, id: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.tables()?.rooms.get(id).cloned())
    }

    fn insert_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        record.validate().map_err(StoreError::Invalid)?;
        let mut tables = self.tables()?;
        if tables.rooms.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        tables.rooms.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn update_room(&self, record: &RoomRecord, expected_version: u64) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let stored = tables
            .rooms
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }
        *stored = record.clone();
        stored.version = expected_version + 1;
        Ok(stored.version)
    }

    fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let existed = tables.rooms.remove(id).is_some();
        tables.files.retain(|_, file| file.room_id != id);
        Ok(existed)
    }

    fn list_expired_rooms(&self, now: u64) -> Result<Vec<RoomId>, StoreError> {
        let tables = self.tables()?;
        let mut ids: Vec<RoomId> = tables
            .rooms
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn get_file(&self, id: Uuid) -> Result<Option<FileRef>, StoreError> {
        Ok(self.tables()?.files.get(&id).cloned())
    }

    fn insert_file(&self, file: &FileRef) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if !tables.rooms.contains_key(&file.room_id) {
            return Err(StoreError::NotFound(file.room_id.clone()));
        }
        if tables.files.contains_key(&file.id) {
            return Err(StoreError::AlreadyExists(file.id.to_string()));
        }
        tables.files.insert(file.id, file.clone());
        Ok(())
    }

    fn delete_file(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tables()?.files.remove(&id).is_some())
    }

    fn list_expired_files(&self, now: u64) -> Result<Vec<FileRef>, StoreError> {
        let tables = self.tables()?;
        let mut files: Vec<FileRef> = tables
            .files
            .values()
            .filter(|f| f.is_expired_at(now))
            .cloned()
            .collect();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }

    fn files_for_room(&self, room_id: &str) -> Result<Vec<FileRef>, StoreError> {
        let tables = self.tables()?;
        let mut files: Vec<FileRef> = tables
            .files
            .values()
            .filter(|f| f.room_id == room_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }
}
