//! RocksDB-backed data store.
//!
//! Column families:
//! - `rooms`      — room records (bincode, LZ4 compressed), keyed by room id
//! - `files`      — file records (bincode), keyed by file uuid
//! - `room_files` — ownership index, keyed `<room id><0x00><file uuid>`
//!
//! Multi-key changes (room cascade, file insert/delete) go through one
//! atomic `WriteBatch`. Conditional writes are serialized by a process-local
//! write lock; RocksDB itself provides no compare-and-set.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DataStore, StoreError};
use crate::room::{FileRef, RoomId, RoomRecord};

const CF_ROOMS: &str = "rooms";
const CF_FILES: &str = "files";
const CF_ROOM_FILES: &str = "room_files";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_FILES, CF_ROOM_FILES];

/// Separates the room id from the file uuid in index keys. Room ids are hex
/// text and never contain it.
const INDEX_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shareflow_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Room text dominates record size, so whole records are compressed.
fn encode_room(record: &RoomRecord) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&encode(record)?))
}

fn decode_room(bytes: &[u8]) -> Result<RoomRecord, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    decode(&raw)
}

fn index_prefix(room_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + 1);
    key.extend_from_slice(room_id.as_bytes());
    key.push(INDEX_SEPARATOR);
    key
}

fn index_key(room_id: &str, file_id: Uuid) -> Vec<u8> {
    let mut key = index_prefix(room_id);
    key.extend_from_slice(file_id.as_bytes());
    key
}

/// RocksDB-backed room and file store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, shared behind `&self`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-check-write sequences.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_FILES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ROOM_FILES => {
                // Empty values, prefix scans only
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn file_ids_for_room(&self, room_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_ROOM_FILES)?;
        let prefix = index_prefix(room_id);
        let mut ids = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid index key".into()))?;
            ids.push(Uuid::from_bytes(raw));
        }

        Ok(ids)
    }
}

impl DataStore for RocksStore {
    fn get_room(&self, id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_room(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
        record.validate().map_err(StoreError::Invalid)?;
        let cf = self.cf(CF_ROOMS)?;
        let _guard = self.lock()?;

        if self.db.get_cf(cf, record.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, record.id.as_bytes(), encode_room(record)?);
        self.write(batch)
    }

    fn update_room(&self, record: &RoomRecord, expected_version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let _guard = self.lock()?;

        let stored = match self.db.get_cf(cf, record.id.as_bytes())? {
            Some(bytes) => decode_room(&bytes)?,
            None => return Err(StoreError::NotFound(record.id.clone())),
        };
        if stored.version != expected_version {
            return Err(StoreError::Conflict {
                id: record.id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }

        let mut next = record.clone();
        next.version = expected_version + 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, next.id.as_bytes(), encode_room(&next)?);
        self.write(batch)?;
        Ok(next.version)
    }

    fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_index = self.cf(CF_ROOM_FILES)?;
        let _guard = self.lock()?;

        let existed = self.db.get_cf(cf_rooms, id.as_bytes())?.is_some();
        let file_ids = self.file_ids_for_room(id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_rooms, id.as_bytes());
        for file_id in &file_ids {
            batch.delete_cf(cf_files, file_id.as_bytes());
            batch.delete_cf(cf_index, index_key(id, *file_id));
        }
        self.write(batch)?;

        Ok(existed)
    }

    fn list_expired_rooms(&self, now: u64) -> Result<Vec<RoomId>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut expired = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            match decode_room(&value) {
                Ok(record) if record.is_expired_at(now) => expired.push(record.id),
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Skipping unreadable room {}: {e}", String::from_utf8_lossy(&key));
                }
            }
        }
        Ok(expired)
    }

    fn get_file(&self, id: Uuid) -> Result<Option<FileRef>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_file(&self, file: &FileRef) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_files = self.cf(CF_FILES)?;
        let cf_index = self.cf(CF_ROOM_FILES)?;
        let _guard = self.lock()?;

        if self.db.get_cf(cf_rooms, file.room_id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(file.room_id.clone()));
        }
        if self.db.get_cf(cf_files, file.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(file.id.to_string()));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_files, file.id.as_bytes(), encode(file)?);
        batch.put_cf(cf_index, index_key(&file.room_id, file.id), b"");
        self.write(batch)
    }

    fn delete_file(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_index = self.cf(CF_ROOM_FILES)?;
        let _guard = self.lock()?;

        let Some(file) = self.get_file(id)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_files, id.as_bytes());
        batch.delete_cf(cf_index, index_key(&file.room_id, id));
        self.write(batch)?;
        Ok(true)
    }

    fn list_expired_files(&self, now: u64) -> Result<Vec<FileRef>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        let mut expired = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let file: FileRef = decode(&value)?;
            if file.is_expired_at(now) {
                expired.push(file);
            }
        }
        expired.sort_by_key(|f| f.created_at);
        Ok(expired)
    }

    fn files_for_room(&self, room_id: &str) -> Result<Vec<FileRef>, StoreError> {
        let mut files = Vec::new();
        for id in self.file_ids_for_room(room_id)? {
            if let Some(file) = self.get_file(id)? {
                files.push(file);
            }
        }
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
