//! Storage collaborators: room/file records and file blobs.
//!
//! ```text
//! ┌──────────────┐  spawn_blocking + timeout  ┌──────────────────────┐
//! │ StoreHandle  │ ─────────────────────────► │ dyn DataStore        │
//! │ (async side) │                            │  RocksStore (disk)   │
//! └──────┬───────┘                            │  MemoryStore (tests) │
//!        │                                    └──────────────────────┘
//!        │ remove_blob                        ┌──────────────────────┐
//!        └──────────────────────────────────► │ dyn BlobStore        │
//!                                             │  DiskBlobStore       │
//!                                             └──────────────────────┘
//! ```
//!
//! Store methods are synchronous; the async engine reaches them only through
//! [`StoreHandle`], which bounds every call with the configured timeout.
//! Room writes are conditional on the record `version` (see
//! [`DataStore::update_room`] and [`modify_room`]).

pub mod blobs;
pub mod memory;
pub mod rocks;

pub use blobs::{BlobError, BlobStore, DiskBlobStore};
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::SessionError;
use crate::room::{FileRef, RoomId, RoomRecord};

/// Conflicting writers get this many attempts before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Data store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },
    #[error("invalid record: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistent room and file metadata.
pub trait DataStore: Send + Sync {
    fn get_room(&self, id: &str) -> Result<Option<RoomRecord>, StoreError>;

    /// Insert a new record. Fails with `AlreadyExists` on id collision and
    /// `Invalid` if the record fails [`RoomRecord::validate`].
    fn insert_room(&self, record: &RoomRecord) -> Result<(), StoreError>;

    /// Compare-and-set on `version`: succeeds only while the stored record
    /// still has `expected_version`, and stores `record` with the version
    /// bumped by one. Returns the new version.
    fn update_room(&self, record: &RoomRecord, expected_version: u64) -> Result<u64, StoreError>;

    /// Delete a room and every file record it owns. Returns `false` if the
    /// room was already gone.
    fn delete_room(&self, id: &str) -> Result<bool, StoreError>;

    fn list_expired_rooms(&self, now: u64) -> Result<Vec<RoomId>, StoreError>;

    fn get_file(&self, id: Uuid) -> Result<Option<FileRef>, StoreError>;

    /// Insert a file record. The owning room must exist.
    fn insert_file(&self, file: &FileRef) -> Result<(), StoreError>;

    fn delete_file(&self, id: Uuid) -> Result<bool, StoreError>;

    fn list_expired_files(&self, now: u64) -> Result<Vec<FileRef>, StoreError>;

    fn files_for_room(&self, room_id: &str) -> Result<Vec<FileRef>, StoreError>;
}

/// Read-modify-write a room through the conditional write path.
///
/// `apply` may run more than once if another writer wins the race; it sees
/// the freshest record each time. An error from `apply` aborts without
/// writing.
pub fn modify_room<T, E>(
    store: &dyn DataStore,
    id: &str,
    mut apply: impl FnMut(&mut RoomRecord) -> Result<T, E>,
) -> Result<(RoomRecord, T), E>
where
    E: From<StoreError>,
{
    let mut last_conflict = None;
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut record = store
            .get_room(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let expected = record.version;
        let out = apply(&mut record)?;
        match store.update_room(&record, expected) {
            Ok(version) => {
                record.version = version;
                return Ok((record, out));
            }
            Err(e @ StoreError::Conflict { .. }) => {
                log::debug!("Retrying write to room {id}: {e}");
                last_conflict = Some(e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(last_conflict
        .unwrap_or_else(|| StoreError::Database(format!("gave up writing room {id}")))
        .into())
}

/// Async front for the blocking collaborators.
#[derive(Clone)]
pub struct StoreHandle {
    data: Arc<dyn DataStore>,
    blobs: Arc<dyn BlobStore>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(data: Arc<dyn DataStore>, blobs: Arc<dyn BlobStore>, timeout: Duration) -> Self {
        Self {
            data,
            blobs,
            timeout,
        }
    }

    pub fn data(&self) -> &Arc<dyn DataStore> {
        &self.data
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` against the data store on the blocking pool.
    ///
    /// Gives up with `SessionError::Timeout` after the configured timeout.
    /// The blocking call itself is not cancelled and may still complete;
    /// writes that must stay ordered move their room's write guard into `f`.
    pub async fn call<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&dyn DataStore) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let data = Arc::clone(&self.data);
        let task = tokio::task::spawn_blocking(move || f(data.as_ref()));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SessionError::Internal(format!("store task failed: {join_err}"))),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Remove the blob behind `file` on the blocking pool.
    pub async fn remove_blob(&self, file: FileRef) -> Result<(), BlobError> {
        let blobs = Arc::clone(&self.blobs);
        let task = tokio::task::spawn_blocking(move || blobs.remove(&file));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(BlobError::Io(join_err.to_string())),
            Err(_) => Err(BlobError::Io("blob removal timed out".into())),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    type Trigger = Box<dyn Fn(&RoomRecord) -> bool + Send + Sync>;

    /// `MemoryStore` whose room writes or file listings stall on demand.
    pub struct SlowStore {
        pub inner: MemoryStore,
        delay: Duration,
        slow_update: Option<Trigger>,
        slow_listing: bool,
    }

    impl SlowStore {
        pub fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                delay,
                slow_update: None,
                slow_listing: false,
            }
        }

        /// Stall `update_room` for records matching `when`.
        pub fn on_update(mut self, when: impl Fn(&RoomRecord) -> bool + Send + Sync + 'static) -> Self {
            self.slow_update = Some(Box::new(when));
            self
        }

        /// Stall `files_for_room`.
        pub fn on_file_listing(mut self) -> Self {
            self.slow_listing = true;
            self
        }
    }

    impl DataStore for SlowStore {
        fn get_room(&self, id: &str) -> Result<Option<RoomRecord>, StoreError> {
            self.inner.get_room(id)
        }

        fn insert_room(&self, record: &RoomRecord) -> Result<(), StoreError> {
            self.inner.insert_room(record)
        }

        fn update_room(&self, record: &RoomRecord, expected_version: u64) -> Result<u64, StoreError> {
            if self.slow_update.as_ref().is_some_and(|when| when(record)) {
                std::thread::sleep(self.delay);
            }
            self.inner.update_room(record, expected_version)
        }

        fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete_room(id)
        }

        fn list_expired_rooms(&self, now: u64) -> Result<Vec<RoomId>, StoreError> {
            self.inner.list_expired_rooms(now)
        }

        fn get_file(&self, id: Uuid) -> Result<Option<FileRef>, StoreError> {
            self.inner.get_file(id)
        }

        fn insert_file(&self, file: &FileRef) -> Result<(), StoreError> {
            self.inner.insert_file(file)
        }

        fn delete_file(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_file(id)
        }

        fn list_expired_files(&self, now: u64) -> Result<Vec<FileRef>, StoreError> {
            self.inner.list_expired_files(now)
        }

        fn files_for_room(&self, room_id: &str) -> Result<Vec<FileRef>, StoreError> {
            if self.slow_listing {
                std::thread::sleep(self.delay);
            }
            self.inner.files_for_room(room_id)
        }
    }
}
