//! Expiry sweeps for persistent rooms and files.
//!
//! Sweeps are garbage collection only: expiry is enforced on every access
//! regardless of whether a sweep has run. Every step is idempotent, so a
//! crashed or overlapping sweep is finished by the next one.
//!
//! ```text
//! room sweep (hourly)               file sweep (every 10 min)
//!   list_expired_rooms                list_expired_files
//!     └─ purge_room                     ├─ remove blob (missing = ok)
//!          ├─ evict live members        ├─ delete file record
//!          ├─ remove every blob         └─ detach from owning room
//!          ├─ delete room + file records
//!          └─ evict late joiners
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::room::{now_millis, FileRef};
use crate::storage::{modify_room, BlobError, StoreError, StoreHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms_deleted: usize,
    pub files_deleted: usize,
    pub failures: usize,
}

/// Evict, then delete a room with all of its files.
///
/// A live (unexpired) room still admits joins while its blobs are being
/// removed, so members are evicted once more after the record is gone.
/// Returns `(room_deleted, files_deleted)`. A blob that is already gone
/// does not stop the purge; any other blob failure leaves the room in
/// place for the next attempt.
pub async fn purge_room(
    registry: &SessionRegistry,
    room_id: &str,
    reason: &str,
) -> Result<(bool, usize), SessionError> {
    registry.evict(room_id, reason)?;

    let store = registry.store();
    let id = room_id.to_string();
    let files = store.call(move |s| Ok(s.files_for_room(&id)?)).await?;

    for file in &files {
        remove_blob(store, file).await?;
    }

    let id = room_id.to_string();
    let deleted = store.call(move |s| Ok(s.delete_room(&id)?)).await?;
    registry.evict(room_id, reason)?;
    let files_deleted = if deleted { files.len() } else { 0 };
    Ok((deleted, files_deleted))
}

async fn remove_blob(store: &StoreHandle, file: &FileRef) -> Result<(), SessionError> {
    match store.remove_blob(file.clone()).await {
        Ok(()) => Ok(()),
        Err(BlobError::Missing(key)) => {
            log::debug!("Blob {key} for file {} already gone", file.id);
            Ok(())
        }
        Err(e) => Err(SessionError::Internal(e.to_string())),
    }
}

pub struct CleanupService {
    registry: Arc<SessionRegistry>,
}

impl CleanupService {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn sweep_rooms(&self) -> SweepReport {
        self.sweep_rooms_at(now_millis()).await
    }

    pub async fn sweep_files(&self) -> SweepReport {
        self.sweep_files_at(now_millis()).await
    }

    /// Delete every room expired at `now`.
    pub async fn sweep_rooms_at(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let expired = match self.registry.store().call(move |s| Ok(s.list_expired_rooms(now)?)).await {
            Ok(ids) => ids,
            Err(e) => {
                log::warn!("Room sweep could not list expired rooms: {e}");
                report.failures += 1;
                return report;
            }
        };

        for room_id in expired {
            match purge_room(&self.registry, &room_id, "expired").await {
                Ok((deleted, files)) => {
                    report.rooms_deleted += usize::from(deleted);
                    report.files_deleted += files;
                }
                Err(e) => {
                    log::warn!("Failed to purge expired room {room_id}: {e}");
                    report.failures += 1;
                }
            }
        }

        if report != SweepReport::default() {
            log::info!(
                "Room sweep: {} rooms, {} files deleted, {} failures",
                report.rooms_deleted,
                report.files_deleted,
                report.failures
            );
        }
        report
    }

    /// Delete every file expired at `now` and detach it from its room.
    pub async fn sweep_files_at(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let store = self.registry.store();
        let expired = match store.call(move |s| Ok(s.list_expired_files(now)?)).await {
            Ok(files) => files,
            Err(e) => {
                log::warn!("File sweep could not list expired files: {e}");
                report.failures += 1;
                return report;
            }
        };

        for file in expired {
            match delete_file(store, &file).await {
                Ok(true) => report.files_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("Failed to delete expired file {}: {e}", file.id);
                    report.failures += 1;
                }
            }
        }

        if report != SweepReport::default() {
            log::info!(
                "File sweep: {} files deleted, {} failures",
                report.files_deleted,
                report.failures
            );
        }
        report
    }

    /// Run both sweeps on their own periods until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        room_interval: Duration,
        file_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rooms = tokio::time::interval(room_interval);
            let mut files = tokio::time::interval(file_interval);
            rooms.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            files.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = rooms.tick() => {
                        self.sweep_rooms().await;
                    }
                    _ = files.tick() => {
                        self.sweep_files().await;
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }
            log::debug!("Cleanup service stopped");
        })
    }
}

/// Remove the blob and record of one file, then detach it from its room.
/// Returns whether this call deleted the record.
pub async fn delete_file(store: &StoreHandle, file: &FileRef) -> Result<bool, SessionError> {
    remove_blob(store, file).await?;

    let file_id = file.id;
    let room_id = file.room_id.clone();
    store
        .call(move |s| {
            let deleted = s.delete_file(file_id)?;
            match modify_room::<_, StoreError>(s, &room_id, |record| {
                record.files.retain(|id| *id != file_id);
                Ok(())
            }) {
                Ok(_) | Err(StoreError::NotFound(_)) => Ok(deleted),
                Err(e) => Err(e.into()),
            }
        })
        .await
}
