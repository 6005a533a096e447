//! Share catalog: create, read, update and delete shares outside a live
//! session, and attach files to them.
//!
//! This is the library surface an HTTP layer would sit on. It enforces the
//! same expiry and secret rules as the real-time join path.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::access::Credentials;
use crate::cleanup::{delete_file, purge_room};
use crate::error::{ForbiddenReason, SessionError};
use crate::registry::{RoomHandle, SessionRegistry};
use crate::room::{
    is_well_known, now_millis, FileRef, RoomId, RoomPolicy, RoomRecord, TrustMode, UsageCounters,
    DEFAULT_FILE_RETENTION_MS, DEFAULT_LANGUAGE,
};
use crate::secret::{SecretHash, DEFAULT_COST};
use crate::storage::{modify_room, StoreError};

const ID_BYTES: usize = 8;
const ID_ATTEMPTS: usize = 4;

/// Lifetime choices offered when creating a share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiryPreset {
    TenMinutes,
    #[default]
    OneHour,
    SixHours,
    OneDay,
    OneWeek,
    /// Stored as one year.
    Never,
}

impl ExpiryPreset {
    pub fn duration(&self) -> Duration {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;
        Duration::from_secs(match self {
            ExpiryPreset::TenMinutes => 10 * MIN,
            ExpiryPreset::OneHour => HOUR,
            ExpiryPreset::SixHours => 6 * HOUR,
            ExpiryPreset::OneDay => DAY,
            ExpiryPreset::OneWeek => 7 * DAY,
            ExpiryPreset::Never => 365 * DAY,
        })
    }
}

impl FromStr for ExpiryPreset {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "10min" => Ok(ExpiryPreset::TenMinutes),
            "1hr" => Ok(ExpiryPreset::OneHour),
            "6hr" => Ok(ExpiryPreset::SixHours),
            "24hr" => Ok(ExpiryPreset::OneDay),
            "7d" => Ok(ExpiryPreset::OneWeek),
            "never" => Ok(ExpiryPreset::Never),
            other => Err(SessionError::BadRequest(format!("unknown expiry {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewShare {
    pub mode: Option<TrustMode>,
    pub text: String,
    pub secret: Option<String>,
    pub expiry: ExpiryPreset,
    pub language: Option<String>,
    pub title: Option<String>,
    pub policy: Option<RoomPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedShare {
    pub room_id: RoomId,
    pub expires_at: u64,
}

/// Read-side view of a share. Never carries the secret hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareView {
    pub room_id: RoomId,
    pub mode: TrustMode,
    pub title: String,
    pub text: String,
    pub language: String,
    pub created_at: Option<u64>,
    /// `None` for well-known rooms.
    pub expires_at: Option<u64>,
    pub files: Vec<Uuid>,
    pub active_users: usize,
    pub policy: RoomPolicy,
    pub counters: UsageCounters,
}

impl From<&RoomRecord> for ShareView {
    fn from(record: &RoomRecord) -> Self {
        Self {
            room_id: record.id.clone(),
            mode: record.mode,
            title: record.title.clone(),
            text: record.text.clone(),
            language: record.language.clone(),
            created_at: Some(record.created_at),
            expires_at: Some(record.expires_at),
            files: record.files.clone(),
            active_users: record.active_users.len(),
            policy: record.policy,
            counters: record.counters,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharePatch {
    pub text: Option<String>,
    pub language: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub original_name: String,
    pub blob_key: String,
    pub mime_type: String,
    pub size: u64,
    /// Defaults to twelve hours.
    pub retention: Option<Duration>,
}

pub struct ShareCatalog {
    registry: Arc<SessionRegistry>,
    default_max_users: usize,
    secret_cost: u32,
}

impl ShareCatalog {
    pub fn new(registry: Arc<SessionRegistry>, default_max_users: usize) -> Self {
        Self {
            registry,
            default_max_users,
            secret_cost: DEFAULT_COST,
        }
    }

    /// bcrypt work factor for secrets of new private shares.
    pub fn with_secret_cost(mut self, cost: u32) -> Self {
        self.secret_cost = cost;
        self
    }

    pub async fn create(&self, share: NewShare) -> Result<CreatedShare, SessionError> {
        let secret = share.secret.as_deref().filter(|s| !s.is_empty());
        let mode = share.mode.unwrap_or(if secret.is_some() {
            TrustMode::Private
        } else {
            TrustMode::Public
        });
        if mode == TrustMode::Private && secret.is_none() {
            return Err(SessionError::BadRequest("private shares need a secret".into()));
        }

        let secret = match secret {
            Some(secret) => {
                let (secret, cost) = (secret.to_string(), self.secret_cost);
                let hash = tokio::task::spawn_blocking(move || SecretHash::derive_with_cost(&secret, cost))
                    .await
                    .map_err(|e| SessionError::Internal(format!("secret hashing failed: {e}")))??;
                Some(hash)
            }
            None => None,
        };

        let now = now_millis();
        let expires_at = now + share.expiry.duration().as_millis() as u64;
        let mut record = RoomRecord {
            id: String::new(),
            mode,
            title: share.title.unwrap_or_else(|| "Untitled Share".to_string()),
            text: share.text,
            language: share.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            secret,
            created_at: now,
            expires_at,
            files: Vec::new(),
            active_users: Vec::new(),
            policy: share.policy.unwrap_or(RoomPolicy {
                max_users: self.default_max_users,
                ..RoomPolicy::default()
            }),
            counters: UsageCounters::default(),
            version: 0,
        };

        for _ in 0..ID_ATTEMPTS {
            record.id = new_room_id();
            let candidate = record.clone();
            let inserted = self
                .registry
                .store()
                .call(move |s| match s.insert_room(&candidate) {
                    Ok(()) => Ok(true),
                    Err(StoreError::AlreadyExists(_)) => Ok(false),
                    Err(StoreError::Invalid(msg)) => Err(SessionError::BadRequest(msg)),
                    Err(e) => Err(e.into()),
                })
                .await?;
            if inserted {
                log::info!("Created {} share {} expiring at {expires_at}", record.mode, record.id);
                return Ok(CreatedShare {
                    room_id: record.id,
                    expires_at,
                });
            }
        }
        Err(SessionError::Internal("could not allocate a share id".into()))
    }

    /// Read a share, counting the view.
    pub async fn read(&self, room_id: &str, credentials: &Credentials) -> Result<ShareView, SessionError> {
        let record = match self.registry.resolve(room_id).await? {
            RoomHandle::Ephemeral(room) => {
                let eph = room
                    .ephemeral()
                    .ok_or_else(|| SessionError::Internal("well-known room without document".into()))?;
                let doc = eph.doc()?.clone();
                return Ok(ShareView {
                    room_id: room.id().to_string(),
                    mode: eph.mode,
                    title: eph.title.clone(),
                    text: doc.text,
                    language: doc.language,
                    created_at: None,
                    expires_at: None,
                    files: Vec::new(),
                    active_users: room.member_count(),
                    policy: eph.policy,
                    counters: UsageCounters::default(),
                });
            }
            RoomHandle::Persistent(record) => record,
        };

        let gate = Arc::clone(self.registry.gate());
        let credentials = credentials.clone();
        let id = record.id;
        self.registry
            .store()
            .call(move |s| {
                let (record, ()) = modify_room::<_, SessionError>(s, &id, |record| {
                    gate.check_record(record, &credentials, now_millis())?;
                    record.counters.views += 1;
                    Ok(())
                })?;
                Ok(ShareView::from(&record))
            })
            .await
    }

    /// Change text, language or title of a live share.
    pub async fn update(
        &self,
        room_id: &str,
        credentials: &Credentials,
        patch: SharePatch,
    ) -> Result<ShareView, SessionError> {
        if is_well_known(room_id) {
            return Err(SessionError::BadRequest("well-known shares are edited live".into()));
        }
        let gate = Arc::clone(self.registry.gate());
        let credentials = credentials.clone();
        let id = room_id.to_string();
        self.registry
            .store()
            .call(move |s| {
                let (record, ()) = modify_room::<_, SessionError>(s, &id, |record| {
                    gate.check_record(record, &credentials, now_millis())?;
                    if !record.policy.allow_edit {
                        return Err(SessionError::Forbidden(ForbiddenReason::EditDisabled));
                    }
                    if let Some(text) = &patch.text {
                        record.text.clone_from(text);
                    }
                    if let Some(language) = &patch.language {
                        record.language.clone_from(language);
                    }
                    if let Some(title) = &patch.title {
                        record.title.clone_from(title);
                    }
                    record.counters.edits += 1;
                    Ok(())
                })?;
                Ok(ShareView::from(&record))
            })
            .await
    }

    /// Delete a share and its files, disconnecting anyone still in it.
    /// Returns `false` if it did not exist.
    pub async fn delete(&self, room_id: &str) -> Result<bool, SessionError> {
        if is_well_known(room_id) {
            return Err(SessionError::BadRequest("well-known shares cannot be deleted".into()));
        }
        let (deleted, files) = purge_room(&self.registry, room_id, "deleted").await?;
        if deleted {
            log::info!("Deleted share {room_id} with {files} file(s)");
        }
        Ok(deleted)
    }

    /// Record an uploaded file against a live share.
    pub async fn attach_file(&self, room_id: &str, file: NewFile) -> Result<FileRef, SessionError> {
        if is_well_known(room_id) {
            return Err(SessionError::BadRequest("well-known shares do not hold files".into()));
        }
        let now = now_millis();
        let retention = file
            .retention
            .map(|d| d.as_millis() as u64)
            .unwrap_or(DEFAULT_FILE_RETENTION_MS);
        let file_ref = FileRef {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            original_name: file.original_name,
            blob_key: file.blob_key,
            mime_type: file.mime_type,
            size: file.size,
            created_at: now,
            expires_at: now + retention,
        };

        let stored = file_ref.clone();
        self.registry
            .store()
            .call(move |s| {
                let room_id = stored.room_id.clone();
                let (_, ()) = modify_room::<_, SessionError>(s, &room_id, |record| {
                    if record.is_expired_at(now) {
                        return Err(SessionError::Expired);
                    }
                    s.insert_file(&stored).or_else(|e| match e {
                        StoreError::AlreadyExists(_) => Ok(()),
                        other => Err(other),
                    })?;
                    if !record.files.contains(&stored.id) {
                        record.files.push(stored.id);
                    }
                    Ok(())
                })?;
                Ok(())
            })
            .await?;
        Ok(file_ref)
    }

    /// Remove a file's blob and record. Returns `false` if it was unknown.
    pub async fn detach_file(&self, file_id: Uuid) -> Result<bool, SessionError> {
        let store = self.registry.store();
        let Some(file) = store.call(move |s| Ok(s.get_file(file_id)?)).await? else {
            return Ok(false);
        };
        delete_file(store, &file).await
    }

    /// Count a download, if the share allows downloads.
    pub async fn record_download(&self, room_id: &str, credentials: &Credentials) -> Result<u64, SessionError> {
        let gate = Arc::clone(self.registry.gate());
        let credentials = credentials.clone();
        let id = room_id.to_string();
        self.registry
            .store()
            .call(move |s| {
                let (record, ()) = modify_room::<_, SessionError>(s, &id, |record| {
                    gate.check_record(record, &credentials, now_millis())?;
                    if !record.policy.allow_download {
                        return Err(SessionError::Forbidden(ForbiddenReason::DownloadDisabled));
                    }
                    record.counters.downloads += 1;
                    Ok(())
                })?;
                Ok(record.counters.downloads)
            })
            .await
    }
}

fn new_room_id() -> RoomId {
    let bytes: [u8; ID_BYTES] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessGate, SubnetPolicy};
    use crate::config::ServerConfig;
    use crate::room::PUBLIC_GLOBAL;
    use crate::storage::{DataStore, DiskBlobStore, MemoryStore, StoreHandle};

    struct Fixture {
        _dir: tempfile::TempDir,
        data: Arc<MemoryStore>,
        blobs: Arc<DiskBlobStore>,
        catalog: ShareCatalog,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = Arc::new(MemoryStore::new());
        let blobs = Arc::new(DiskBlobStore::new(dir.path()));
        let store = StoreHandle::new(data.clone(), blobs.clone(), Duration::from_secs(2));
        let gate = Arc::new(AccessGate::new(Box::new(SubnetPolicy::default())));
        let registry = Arc::new(SessionRegistry::new(store, gate, &ServerConfig::for_testing()));
        Fixture {
            _dir: dir,
            data,
            blobs,
            catalog: ShareCatalog::new(registry, 10).with_secret_cost(crate::secret::MIN_COST),
        }
    }

    fn private_share() -> NewShare {
        NewShare {
            text: "hello".into(),
            secret: Some("abc123".into()),
            expiry: ExpiryPreset::TenMinutes,
            ..NewShare::default()
        }
    }

    #[test]
    fn test_expiry_presets() {
        assert_eq!("10min".parse::<ExpiryPreset>().unwrap().duration(), Duration::from_secs(600));
        assert_eq!("never".parse::<ExpiryPreset>().unwrap().duration(), Duration::from_secs(365 * 86_400));
        assert_eq!(ExpiryPreset::default(), ExpiryPreset::OneHour);
        assert!("forever".parse::<ExpiryPreset>().is_err());
    }

    #[test]
    fn test_room_id_shape() {
        let id = new_room_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_create_private_and_read() {
        let f = fixture();
        let created = f.catalog.create(private_share()).await.unwrap();
        let ttl = created.expires_at - f.data.get_room(&created.room_id).unwrap().unwrap().created_at;
        assert_eq!(ttl, 10 * 60 * 1000);

        let err = f.catalog.read(&created.room_id, &Credentials::none()).await.err();
        assert_eq!(err, Some(SessionError::Unauthorized));
        let err = f.catalog.read(&created.room_id, &Credentials::secret("bad")).await.err();
        assert_eq!(err, Some(SessionError::Unauthorized));

        let view = f.catalog.read(&created.room_id, &Credentials::secret("abc123")).await.unwrap();
        assert_eq!(view.text, "hello");
        assert_eq!(view.mode, TrustMode::Private);
        assert_eq!(view.counters.views, 1);
        assert!(!format!("{view:?}").contains("$2b$"));
    }

    #[tokio::test]
    async fn test_private_without_secret_rejected() {
        let f = fixture();
        let err = f
            .catalog
            .create(NewShare {
                mode: Some(TrustMode::Private),
                ..NewShare::default()
            })
            .await
            .err();
        assert!(matches!(err, Some(SessionError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_update_and_expired() {
        let f = fixture();
        let created = f.catalog.create(NewShare::default()).await.unwrap();
        let view = f
            .catalog
            .update(
                &created.room_id,
                &Credentials::none(),
                SharePatch {
                    text: Some("new".into()),
                    ..SharePatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(view.text, "new");
        assert_eq!(view.counters.edits, 1);

        let (_, ()) = modify_room::<_, StoreError>(f.data.as_ref(), &created.room_id, |r| {
            r.expires_at = 1;
            Ok(())
        })
        .unwrap();
        let err = f.catalog.read(&created.room_id, &Credentials::none()).await.err();
        assert_eq!(err, Some(SessionError::Expired));
    }

    #[tokio::test]
    async fn test_files_attach_detach_delete() {
        let f = fixture();
        let created = f.catalog.create(NewShare::default()).await.unwrap();
        f.blobs.put("a.bin", b"1").unwrap();
        f.blobs.put("b.bin", b"2").unwrap();

        let new_file = |key: &str| NewFile {
            original_name: key.into(),
            blob_key: key.into(),
            mime_type: "application/octet-stream".into(),
            size: 1,
            retention: None,
        };
        let a = f.catalog.attach_file(&created.room_id, new_file("a.bin")).await.unwrap();
        let b = f.catalog.attach_file(&created.room_id, new_file("b.bin")).await.unwrap();
        assert_eq!(b.expires_at - b.created_at, DEFAULT_FILE_RETENTION_MS);

        assert!(f.catalog.detach_file(a.id).await.unwrap());
        assert!(!f.catalog.detach_file(a.id).await.unwrap());
        assert!(!f.blobs.exists("a.bin"));
        assert_eq!(f.data.get_room(&created.room_id).unwrap().unwrap().files, vec![b.id]);

        assert!(f.catalog.delete(&created.room_id).await.unwrap());
        assert!(!f.blobs.exists("b.bin"));
        assert!(f.data.get_file(b.id).unwrap().is_none());
        assert!(!f.catalog.delete(&created.room_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_downloads() {
        let f = fixture();
        let created = f.catalog.create(NewShare::default()).await.unwrap();
        assert_eq!(f.catalog.record_download(&created.room_id, &Credentials::none()).await.unwrap(), 1);

        let locked = f
            .catalog
            .create(NewShare {
                policy: Some(RoomPolicy {
                    allow_download: false,
                    ..RoomPolicy::default()
                }),
                ..NewShare::default()
            })
            .await
            .unwrap();
        assert_eq!(
            f.catalog.record_download(&locked.room_id, &Credentials::none()).await.err(),
            Some(SessionError::Forbidden(ForbiddenReason::DownloadDisabled))
        );
    }

    #[tokio::test]
    async fn test_well_known_read_only() {
        let f = fixture();
        let view = f.catalog.read(PUBLIC_GLOBAL, &Credentials::none()).await.unwrap();
        assert_eq!(view.title, "Public Global Share");
        assert_eq!(view.expires_at, None);
        assert!(f.catalog.delete(PUBLIC_GLOBAL).await.is_err());
    }
}
