use std::{
    collections::BTreeMap,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{info, instrument, warn};

use crate::url_repo::{OwnerKey, ShortId, UrlRecord};

/// The whole persisted document: every live record plus the per-owner index.
///
/// Both collections are always written together.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub urls: BTreeMap<ShortId, UrlRecord>,
    #[serde(rename = "userUrls")]
    pub user_urls: BTreeMap<OwnerKey, Vec<ShortId>>,
}

/// What a document on disk looks like before the structural check. Entries
/// stay untyped so one bad entry does not take the rest of the document with it.
#[derive(Deserialize)]
struct RawSnapshot {
    urls: Option<BTreeMap<ShortId, Value>>,
    #[serde(rename = "userUrls")]
    user_urls: Option<BTreeMap<OwnerKey, Value>>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read snapshot at {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write snapshot at {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result of a mutation applied inside [`SnapshotFile::transact`].
#[derive(Debug)]
pub enum Transaction<T> {
    /// Persist the mutated snapshot, then return the value.
    Commit(T),
    /// Leave the file untouched and return the value.
    Rollback(T),
}

/// Handle to the JSON document backing the record store.
///
/// Mutations are serialized through one lock so overlapping read-modify-write
/// cycles cannot lose updates. Writes go to a sibling temp file that is then
/// renamed over the document, so readers never see a partial write.
#[derive(Clone, Debug)]
pub struct SnapshotFile {
    path: Arc<Path>,
    write_lock: Arc<Mutex<()>>,
}

impl SnapshotFile {
    /// Opens the snapshot at `path`, creating it or replacing a malformed one
    /// with an empty snapshot.
    ///
    /// # Errors
    /// Will return [`Err`] if the empty snapshot cannot be written.
    #[instrument]
    pub async fn open(path: PathBuf) -> Result<Self, StorageError> {
        let file = Self {
            path: path.into(),
            write_lock: Arc::default(),
        };

        match fs::read(&file.path).await {
            Ok(bytes) if parse(&bytes).is_some() => info!("Loaded existing snapshot"),
            Ok(_) => {
                warn!("Existing snapshot is malformed; replacing it with an empty one");
                file.save(&Snapshot::default()).await?;
            }
            Err(err) => {
                info!(%err, "Snapshot not readable; creating an empty one");
                file.save(&Snapshot::default()).await?;
            }
        }

        Ok(file)
    }

    /// Reads the current snapshot.
    ///
    /// A missing or malformed document reads as the empty snapshot.
    ///
    /// # Errors
    /// Will return [`Err`] if the file exists but cannot be read.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Snapshot, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(parse(&bytes).unwrap_or_default()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("Snapshot file disappeared; reading as empty");
                Ok(Snapshot::default())
            }
            Err(source) => Err(StorageError::Read {
                path: self.path.to_path_buf(),
                source,
            }),
        }
    }

    /// Loads the snapshot, applies `apply` to it and, on
    /// [`Transaction::Commit`], writes it back, all under the write lock.
    ///
    /// # Errors
    /// Will return [`Err`] if loading or saving the snapshot fails.
    pub async fn transact<T, F>(&self, apply: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Snapshot) -> Transaction<T> + Send,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;
        match apply(&mut snapshot) {
            Transaction::Commit(value) => {
                self.save(&snapshot).await?;
                Ok(value)
            }
            Transaction::Rollback(value) => Ok(value),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let temp_path = self.temp_path();

        fs::write(&temp_path, bytes)
            .await
            .map_err(|source| StorageError::Write {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.to_path_buf(),
                source,
            })
    }

    fn temp_path(&self) -> PathBuf {
        let mut file_name = self
            .path
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_default();
        file_name.push(".tmp");
        self.path.with_file_name(file_name)
    }
}

/// Parses a document, returning [`None`] when it is not JSON or when either
/// top-level collection is missing.
///
/// Records and index entries that do not deserialize are skipped, as are
/// index ids whose record was skipped.
fn parse(bytes: &[u8]) -> Option<Snapshot> {
    let (raw_urls, raw_user_urls) = match serde_json::from_slice::<RawSnapshot>(bytes) {
        Ok(RawSnapshot {
            urls: Some(urls),
            user_urls: Some(user_urls),
        }) => (urls, user_urls),
        Ok(_) => {
            warn!("Snapshot is missing a top-level collection");
            return None;
        }
        Err(err) => {
            warn!(%err, "Snapshot is not a valid document");
            return None;
        }
    };

    let urls: BTreeMap<ShortId, UrlRecord> = raw_urls
        .into_iter()
        .filter_map(|(id, raw)| match serde_json::from_value(raw) {
            Ok(record) => Some((id, record)),
            Err(err) => {
                warn!(%id, %err, "Skipping malformed record");
                None
            }
        })
        .collect();

    let user_urls = raw_user_urls
        .into_iter()
        .filter_map(|(owner, raw)| match serde_json::from_value::<Vec<ShortId>>(raw) {
            Ok(ids) => {
                let ids: Vec<_> = ids.into_iter().filter(|id| urls.contains_key(id)).collect();
                (!ids.is_empty()).then_some((owner, ids))
            }
            Err(err) => {
                warn!(?owner, %err, "Skipping malformed owner index entry");
                None
            }
        })
        .collect();

    Some(Snapshot { urls, user_urls })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn sample_record(owner: &str) -> UrlRecord {
        UrlRecord {
            original_url: "https://example.com/a".to_owned(),
            created: datetime!(2024-05-01 12:00:00 UTC),
            visits: 3,
            created_by: OwnerKey::new(owner),
        }
    }

    async fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&fs::read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");

        let file = SnapshotFile::open(path.clone()).await.unwrap();

        assert_eq!(read_json(&path).await, json!({ "urls": {}, "userUrls": {} }));
        assert_eq!(file.load().await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn test_open_keeps_valid_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let existing = json!({
            "urls": {
                "abc123": {
                    "originalUrl": "https://example.com/a",
                    "created": "2024-05-01T12:00:00.000Z",
                    "visits": 3,
                    "createdBy": "10.0.0.1"
                }
            },
            "userUrls": { "10.0.0.1": ["abc123"] }
        });
        fs::write(&path, existing.to_string()).await.unwrap();

        let file = SnapshotFile::open(path).await.unwrap();
        let snapshot = file.load().await.unwrap();

        assert_eq!(
            snapshot.urls.get(&ShortId::from("abc123".to_owned())),
            Some(&sample_record("10.0.0.1"))
        );
        assert_eq!(
            snapshot.user_urls.get(&OwnerKey::new("10.0.0.1")),
            Some(&vec![ShortId::from("abc123".to_owned())])
        );
    }

    #[tokio::test]
    async fn test_open_repairs_snapshot_missing_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        fs::write(&path, r#"{ "urls": {} }"#).await.unwrap();

        SnapshotFile::open(path.clone()).await.unwrap();

        assert_eq!(read_json(&path).await, json!({ "urls": {}, "userUrls": {} }));
    }

    #[tokio::test]
    async fn test_open_keeps_good_records_next_to_malformed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let existing = json!({
            "urls": {
                "good01": {
                    "originalUrl": "https://example.com/a",
                    "created": "2024-05-01T12:00:00.000Z",
                    "visits": 3,
                    "createdBy": "10.0.0.1"
                },
                "bad002": {
                    "originalUrl": "https://example.com/b",
                    "created": "2024-05-01T12:00:00.000Z",
                    "visits": 0
                }
            },
            "userUrls": {
                "10.0.0.1": ["good01", "bad002"],
                "10.0.0.2": "not a list"
            }
        });
        fs::write(&path, existing.to_string()).await.unwrap();

        let file = SnapshotFile::open(path.clone()).await.unwrap();

        assert_eq!(read_json(&path).await, existing);
        let snapshot = file.load().await.unwrap();
        let good01 = ShortId::from("good01".to_owned());
        assert_eq!(
            snapshot.urls.into_iter().collect::<Vec<_>>(),
            [(good01.clone(), sample_record("10.0.0.1"))]
        );
        assert_eq!(
            snapshot.user_urls.into_iter().collect::<Vec<_>>(),
            [(OwnerKey::new("10.0.0.1"), vec![good01])]
        );
    }

    #[tokio::test]
    async fn test_load_treats_malformed_document_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let file = SnapshotFile::open(path.clone()).await.unwrap();

        fs::write(&path, "not json at all").await.unwrap();
        assert_eq!(file.load().await.unwrap(), Snapshot::default());

        fs::write(&path, r#"{ "userUrls": {} }"#).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn test_load_treats_missing_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let file = SnapshotFile::open(path.clone()).await.unwrap();

        fs::remove_file(&path).await.unwrap();

        assert_eq!(file.load().await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn test_transact_commit_persists_both_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let file = SnapshotFile::open(path.clone()).await.unwrap();

        let returned = file
            .transact(|snapshot| {
                let id = ShortId::from("abc123".to_owned());
                snapshot.urls.insert(id.clone(), sample_record("10.0.0.1"));
                snapshot
                    .user_urls
                    .entry(OwnerKey::new("10.0.0.1"))
                    .or_default()
                    .push(id);
                Transaction::Commit(42)
            })
            .await
            .unwrap();

        assert_eq!(returned, 42);
        let on_disk = read_json(&path).await;
        assert_eq!(on_disk["urls"]["abc123"]["originalUrl"], "https://example.com/a");
        assert_eq!(on_disk["urls"]["abc123"]["visits"], 3);
        assert_eq!(on_disk["urls"]["abc123"]["createdBy"], "10.0.0.1");
        assert_eq!(on_disk["userUrls"]["10.0.0.1"], json!(["abc123"]));
        assert!(!file.temp_path().exists());
    }

    #[tokio::test]
    async fn test_transact_rollback_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        let file = SnapshotFile::open(path.clone()).await.unwrap();
        let before = fs::read(&path).await.unwrap();

        let returned = file
            .transact(|snapshot| {
                snapshot
                    .urls
                    .insert(ShortId::from("abc123".to_owned()), sample_record("10.0.0.1"));
                Transaction::Rollback("skipped")
            })
            .await
            .unwrap();

        assert_eq!(returned, "skipped");
        assert_eq!(fs::read(&path).await.unwrap(), before);
    }

    #[test]
    fn test_temp_path_is_a_sibling() {
        let file = SnapshotFile {
            path: Path::new("/var/lib/snapshort/urls.json").into(),
            write_lock: Arc::default(),
        };
        assert_eq!(
            file.temp_path(),
            PathBuf::from("/var/lib/snapshort/urls.json.tmp")
        );
    }
}
