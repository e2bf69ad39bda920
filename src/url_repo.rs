use std::{fmt, sync::Arc};

use async_trait::async_trait;
use rand::distr::{Alphanumeric, SampleString};
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{instrument, warn};

use crate::{
    config::snapshot_file_capsule,
    snapshot::{SnapshotFile, StorageError, Transaction},
};

/// Public key of a shortened URL.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortId(String);

impl ShortId {
    pub const LEN: usize = 6;

    /// Draws a new random id of [`Self::LEN`] alphanumeric characters.
    #[must_use]
    pub fn generate() -> Self {
        Self(Alphanumeric.sample_string(&mut rand::rng(), Self::LEN))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for ShortId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identity of whoever created a record.
///
/// Only ever compared for equality; how it is derived from a request is up to
/// the HTTP layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlRecord {
    /// Target URL, stored exactly as submitted
    pub original_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub visits: u64,
    pub created_by: OwnerKey,
}

#[derive(Debug, Error)]
pub enum SaveUrlError {
    #[error("short ID is already taken")]
    ShortIdTaken,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum DeleteRecordError {
    #[error("record belongs to a different owner")]
    NotOwner,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub fn url_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRepository> {
    let file = get.as_ref(snapshot_file_capsule).clone();
    Arc::new(SnapshotUrlRepository { file })
}

#[async_trait]
pub trait UrlRepository: Send + Sync {
    /// Inserts a fresh record with zero visits and appends its id to the
    /// owner's index.
    async fn create_url(
        &self,
        short_id: &ShortId,
        original_url: String,
        owner: &OwnerKey,
    ) -> Result<UrlRecord, SaveUrlError>;

    /// Returns the owner's records in the order they were created.
    async fn list_urls_for_owner(
        &self,
        owner: &OwnerKey,
    ) -> Result<Vec<(ShortId, UrlRecord)>, StorageError>;

    async fn retrieve_url(&self, short_id: &ShortId) -> Result<Option<UrlRecord>, StorageError>;

    /// Adds one visit and returns the updated record.
    async fn increment_visits(
        &self,
        short_id: &ShortId,
    ) -> Result<Option<UrlRecord>, StorageError>;

    /// Removes the record and its index entry if `owner` created it.
    async fn delete_url(
        &self,
        short_id: &ShortId,
        owner: &OwnerKey,
    ) -> Result<Option<UrlRecord>, DeleteRecordError>;
}

struct SnapshotUrlRepository {
    file: SnapshotFile,
}

#[async_trait]
impl UrlRepository for SnapshotUrlRepository {
    #[instrument(skip(self))]
    async fn create_url(
        &self,
        short_id: &ShortId,
        original_url: String,
        owner: &OwnerKey,
    ) -> Result<UrlRecord, SaveUrlError> {
        let record = UrlRecord {
            original_url,
            created: OffsetDateTime::now_utc(),
            visits: 0,
            created_by: owner.clone(),
        };

        self.file
            .transact(|snapshot| {
                if snapshot.urls.contains_key(short_id) {
                    return Transaction::Rollback(Err(SaveUrlError::ShortIdTaken));
                }
                snapshot.urls.insert(short_id.clone(), record.clone());
                snapshot
                    .user_urls
                    .entry(owner.clone())
                    .or_default()
                    .push(short_id.clone());
                Transaction::Commit(Ok(record))
            })
            .await?
    }

    #[instrument(skip(self))]
    async fn list_urls_for_owner(
        &self,
        owner: &OwnerKey,
    ) -> Result<Vec<(ShortId, UrlRecord)>, StorageError> {
        let mut snapshot = self.file.load().await?;
        let ids = snapshot.user_urls.remove(owner).unwrap_or_default();

        Ok(ids
            .into_iter()
            .filter_map(|id| match snapshot.urls.remove(&id) {
                Some(record) => Some((id, record)),
                None => {
                    warn!(%id, "Owner index points at a missing record");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn retrieve_url(&self, short_id: &ShortId) -> Result<Option<UrlRecord>, StorageError> {
        Ok(self.file.load().await?.urls.remove(short_id))
    }

    #[instrument(skip(self))]
    async fn increment_visits(
        &self,
        short_id: &ShortId,
    ) -> Result<Option<UrlRecord>, StorageError> {
        self.file
            .transact(|snapshot| match snapshot.urls.get_mut(short_id) {
                Some(record) => {
                    record.visits = record.visits.saturating_add(1);
                    Transaction::Commit(Some(record.clone()))
                }
                None => Transaction::Rollback(None),
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_url(
        &self,
        short_id: &ShortId,
        owner: &OwnerKey,
    ) -> Result<Option<UrlRecord>, DeleteRecordError> {
        self.file
            .transact(|snapshot| {
                match snapshot.urls.get(short_id) {
                    None => return Transaction::Rollback(Ok(None)),
                    Some(record) if record.created_by != *owner => {
                        return Transaction::Rollback(Err(DeleteRecordError::NotOwner));
                    }
                    Some(_) => {}
                }

                let removed = snapshot.urls.remove(short_id);
                if let Some(ids) = snapshot.user_urls.get_mut(owner) {
                    if let Some(position) = ids.iter().position(|id| id == short_id) {
                        ids.remove(position);
                    }
                    if ids.is_empty() {
                        snapshot.user_urls.remove(owner);
                    }
                }
                Transaction::Commit(Ok(removed))
            })
            .await?
    }
}
