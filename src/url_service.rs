use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use tracing::{error, instrument, warn};

use crate::{
    api::{OwnedUrl, ShortenedUrl},
    url_repo::{
        DeleteRecordError, OwnerKey, SaveUrlError, ShortId, UrlRecord, UrlRepository,
        url_repository_capsule,
    },
};

/// Scheme and authority this service is reachable under, without a trailing
/// slash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseAddress(String);

impl BaseAddress {
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self(base)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn short_url(&self, short_id: &ShortId) -> String {
        format!("{}/{short_id}", self.0)
    }

    /// Whether `url` already points at this service (case-sensitive).
    #[must_use]
    pub fn is_self_reference(&self, url: &str) -> bool {
        url.strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug)]
pub struct Redirect {
    pub url: String,
}

pub fn url_rest_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRestService> {
    let url_repo = Arc::clone(get.as_ref(url_repository_capsule));
    Arc::new(UrlRestServiceImpl { url_repo })
}

#[async_trait]
pub trait UrlRestService: Send + Sync {
    async fn shorten_url(
        &self,
        url: Option<String>,
        base: &BaseAddress,
        owner: &OwnerKey,
    ) -> Result<ShortenedUrl, PostUrlError>;
    async fn list_owner_urls(
        &self,
        base: &BaseAddress,
        owner: &OwnerKey,
    ) -> anyhow::Result<Vec<OwnedUrl>>;
    async fn get_url_stats(&self, short_id: &ShortId) -> Result<UrlRecord, GetUrlError>;
    async fn visit_url(&self, short_id: &ShortId) -> Result<Redirect, GetUrlError>;
    async fn delete_url(&self, short_id: &ShortId, owner: &OwnerKey)
    -> Result<(), DeleteUrlError>;
}

#[derive(Debug, Error)]
pub enum PostUrlError {
    #[error("URL is required")]
    MissingUrl,
    #[error("Cannot shorten URLs that are already shortened by this service")]
    SelfReference,
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum GetUrlError {
    #[error("URL not found")]
    NotFound,
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DeleteUrlError {
    #[error("URL not found")]
    NotFound,
    #[error("Not authorized to delete this URL")]
    NotOwner,
    #[error("internal/storage error: {0}")]
    Internal(anyhow::Error),
}

struct UrlRestServiceImpl {
    url_repo: Arc<dyn UrlRepository>,
}

#[async_trait]
impl UrlRestService for UrlRestServiceImpl {
    #[instrument(skip(self))]
    async fn shorten_url(
        &self,
        url: Option<String>,
        base: &BaseAddress,
        owner: &OwnerKey,
    ) -> Result<ShortenedUrl, PostUrlError> {
        const CREATE_ATTEMPTS: usize = 3;

        let url = url
            .filter(|url| !url.is_empty())
            .ok_or(PostUrlError::MissingUrl)?;
        if base.is_self_reference(&url) {
            return Err(PostUrlError::SelfReference);
        }

        for _ in 0..CREATE_ATTEMPTS {
            let short_id = ShortId::generate();

            match self
                .url_repo
                .create_url(&short_id, url.clone(), owner)
                .await
            {
                Ok(_) => {
                    return Ok(ShortenedUrl {
                        short_url: base.short_url(&short_id),
                        short_id: short_id.into_inner(),
                    });
                }
                // NOTE: retryable; draw another id
                Err(SaveUrlError::ShortIdTaken) => {
                    warn!(%short_id, "Generated ShortId that was already taken");
                }
                Err(SaveUrlError::Storage(err)) => {
                    error!(?err, "Failed to save shortened URL");
                    return Err(PostUrlError::Internal(
                        anyhow::Error::new(err).context("Failed to save shortened URL"),
                    ));
                }
            }
        }

        Err(PostUrlError::Internal(anyhow!("Exhausted retry attempts")))
    }

    #[instrument(skip(self))]
    async fn list_owner_urls(
        &self,
        base: &BaseAddress,
        owner: &OwnerKey,
    ) -> anyhow::Result<Vec<OwnedUrl>> {
        let urls = self.url_repo.list_urls_for_owner(owner).await?;
        Ok(urls
            .into_iter()
            .map(|(short_id, record)| OwnedUrl {
                short_url: base.short_url(&short_id),
                short_id: short_id.into_inner(),
                record,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_url_stats(&self, short_id: &ShortId) -> Result<UrlRecord, GetUrlError> {
        match self.url_repo.retrieve_url(short_id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(GetUrlError::NotFound),
            Err(err) => Err(GetUrlError::Internal(err.into())),
        }
    }

    #[instrument(skip(self))]
    async fn visit_url(&self, short_id: &ShortId) -> Result<Redirect, GetUrlError> {
        match self.url_repo.increment_visits(short_id).await {
            Ok(Some(record)) => Ok(Redirect {
                url: record.original_url,
            }),
            Ok(None) => Err(GetUrlError::NotFound),
            Err(err) => Err(GetUrlError::Internal(err.into())),
        }
    }

    #[instrument(skip(self))]
    async fn delete_url(
        &self,
        short_id: &ShortId,
        owner: &OwnerKey,
    ) -> Result<(), DeleteUrlError> {
        match self.url_repo.delete_url(short_id, owner).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(DeleteUrlError::NotFound),
            Err(DeleteRecordError::NotOwner) => Err(DeleteUrlError::NotOwner),
            Err(DeleteRecordError::Storage(err)) => Err(DeleteUrlError::Internal(err.into())),
        }
    }
}
