use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::url_repo::UrlRecord;

#[derive(Debug, Deserialize)]
pub struct ShortenUrlPayload {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortenedUrl {
    pub short_id: String,
    pub short_url: String,
}

/// One entry of the caller's own URLs: the stored record plus its id and
/// fully-qualified short URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedUrl {
    pub short_id: String,
    #[serde(flatten)]
    pub record: UrlRecord,
    pub short_url: String,
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub error: String,
    pub error_id: String,
}

impl Error {
    #[must_use]
    pub fn new(error: impl Into<String>, error_id: Uuid) -> Self {
        Self {
            error: error.into(),
            error_id: error_id.to_string(),
        }
    }
}
