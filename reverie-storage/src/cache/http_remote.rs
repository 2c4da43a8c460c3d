//! HTTP-backed remote store.
//!
//! Layout under `base_url`:
//! - `GET|PUT|DELETE {base}/metadata/{key}`: JSON [`RemoteEntry`]
//! - `GET|PUT|DELETE {base}/blobs/{key}`: raw artifact bytes

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};

use reverie_core::{CacheKey, SourceMetadata, TierError, TierKind};

use super::remote::{RemoteEntry, RemoteStore};

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn metadata_url(&self, key: &CacheKey) -> String {
        format!("{}/metadata/{}", self.base_url, key)
    }

    fn blob_url(&self, key: &CacheKey) -> String {
        format!("{}/blobs/{}", self.base_url, key)
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> TierError {
    TierError::unavailable(TierKind::Remote, format!("{}: {}", context, err))
}

fn status_error(context: &str, status: StatusCode) -> TierError {
    TierError::unavailable(TierKind::Remote, format!("{} returned HTTP {}", context, status))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<RemoteEntry>, TierError> {
        let response = self
            .client
            .get(self.metadata_url(key))
            .send()
            .await
            .map_err(|e| unavailable("metadata lookup", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let entry: RemoteEntry = response.json().await.map_err(|e| TierError::Serialization {
                    reason: format!("invalid remote metadata: {}", e),
                })?;
                if &entry.key != key {
                    return Err(TierError::CorruptEntry {
                        tier: TierKind::Remote,
                        key: key.clone(),
                        reason: format!("metadata names key {}", entry.key),
                    });
                }
                Ok(Some(entry))
            }
            status => Err(status_error("metadata lookup", status)),
        }
    }

    async fn download(&self, entry: &RemoteEntry) -> Result<Vec<u8>, TierError> {
        let response = self
            .client
            .get(&entry.url)
            .send()
            .await
            .map_err(|e| unavailable("blob download", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("blob download", status));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable("blob download", e))?;
        Ok(bytes.to_vec())
    }

    async fn upload(
        &self,
        key: &CacheKey,
        bytes: Vec<u8>,
        source: &SourceMetadata,
    ) -> Result<String, TierError> {
        let url = self.blob_url(key);
        let byte_size = bytes.len() as u64;

        // blob first so metadata never points at a missing object
        let response = self
            .client
            .put(&url)
            .header("Content-Type", source.content_type.as_str())
            .body(bytes)
            .send()
            .await
            .map_err(|e| unavailable("blob upload", e))?;
        if !response.status().is_success() {
            return Err(status_error("blob upload", response.status()));
        }

        let entry = RemoteEntry {
            key: key.clone(),
            url: url.clone(),
            byte_size,
            source: source.clone(),
            uploaded_at: Utc::now(),
        };
        let response = self
            .client
            .put(self.metadata_url(key))
            .json(&entry)
            .send()
            .await
            .map_err(|e| unavailable("metadata write", e))?;
        if !response.status().is_success() {
            return Err(status_error("metadata write", response.status()));
        }

        Ok(url)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), TierError> {
        for url in [self.metadata_url(key), self.blob_url(key)] {
            let response = self
                .client
                .delete(&url)
                .send()
                .await
                .map_err(|e| unavailable("delete", e))?;
            let status = response.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                return Err(status_error("delete", status));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}
