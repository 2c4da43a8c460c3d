//! Generated payloads and their bookkeeping records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{TierError, TierKind};
use crate::key::CacheKey;

/// Hex SHA-256 of a byte slice. Used to detect altered or truncated blobs.
pub fn compute_content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A cacheable generated payload.
///
/// Implementations must be cheap to clone; the memory tier hands out clones on
/// every hit.
pub trait Artifact: Clone + Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn to_bytes(&self) -> Vec<u8>;

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, TierError>;

    fn byte_size(&self) -> u64;
}

/// Personalized visualization script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonalizedText {
    text: Arc<str>,
}

impl PersonalizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Arc::from(text.into()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Artifact for PersonalizedText {
    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, TierError> {
        let text = String::from_utf8(bytes).map_err(|e| TierError::Serialization {
            reason: format!("personalized text is not UTF-8: {}", e),
        })?;
        Ok(Self::new(text))
    }

    fn byte_size(&self) -> u64 {
        self.text.len() as u64
    }
}

/// Synthesized audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    data: Arc<[u8]>,
}

impl SpeechAudio {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Artifact for SpeechAudio {
    fn content_type(&self) -> &'static str {
        "audio/mpeg"
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    fn from_bytes(bytes: Vec<u8>) -> Result<Self, TierError> {
        if bytes.is_empty() {
            return Err(TierError::Serialization {
                reason: "audio payload is empty".to_string(),
            });
        }
        Ok(Self::new(bytes))
    }

    fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Provenance of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub generator: String,
    pub namespace: String,
    pub parameters: BTreeMap<String, String>,
    pub content_type: String,
    pub content_hash: String,
}

impl SourceMetadata {
    pub fn describe<A: Artifact>(
        generator: impl Into<String>,
        namespace: impl Into<String>,
        parameters: BTreeMap<String, String>,
        artifact: &A,
    ) -> Self {
        Self {
            generator: generator.into(),
            namespace: namespace.into(),
            parameters,
            content_type: artifact.content_type().to_string(),
            content_hash: compute_content_hash(&artifact.to_bytes()),
        }
    }
}

/// Bookkeeping for one artifact resident in a persistent tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: CacheKey,
    pub tier: TierKind,
    /// File path for the local tier, URL for the remote tier.
    pub location: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub source: SourceMetadata,
}

impl ArtifactRecord {
    pub fn new(
        key: CacheKey,
        tier: TierKind,
        location: impl Into<String>,
        byte_size: u64,
        source: SourceMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            tier,
            location: location.into(),
            byte_size,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            source,
        }
    }

    /// Record a hit.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
