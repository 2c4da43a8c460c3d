//! Reverie Core - Data Types
//!
//! Requests, cache keys, artifacts, quota state and the error taxonomy shared
//! by every other crate. Nothing in here performs I/O.

pub mod artifact;
pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod quota;
pub mod request;

pub use artifact::{
    compute_content_hash, Artifact, ArtifactRecord, PersonalizedText, SourceMetadata,
    SpeechAudio,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    LocalTierConfig, MemoryTierConfig, PreloadConfig, QuotaConfig, RemoteTierConfig,
    ReverieConfig,
};
pub use error::{
    ConfigError, GenerationError, QuotaDenial, ReverieError, ReverieResult, TierError, TierKind,
};
pub use key::{
    canonical_number, CacheKey, CacheKeySource, CanonicalKeyDeriver, KeyDeriver, KeyFields,
    CACHE_KEY_LEN,
};
pub use quota::{
    GovernorState, InMemoryQuotaStore, QuotaLimits, QuotaSnapshot, QuotaState, QuotaStore,
    ResetSchedule,
};
pub use request::{
    ExperienceLevel, PersonalizationContext, PersonalizationRequest, SpeechRequest, Tone,
    PERSONALIZE_NAMESPACE, SPEECH_NAMESPACE,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
