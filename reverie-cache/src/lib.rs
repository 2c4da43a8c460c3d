//! Reverie Cache - Tiered Generative-Content Cache
//!
//! Serves expensive generated artifacts (personalized text, synthesized
//! speech) from the fastest tier that holds them and generates them on a full
//! miss, behind a quota governor and a request coalescer.
//!
//! ```ignore
//! let config = ReverieConfig::from_env();
//! let speech = TieredCache::builder(Arc::new(synthesizer))
//!     .configure(&config, SPEECH_NAMESPACE)
//!     .await?
//!     .build();
//!
//! let audio = speech.fetch(&SpeechRequest::new("Breathe deeply").with_voice("X")).await?;
//! ```

pub mod coalescer;
pub mod maintenance;
pub mod orchestrator;
pub mod preload;
pub mod stats;
pub mod telemetry;

pub use coalescer::{CoalesceRole, RequestCoalescer};
pub use maintenance::{
    maintenance_pass, maintenance_task, spawn_maintenance, MaintenanceConfig, MaintenanceHandle,
    MaintenanceMetrics, MaintenanceSnapshot,
};
pub use orchestrator::{ClearReport, ClearScope, FetchSource, Fetched, TieredCache, TieredCacheBuilder};
pub use preload::{PreloadOutcome, PreloadProgress, PreloadSummary};
pub use stats::CacheStatsReport;
pub use telemetry::{init_tracing, TelemetryConfig};

/// Cache for personalized visualization text.
pub type PersonalizationCache<G, K = reverie_core::CanonicalKeyDeriver> = TieredCache<G, K>;

/// Cache for synthesized speech.
pub type SpeechCache<G, K = reverie_core::CanonicalKeyDeriver> = TieredCache<G, K>;
