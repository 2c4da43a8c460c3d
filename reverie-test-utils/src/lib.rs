//! Reverie Test Utilities
//!
//! Centralized test infrastructure for the Reverie workspace:
//! - Proptest generators for requests, keys and artifacts
//! - Scriptable generators and remote stores for failure testing
//! - Test fixtures for common scenarios
//! - Custom assertions for Reverie error variants

pub use reverie_llm::{Generator, MockPersonalizer, MockSynthesizer, QuotaGovernor};
pub use reverie_storage::{InMemoryRemoteStore, RemoteEntry, RemoteStore};

pub use reverie_core::{
    compute_content_hash, Artifact, CacheKey, CacheKeySource, CanonicalKeyDeriver, Clock,
    ExperienceLevel, GenerationError, InMemoryQuotaStore, KeyDeriver, ManualClock,
    PersonalizationContext, PersonalizationRequest, PersonalizedText, QuotaDenial, QuotaLimits,
    ResetSchedule, ReverieConfig, ReverieError, ReverieResult, SourceMetadata, SpeechAudio,
    SpeechRequest, TierError, TierKind, Tone,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

// ============================================================================
// SCRIPTED PROVIDERS
// ============================================================================

/// Speech generator whose results are scripted per call.
///
/// Queued results are returned in order; once the queue is empty every call
/// succeeds with audio derived from the request text. A gated generator
/// blocks every call until [`open_gate`](Self::open_gate) is called.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Vec<u8>, GenerationError>>>,
    calls: AtomicU64,
    latency: Duration,
    gate: Option<(watch::Sender<bool>, watch::Receiver<bool>)>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            latency: Duration::ZERO,
            gate: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Hold every call until the gate opens.
    pub fn gated(mut self) -> Self {
        self.gate = Some(watch::channel(false));
        self
    }

    pub fn open_gate(&self) {
        if let Some((tx, _)) = &self.gate {
            let _ = tx.send(true);
        }
    }

    pub fn push_ok(&self, bytes: impl Into<Vec<u8>>) -> &Self {
        self.lock().push_back(Ok(bytes.into()));
        self
    }

    pub fn push_err(&self, error: GenerationError) -> &Self {
        self.lock().push_back(Err(error));
        self
    }

    /// Queue the provider's "daily quota spent" rejection.
    pub fn push_quota_error(&self) -> &Self {
        self.push_err(GenerationError::ProviderQuotaExceeded {
            provider: "scripted".to_string(),
            message: "RESOURCE_EXHAUSTED: daily quota exceeded".to_string(),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Vec<u8>, GenerationError>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Audio the scripted generator produces for `text` when nothing is queued.
pub fn default_audio_for(text: &str) -> Vec<u8> {
    let mut audio = b"ID3".to_vec();
    audio.extend_from_slice(compute_content_hash(text.trim().as_bytes()).as_bytes());
    audio
}

#[async_trait]
impl Generator for ScriptedGenerator {
    type Request = SpeechRequest;
    type Output = SpeechAudio;

    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &SpeechRequest) -> Result<SpeechAudio, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some((_, rx)) = &self.gate {
            let mut rx = rx.clone();
            let _ = rx.wait_for(|open| *open).await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self.lock().pop_front();
        match next {
            Some(Ok(bytes)) => Ok(SpeechAudio::new(bytes)),
            Some(Err(e)) => Err(e),
            None => Ok(SpeechAudio::new(default_audio_for(&request.text))),
        }
    }
}

/// Remote store that is always unreachable.
#[derive(Debug, Default)]
pub struct FailingRemoteStore {
    calls: AtomicU64,
}

impl FailingRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, op: &str) -> TierError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        TierError::unavailable(TierKind::Remote, format!("{} failed: connection refused", op))
    }
}

#[async_trait]
impl RemoteStore for FailingRemoteStore {
    async fn lookup(&self, _key: &CacheKey) -> Result<Option<RemoteEntry>, TierError> {
        Err(self.fail("lookup"))
    }

    async fn download(&self, _entry: &RemoteEntry) -> Result<Vec<u8>, TierError> {
        Err(self.fail("download"))
    }

    async fn upload(
        &self,
        _key: &CacheKey,
        _bytes: Vec<u8>,
        _source: &SourceMetadata,
    ) -> Result<String, TierError> {
        Err(self.fail("upload"))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), TierError> {
        Err(self.fail("delete"))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Reverie request and artifact types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_tone() -> impl Strategy<Value = Tone> {
        prop_oneof![
            Just(Tone::Calm),
            Just(Tone::Energizing),
            Just(Tone::Focused),
            Just(Tone::Confident),
        ]
    }

    pub fn arb_experience_level() -> impl Strategy<Value = ExperienceLevel> {
        prop_oneof![
            Just(ExperienceLevel::Beginner),
            Just(ExperienceLevel::Intermediate),
            Just(ExperienceLevel::Advanced),
            Just(ExperienceLevel::Elite),
        ]
    }

    /// Non-empty script text.
    pub fn arb_text() -> impl Strategy<Value = String> {
        "[A-Za-z][A-Za-z ,.]{0,60}"
    }

    pub fn arb_speech_request() -> impl Strategy<Value = SpeechRequest> {
        (
            arb_text(),
            prop::option::of("[a-z]{2}-[A-Z]{2}-[A-Za-z0-9]{1,8}"),
            prop::option::of(prop_oneof![Just("tts-1"), Just("tts-hd")]),
            prop::option::of(0.5f32..2.0),
            prop::option::of(-5.0f32..5.0),
            prop::option::of(prop_oneof![Just("en-US"), Just("es-ES")]),
        )
            .prop_map(|(text, voice, model, speed, pitch, language)| SpeechRequest {
                text,
                voice,
                model: model.map(str::to_string),
                speed,
                pitch,
                language: language.map(str::to_string),
            })
    }

    pub fn arb_personalization_context() -> impl Strategy<Value = PersonalizationContext> {
        (
            prop::option::of(prop_oneof![Just("basketball"), Just("golf"), Just("swimming")]),
            prop::option::of(arb_tone()),
            prop::option::of(arb_experience_level()),
            prop::option::of("[a-z]{3,12}"),
        )
            .prop_map(|(sport, tone, experience_level, focus)| PersonalizationContext {
                sport: sport.map(str::to_string),
                tone,
                experience_level,
                focus,
            })
    }

    pub fn arb_personalization_request() -> impl Strategy<Value = PersonalizationRequest> {
        ("[a-z]{3,8}-[0-9]{1,3}", arb_text(), arb_personalization_context()).prop_map(
            |(template_id, base_text, context)| {
                PersonalizationRequest::new(template_id, base_text, context)
            },
        )
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        any::<u128>().prop_filter_map("32 hex chars", |n| CacheKey::from_hex(&format!("{:032x}", n)))
    }

    pub fn arb_speech_audio(max_len: usize) -> impl Strategy<Value = SpeechAudio> {
        prop::collection::vec(any::<u8>(), 1..=max_len.max(1)).prop_map(SpeechAudio::new)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use chrono::{DateTime, Utc};
    use std::path::Path;
    use std::sync::Arc;

    /// 07:00 Los Angeles time; the next quota reset is 2026-03-03T08:00:00Z.
    pub fn test_start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T15:00:00Z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    pub fn test_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(test_start()))
    }

    /// Free-tier limits without request spacing.
    pub fn unspaced_limits(daily_limit: u32) -> QuotaLimits {
        QuotaLimits::free_tier()
            .with_daily_limit(daily_limit)
            .with_min_interval(Duration::ZERO)
    }

    /// Small budgets suitable for on-disk tests rooted at `dir`.
    pub fn test_config(dir: &Path) -> ReverieConfig {
        let mut config = ReverieConfig::default_for(dir);
        config.memory.max_bytes = 64 * 1024;
        config.local.max_bytes = 256 * 1024;
        config.local.index_map_size = 10 * 1024 * 1024;
        config.quota.limits = unspaced_limits(100);
        config.preload.batch_pause_ms = 0;
        config
    }

    /// Scenario A's request.
    pub fn breathe_deeply() -> SpeechRequest {
        SpeechRequest::new("Breathe deeply")
            .with_voice("X")
            .with_speed(1.0)
    }

    pub fn pre_game_request() -> PersonalizationRequest {
        PersonalizationRequest::new(
            "pre-game-1",
            "See the ball leave your hand.",
            PersonalizationContext::for_sport("basketball")
                .with_tone(Tone::Confident)
                .with_focus("follow-through"),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Reverie-specific error variants.

    use super::*;

    #[track_caller]
    pub fn assert_quota_exceeded<T: std::fmt::Debug>(result: &ReverieResult<T>) {
        match result {
            Err(ReverieError::Quota(QuotaDenial::QuotaExceeded { .. })) => {}
            other => panic!("Expected QuotaExceeded, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_rate_limited<T: std::fmt::Debug>(result: &ReverieResult<T>) {
        match result {
            Err(ReverieError::Quota(QuotaDenial::RateLimited { .. })) => {}
            other => panic!("Expected RateLimited, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_generation_error<T: std::fmt::Debug>(result: &ReverieResult<T>) {
        match result {
            Err(ReverieError::Generation(_)) => {}
            other => panic!("Expected Generation error, got: {:?}", other),
        }
    }

    /// Keys are 32 lowercase hex characters.
    #[track_caller]
    pub fn assert_valid_key(key: &CacheKey) {
        let s = key.as_str();
        assert_eq!(s.len(), 32, "key has wrong length: {}", s);
        assert!(
            s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)),
            "key is not lowercase hex: {}",
            s
        );
    }
}
