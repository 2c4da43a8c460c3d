//! Deterministic mock providers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reverie_core::{
    compute_content_hash, CacheKeySource, GenerationError, PersonalizationRequest,
    PersonalizedText, SpeechAudio, SpeechRequest,
};

use crate::Generator;

/// Mock text personalizer. Output depends only on the request.
#[derive(Debug, Default)]
pub struct MockPersonalizer {
    calls: AtomicU64,
    latency: Duration,
}

impl MockPersonalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockPersonalizer {
    type Request = PersonalizationRequest;
    type Output = PersonalizedText;

    fn name(&self) -> &str {
        "mock-personalizer"
    }

    async fn generate(
        &self,
        request: &PersonalizationRequest,
    ) -> Result<PersonalizedText, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let base = request.base_text.trim();
        if base.is_empty() {
            return Err(GenerationError::InvalidOutput {
                provider: self.name().to_string(),
                reason: "template has no base text".to_string(),
            });
        }

        let ctx = &request.context;
        let mut text = format!("[{}] ", ctx.effective_tone().as_str());
        if let Some(sport) = &ctx.sport {
            text.push_str(&format!("As a {} athlete, ", sport.trim().to_lowercase()));
        }
        text.push_str(base);
        if let Some(focus) = &ctx.focus {
            text.push_str(&format!(" Keep your focus on {}.", focus.trim().to_lowercase()));
        }
        Ok(PersonalizedText::new(text))
    }
}

/// Mock speech synthesizer producing deterministic pseudo-audio whose length
/// scales with the text.
#[derive(Debug)]
pub struct MockSynthesizer {
    calls: AtomicU64,
    latency: Duration,
    bytes_per_char: usize,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self {
            calls: AtomicU64::new(0),
            latency: Duration::ZERO,
            bytes_per_char: 16,
        }
    }
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_bytes_per_char(mut self, bytes_per_char: usize) -> Self {
        self.bytes_per_char = bytes_per_char.max(1);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockSynthesizer {
    type Request = SpeechRequest;
    type Output = SpeechAudio;

    fn name(&self) -> &str {
        "mock-synthesizer"
    }

    async fn generate(&self, request: &SpeechRequest) -> Result<SpeechAudio, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let text = request.text.trim();
        if text.is_empty() {
            return Err(GenerationError::InvalidOutput {
                provider: self.name().to_string(),
                reason: "nothing to synthesize".to_string(),
            });
        }

        // seed from every output-affecting field so distinct requests differ
        let fields = format!("{:?}", request.key_fields().to_map());
        let seed = compute_content_hash(fields.as_bytes()).into_bytes();
        let len = text.chars().count() * self.bytes_per_char;

        let mut audio = Vec::with_capacity(len + 3);
        audio.extend_from_slice(b"ID3");
        audio.extend(seed.iter().cycle().take(len));
        Ok(SpeechAudio::new(audio))
    }
}
