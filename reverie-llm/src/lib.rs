//! Reverie LLM - Generation Capability
//!
//! Provider-agnostic [`Generator`] trait for the two expensive upstream calls
//! (text personalization and speech synthesis), the [`QuotaGovernor`] that
//! gates them, and deterministic mock providers.

pub mod governor;
pub mod mock;

pub use governor::{QuotaDecision, QuotaGovernor, QuotaReservation};
pub use mock::{MockPersonalizer, MockSynthesizer};

use async_trait::async_trait;
use reverie_core::{Artifact, GenerationError};

// ============================================================================
// GENERATOR TRAIT
// ============================================================================

/// A pluggable generation provider.
///
/// Implementations own their timeouts. Quota and rate-limit rejections must be
/// reported as [`GenerationError::ProviderQuotaExceeded`] or
/// [`GenerationError::ProviderRateLimited`] so the governor can back off.
///
/// # Example
/// ```ignore
/// struct CloudTts { /* ... */ }
///
/// #[async_trait]
/// impl Generator for CloudTts {
///     type Request = SpeechRequest;
///     type Output = SpeechAudio;
///
///     fn name(&self) -> &str { "cloud-tts" }
///
///     async fn generate(&self, request: &SpeechRequest) -> Result<SpeechAudio, GenerationError> {
///         // call the provider
///     }
/// }
/// ```
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    type Request: Clone + Send + Sync + 'static;
    type Output: Artifact;

    /// Provider identifier recorded in artifact provenance.
    fn name(&self) -> &str;

    async fn generate(&self, request: &Self::Request) -> Result<Self::Output, GenerationError>;
}

// ============================================================================
// PROVIDER RESPONSE CLASSIFICATION
// ============================================================================

/// Map a failed provider HTTP response onto the generation error taxonomy.
///
/// Providers signal "daily budget spent" and "slow down" with the same 429
/// status; the body tells them apart.
pub fn classify_provider_failure(
    provider: &str,
    status: u16,
    body: &str,
    retry_after_ms: Option<i64>,
) -> GenerationError {
    let lowered = body.to_ascii_lowercase();
    let mentions_quota = lowered.contains("quota")
        || lowered.contains("resource_exhausted")
        || lowered.contains("billing");

    match status {
        429 | 403 if mentions_quota => GenerationError::ProviderQuotaExceeded {
            provider: provider.to_string(),
            message: body.to_string(),
        },
        429 => GenerationError::ProviderRateLimited {
            provider: provider.to_string(),
            retry_after_ms: retry_after_ms.unwrap_or(0),
        },
        0 => GenerationError::Network {
            reason: body.to_string(),
        },
        _ => GenerationError::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {}: {}", status, body),
        },
    }
}

/// Parse a `Retry-After` header value given in seconds.
pub fn parse_retry_after_ms(value: &str) -> Option<i64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
        .map(|seconds| (seconds * 1000.0) as i64)
}
