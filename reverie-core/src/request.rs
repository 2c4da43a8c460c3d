//! Generation requests.
//!
//! There is exactly one schema per artifact kind. Whether content is
//! personalized is implied by the request type, never by a separate flag.

use serde::{Deserialize, Serialize};

use crate::key::{canonical_number, CacheKeySource, KeyFields};

pub const SPEECH_NAMESPACE: &str = "speech";
pub const PERSONALIZE_NAMESPACE: &str = "personalize";

pub const DEFAULT_SPEECH_SPEED: f32 = 1.0;
pub const DEFAULT_SPEECH_PITCH: f32 = 0.0;

/// Text-to-speech synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Option<String>,
    pub model: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub language: Option<String>,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            model: None,
            speed: None,
            pitch: None,
            language: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Stored at key precision, see [`canonical_number`].
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(canonical_number(speed));
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = Some(canonical_number(pitch));
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Speed to send to the provider. Always the value the key was derived
    /// from, even when `speed` was set directly.
    pub fn effective_speed(&self) -> f32 {
        canonical_number(self.speed.unwrap_or(DEFAULT_SPEECH_SPEED))
    }

    pub fn effective_pitch(&self) -> f32 {
        canonical_number(self.pitch.unwrap_or(DEFAULT_SPEECH_PITCH))
    }
}

impl CacheKeySource for SpeechRequest {
    fn key_fields(&self) -> KeyFields {
        KeyFields::new(SPEECH_NAMESPACE)
            .text("text", &self.text)
            .ident("voice", self.voice.as_deref())
            .ident("model", self.model.as_deref())
            .number("speed", self.speed, DEFAULT_SPEECH_SPEED)
            .number("pitch", self.pitch, DEFAULT_SPEECH_PITCH)
            .label("language", self.language.as_deref())
    }
}

/// Delivery tone for personalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Calm,
    Energizing,
    Focused,
    Confident,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Energizing => "energizing",
            Self::Focused => "focused",
            Self::Confident => "confident",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    Beginner,
    Intermediate,
    Advanced,
    Elite,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
            Self::Elite => "elite",
        }
    }
}

/// Athlete context that shapes a personalized script.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersonalizationContext {
    pub sport: Option<String>,
    pub tone: Option<Tone>,
    pub experience_level: Option<ExperienceLevel>,
    pub focus: Option<String>,
}

impl PersonalizationContext {
    pub fn for_sport(sport: impl Into<String>) -> Self {
        Self {
            sport: Some(sport.into()),
            ..Self::default()
        }
    }

    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = Some(tone);
        self
    }

    pub fn with_experience(mut self, level: ExperienceLevel) -> Self {
        self.experience_level = Some(level);
        self
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = Some(focus.into());
        self
    }

    pub fn effective_tone(&self) -> Tone {
        self.tone.unwrap_or_default()
    }
}

/// Request to personalize a visualization template's base text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationRequest {
    pub template_id: String,
    pub base_text: String,
    pub context: PersonalizationContext,
}

impl PersonalizationRequest {
    pub fn new(
        template_id: impl Into<String>,
        base_text: impl Into<String>,
        context: PersonalizationContext,
    ) -> Self {
        Self {
            template_id: template_id.into(),
            base_text: base_text.into(),
            context,
        }
    }
}

impl CacheKeySource for PersonalizationRequest {
    fn key_fields(&self) -> KeyFields {
        let tone = self.context.tone.filter(|t| *t != Tone::default());
        KeyFields::new(PERSONALIZE_NAMESPACE)
            .ident("template", Some(&self.template_id))
            .text("base_text", &self.base_text)
            .label("sport", self.context.sport.as_deref())
            .label("tone", tone.as_ref().map(Tone::as_str))
            .label(
                "experience",
                self.context.experience_level.as_ref().map(ExperienceLevel::as_str),
            )
            .label("focus", self.context.focus.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{CanonicalKeyDeriver, KeyDeriver};

    #[test]
    fn test_speech_defaults_canonicalize() {
        let deriver = CanonicalKeyDeriver::new();
        let bare = SpeechRequest::new("Breathe deeply").with_voice("X");
        let explicit = SpeechRequest::new("  Breathe deeply ")
            .with_voice("X")
            .with_speed(1.0)
            .with_pitch(-0.0);
        assert_eq!(deriver.derive(&bare), deriver.derive(&explicit));
    }

    #[test]
    fn test_sub_precision_speed_reaches_provider_as_keyed() {
        let deriver = CanonicalKeyDeriver::new();
        let nudged = SpeechRequest::new("Breathe deeply").with_speed(1.004);
        assert_eq!(nudged.effective_speed(), 1.0);
        assert_eq!(deriver.derive(&nudged), deriver.derive(&SpeechRequest::new("Breathe deeply")));

        let mut direct = SpeechRequest::new("Breathe deeply");
        direct.pitch = Some(0.333);
        assert_eq!(direct.effective_pitch(), 0.33);
    }

    #[test]
    fn test_speech_output_parameters_change_key() {
        let deriver = CanonicalKeyDeriver::new();
        let base = SpeechRequest::new("Breathe deeply").with_voice("X");
        let variants = [
            base.clone().with_voice("Y"),
            base.clone().with_speed(0.9),
            base.clone().with_pitch(2.0),
            base.clone().with_model("tts-hd"),
            base.clone().with_language("es-ES"),
            SpeechRequest::new("Breathe slowly").with_voice("X"),
        ];
        let base_key = deriver.derive(&base);
        for variant in &variants {
            assert_ne!(base_key, deriver.derive(variant), "{variant:?}");
        }
    }

    #[test]
    fn test_default_voice_matches_unset_voice() {
        let deriver = CanonicalKeyDeriver::new().with_default("voice", "en-US-Neural2-F");
        let unset = SpeechRequest::new("Relax");
        let explicit = SpeechRequest::new("Relax").with_voice("en-US-Neural2-F");
        assert_eq!(deriver.derive(&unset), deriver.derive(&explicit));
    }

    #[test]
    fn test_personalization_default_tone_and_case() {
        let deriver = CanonicalKeyDeriver::new();
        let a = PersonalizationRequest::new(
            "pre-game-1",
            "See yourself at the line.",
            PersonalizationContext::for_sport("Basketball"),
        );
        let b = PersonalizationRequest::new(
            "pre-game-1",
            "See yourself at the line.",
            PersonalizationContext::for_sport("basketball").with_tone(Tone::Calm),
        );
        assert_eq!(deriver.derive(&a), deriver.derive(&b));

        let c = PersonalizationRequest::new(
            "pre-game-1",
            "See yourself at the line.",
            PersonalizationContext::for_sport("basketball").with_tone(Tone::Energizing),
        );
        assert_ne!(deriver.derive(&a), deriver.derive(&c));
    }

    #[test]
    fn test_namespaces_never_collide() {
        let deriver = CanonicalKeyDeriver::new();
        let speech = SpeechRequest::new("same");
        let text = PersonalizationRequest::new("", "same", PersonalizationContext::default());
        assert_ne!(deriver.derive(&speech), deriver.derive(&text));
    }

    #[test]
    fn test_tone_serde_is_lowercase() {
        let json = serde_json::to_string(&Tone::Energizing).unwrap();
        assert_eq!(json, "\"energizing\"");
    }
}
