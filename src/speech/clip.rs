//! Speech clip types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::Persona;

/// What the caller asked to have spoken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub text: String,
    pub persona: Persona,
    /// Optional delivery hint (e.g. "menacing", "cheerful")
    pub emotion: Option<String>,
}

impl SpeechRequest {
    #[must_use]
    pub fn new(text: impl Into<String>, persona: Persona) -> Self {
        Self {
            text: text.into(),
            persona,
            emotion: None,
        }
    }

    #[must_use]
    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }
}

/// Audio for a clip, filled in once synthesis resolves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipPayload {
    /// Synthesis still in flight
    Pending,
    /// Encoded audio ready to play
    Ready(Vec<u8>),
    /// Synthesis or download failed; the slot plays as silence
    Failed(String),
}

/// One utterance in the speech timeline
#[derive(Debug, Clone)]
pub struct SpeechClip {
    /// Position in the timeline, assigned when `speak` is called
    pub sequence: u64,
    pub text: String,
    pub persona: Persona,
    pub emotion: Option<String>,
    pub payload: ClipPayload,
}

impl SpeechClip {
    pub(crate) fn new(sequence: u64, request: SpeechRequest) -> Self {
        Self {
            sequence,
            text: request.text,
            persona: request.persona,
            emotion: request.emotion,
            payload: ClipPayload::Pending,
        }
    }

    /// Whether the payload has resolved, successfully or not
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.payload, ClipPayload::Pending)
    }
}

/// Metadata for the clip currently producing audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayingClip {
    pub sequence: u64,
    pub text: String,
    pub persona: Persona,
    pub emotion: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl PlayingClip {
    pub(crate) fn from_clip(clip: &SpeechClip) -> Self {
        Self {
            sequence: clip.sequence,
            text: clip.text.clone(),
            persona: clip.persona,
            emotion: clip.emotion.clone(),
            started_at: Utc::now(),
        }
    }
}

/// Playback progress notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SequencerEvent {
    /// A clip began playing
    Started { clip: PlayingClip },
    /// A clip finished playing (or its playback errored)
    Finished { sequence: u64 },
    /// A failed clip was passed over
    Skipped { sequence: u64, reason: String },
}

impl SequencerEvent {
    /// Sequence number the event refers to
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Started { clip } => clip.sequence,
            Self::Finished { sequence } | Self::Skipped { sequence, .. } => *sequence,
        }
    }

    /// Whether the cursor has moved past this clip
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Skipped { .. })
    }
}
