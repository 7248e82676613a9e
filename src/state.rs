//! Conversation signals shared between rendering and speech
//!
//! The show engine's render tick, the speech playback worker, and the
//! control layer all read and write the same [`ConversationSignals`]. Nothing
//! here does more than atomic get/set; generators branch on the values to
//! keep the panel in step with the audio.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Assistant persona voicing a clip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    /// Friendly assistant voice
    #[default]
    Benevolent,
    /// Malevolent alter ego
    Evil,
}

impl Persona {
    /// Stable lowercase identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Benevolent => "benevolent",
            Self::Evil => "evil",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Benevolent => 0,
            Self::Evil => 1,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Evil,
            _ => Self::Benevolent,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Persona {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "benevolent" | "good" | "nice" => Ok(Self::Benevolent),
            "evil" | "malevolent" | "spooky" => Ok(Self::Evil),
            other => Err(Error::Config(format!("unknown persona: {other}"))),
        }
    }
}

/// Coarse conversational mode derived from the individual flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Nothing is happening
    Idle,
    /// The user is talking to the assistant
    Listening,
    /// A reply is being generated
    Thinking,
    /// A clip is playing
    Speaking,
}

impl ConversationMode {
    /// Stable lowercase identifier
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independently settable flags read by generators and the control layer
#[derive(Debug, Default)]
pub struct ConversationSignals {
    speaking: AtomicBool,
    thinking: AtomicBool,
    listening: AtomicBool,
    persona: AtomicU8,
}

/// Plain copy of the signals at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalSnapshot {
    pub is_speaking: bool,
    pub is_thinking: bool,
    pub is_listening: bool,
    pub active_persona: Persona,
    pub mode: ConversationMode,
}

impl ConversationSignals {
    /// Create signals in the idle, benevolent state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }

    pub fn set_speaking(&self, value: bool) {
        self.speaking.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_thinking(&self) -> bool {
        self.thinking.load(Ordering::Acquire)
    }

    pub fn set_thinking(&self, value: bool) {
        self.thinking.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn set_listening(&self, value: bool) {
        self.listening.store(value, Ordering::Release);
    }

    #[must_use]
    pub fn active_persona(&self) -> Persona {
        Persona::from_u8(self.persona.load(Ordering::Acquire))
    }

    pub fn set_active_persona(&self, persona: Persona) {
        self.persona.store(persona.to_u8(), Ordering::Release);
    }

    /// Current mode; speaking wins over thinking, which wins over listening
    #[must_use]
    pub fn mode(&self) -> ConversationMode {
        derive_mode(self.is_speaking(), self.is_thinking(), self.is_listening())
    }

    /// Read every signal once
    #[must_use]
    pub fn snapshot(&self) -> SignalSnapshot {
        let is_speaking = self.is_speaking();
        let is_thinking = self.is_thinking();
        let is_listening = self.is_listening();

        SignalSnapshot {
            is_speaking,
            is_thinking,
            is_listening,
            active_persona: self.active_persona(),
            mode: derive_mode(is_speaking, is_thinking, is_listening),
        }
    }
}

const fn derive_mode(speaking: bool, thinking: bool, listening: bool) -> ConversationMode {
    if speaking {
        ConversationMode::Speaking
    } else if thinking {
        ConversationMode::Thinking
    } else if listening {
        ConversationMode::Listening
    } else {
        ConversationMode::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_idle_and_benevolent() {
        let signals = ConversationSignals::new();
        assert_eq!(signals.mode(), ConversationMode::Idle);
        assert_eq!(signals.active_persona(), Persona::Benevolent);
    }

    #[test]
    fn test_mode_priority() {
        let signals = ConversationSignals::new();
        signals.set_listening(true);
        assert_eq!(signals.mode(), ConversationMode::Listening);

        signals.set_thinking(true);
        assert_eq!(signals.mode(), ConversationMode::Thinking);

        signals.set_speaking(true);
        assert_eq!(signals.mode(), ConversationMode::Speaking);

        signals.set_speaking(false);
        signals.set_thinking(false);
        assert_eq!(signals.mode(), ConversationMode::Listening);
    }

    #[test]
    fn test_persona_round_trip_through_atomic() {
        let signals = ConversationSignals::new();
        signals.set_active_persona(Persona::Evil);
        assert_eq!(signals.active_persona(), Persona::Evil);
        signals.set_active_persona(Persona::Benevolent);
        assert_eq!(signals.active_persona(), Persona::Benevolent);
    }

    #[test]
    fn test_persona_parse_aliases() {
        assert_eq!("Evil".parse::<Persona>().unwrap(), Persona::Evil);
        assert_eq!("malevolent".parse::<Persona>().unwrap(), Persona::Evil);
        assert_eq!(" good ".parse::<Persona>().unwrap(), Persona::Benevolent);
        assert!("neutral".parse::<Persona>().is_err());
    }

    #[test]
    fn test_snapshot_serializes() {
        let signals = ConversationSignals::new();
        signals.set_thinking(true);
        signals.set_active_persona(Persona::Evil);

        let json = serde_json::to_value(signals.snapshot()).unwrap();
        assert_eq!(json["mode"], "thinking");
        assert_eq!(json["active_persona"], "evil");
        assert_eq!(json["is_thinking"], true);
    }
}
