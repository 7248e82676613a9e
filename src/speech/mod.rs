//! Speech synthesis and ordered playback

mod clip;
mod playback;
mod sequencer;
mod service;

pub use clip::{ClipPayload, PlayingClip, SequencerEvent, SpeechClip, SpeechRequest};
pub use playback::{AudioSink, CpalSink, NullSink, PLAYBACK_SAMPLE_RATE, decode_audio};
pub use sequencer::SpeechSequencer;
pub use service::{
    HttpSpeechConfig, HttpSpeechService, PersonaVoices, SpeechService, Synthesized, TtsProvider,
    fetch_audio,
};
