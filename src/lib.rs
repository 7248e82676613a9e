//! Spooky Panel - LED panel shows synchronized with a two-persona voice
//!
//! This library provides the core of the panel daemon:
//! - A fixed-rate show engine rendering pluggable patterns onto a pixel grid
//! - A device transmitter mapping the grid onto the strip wiring and
//!   streaming it over serial with latest-wins backpressure
//! - A speech sequencer turning out-of-order TTS results into in-order playback
//! - Shared conversation signals that keep lights and voice in step
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Conversation layer / stdin              │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │ speak                   │ listening / thinking
//! ┌───────────▼───────────┐   ┌─────────▼───────────────┐
//! │   SpeechSequencer     │──▶│  ConversationSignals     │
//! │  TTS tasks │ playback │   │  mode │ persona          │
//! └───────────────────────┘   └─────────┬───────────────┘
//!                                       │ read per tick
//! ┌─────────────────────────────────────▼───────────────┐
//! │  ShowEngine  ──frame──▶  DeviceTransmitter ──▶ serial│
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod show;
pub mod speech;
pub mod state;

pub use config::Config;
pub use daemon::{Daemon, DaemonOptions};
pub use device::{ChannelOrder, DeviceTransmitter, FrameEncoder, Topology, TopologyKind};
pub use error::{Error, Result};
pub use show::{Frame, FrameObserver, PixelGrid, Rgb, ShowEngine, ShowRegistry};
pub use speech::{SpeechRequest, SpeechSequencer};
pub use state::{ConversationMode, ConversationSignals, Persona};
