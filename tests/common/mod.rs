//! Shared test utilities
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spooky_panel::device::ByteLink;
use spooky_panel::show::{Frame, FrameObserver};
use spooky_panel::speech::{AudioSink, SequencerEvent, SpeechRequest, SpeechService, Synthesized};
use spooky_panel::{ConversationSignals, Error, Persona, Result};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Speech service whose latency and failures are scripted per text
#[derive(Default)]
pub struct MockSpeech {
    delays: HashMap<String, Duration>,
    failures: Vec<String>,
    calls: AtomicUsize,
}

impl MockSpeech {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay synthesis of `text`
    #[must_use]
    pub fn delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    /// Make synthesis of `text` fail
    #[must_use]
    pub fn fail(mut self, text: &str) -> Self {
        self.failures.push(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechService for MockSpeech {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Synthesized> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&request.text) {
            tokio::time::sleep(*delay).await;
        }
        if self.failures.contains(&request.text) {
            return Err(Error::Synthesis(format!("scripted failure: {}", request.text)));
        }
        // Audio bytes are the text, so the sink can report what it played
        Ok(Synthesized::Remote(format!("mock://{}", request.text)))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        url.strip_prefix("mock://")
            .map(|text| text.as_bytes().to_vec())
            .ok_or_else(|| Error::Download(url.to_string()))
    }
}

/// What the sink saw when a clip started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Played {
    pub text: String,
    pub speaking: bool,
    pub persona: Persona,
}

/// Audio sink that records each clip instead of playing it
pub struct RecordingSink {
    played: Mutex<Vec<Played>>,
    signals: Arc<ConversationSignals>,
    duration: Duration,
}

impl RecordingSink {
    #[must_use]
    pub fn new(signals: Arc<ConversationSignals>) -> Self {
        Self {
            played: Mutex::new(Vec::new()),
            signals,
            duration: Duration::ZERO,
        }
    }

    /// Pretend each clip takes `duration` to play
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn played(&self) -> Vec<Played> {
        self.played.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.played().into_iter().map(|p| p.text).collect()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, audio: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.played.lock().unwrap().push(Played {
            text: String::from_utf8_lossy(audio).into_owned(),
            speaking: self.signals.is_speaking(),
            persona: self.signals.active_persona(),
        });
        tokio::select! {
            () = tokio::time::sleep(self.duration) => {}
            () = cancel.cancelled() => {}
        }
        Ok(())
    }
}

/// Wait until the clip with `sequence` is finished or skipped
///
/// Returns every event received along the way.
pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<SequencerEvent>,
    sequence: u64,
) -> Vec<SequencerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for sequencer event")
            .expect("sequencer event channel closed");
        let done = event.is_terminal() && event.sequence() == sequence;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Byte link that keeps every frame written to it
#[derive(Clone, Default)]
pub struct RecordingLink {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    write_delay: Duration,
}

impl RecordingLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make each write block for `delay`, like a slow serial line
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl ByteLink for RecordingLink {
    fn write_frame(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn address(&self) -> &str {
        "recording"
    }
}

/// Frame observer that keeps every frame it is handed
#[derive(Default)]
pub struct FrameLog {
    pub frames: Mutex<Vec<Arc<Frame>>>,
}

impl FrameLog {
    pub fn frames(&self) -> Vec<Arc<Frame>> {
        self.frames.lock().unwrap().clone()
    }
}

impl FrameObserver for FrameLog {
    fn on_frame(&self, frame: &Arc<Frame>) {
        self.frames.lock().unwrap().push(Arc::clone(frame));
    }
}
