//! Ordered playback of concurrently synthesized speech
//!
//! Every `speak` call takes the next sequence number and spawns its own
//! synthesis task, so requests finish in whatever order the provider returns
//! them. Finished clips are deposited with a single playback worker that keeps
//! them in a timeline keyed by sequence and only ever plays the clip at the
//! cursor. A failed clip still occupies its slot and is skipped, so one bad
//! request never stalls the clips behind it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clip::{ClipPayload, PlayingClip, SequencerEvent, SpeechClip, SpeechRequest};
use super::playback::AudioSink;
use super::service::{SpeechService, fetch_audio};
use crate::state::{ConversationSignals, Persona};
use crate::{Error, Result};

/// How long `stop` waits for the playback worker to exit
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Buffered events per subscriber before slow receivers start lagging
const EVENT_CAPACITY: usize = 64;

struct Dispatch {
    next: u64,
    open: bool,
}

#[derive(Default)]
struct Progress {
    cursor: AtomicU64,
    pending: AtomicUsize,
}

/// Turns out-of-order synthesis results into in-order playback
pub struct SpeechSequencer {
    service: Arc<dyn SpeechService>,
    runtime: Handle,
    dispatch: Mutex<Dispatch>,
    deposits: mpsc::UnboundedSender<SpeechClip>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled once the playback worker has exited
    exited: CancellationToken,
    progress: Arc<Progress>,
    playing: watch::Receiver<Option<PlayingClip>>,
    events: broadcast::Sender<SequencerEvent>,
}

impl SpeechSequencer {
    /// Start the playback worker
    ///
    /// # Errors
    ///
    /// Returns `Config` when called outside a tokio runtime
    pub fn start(
        service: Arc<dyn SpeechService>,
        sink: Arc<dyn AudioSink>,
        signals: Arc<ConversationSignals>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("speech sequencer needs a tokio runtime: {e}")))?;

        let (deposits, deposit_rx) = mpsc::unbounded_channel();
        let (playing_tx, playing) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let progress = Arc::new(Progress::default());

        let worker = PlaybackWorker {
            deposits: deposit_rx,
            timeline: BTreeMap::new(),
            cursor: 0,
            sink,
            signals,
            playing: playing_tx,
            events: events.clone(),
            cancel: cancel.clone(),
            progress: Arc::clone(&progress),
        };
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();
        let handle = runtime.spawn(async move {
            let _exited = exit_guard;
            worker.run().await;
        });

        tracing::debug!("speech sequencer started");

        Ok(Self {
            service,
            runtime,
            dispatch: Mutex::new(Dispatch { next: 0, open: true }),
            deposits,
            cancel,
            worker: Mutex::new(Some(handle)),
            exited,
            progress,
            playing,
            events,
        })
    }

    /// Queue `text` for synthesis and ordered playback
    ///
    /// Returns the clip's sequence number without waiting for synthesis.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after [`Self::stop`]
    pub fn speak(&self, text: impl Into<String>, persona: Persona) -> Result<u64> {
        self.speak_with(SpeechRequest::new(text, persona))
    }

    /// Like [`Self::speak`], with an emotion hint
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after [`Self::stop`]
    pub fn speak_with(&self, request: SpeechRequest) -> Result<u64> {
        let sequence = {
            let mut dispatch = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            if !dispatch.open {
                return Err(Error::Stopped("speech sequencer"));
            }
            let sequence = dispatch.next;
            dispatch.next += 1;
            sequence
        };

        tracing::debug!(
            sequence,
            persona = %request.persona,
            chars = request.text.len(),
            "speech requested"
        );

        let service = Arc::clone(&self.service);
        let deposits = self.deposits.clone();
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                outcome = fetch_audio(service.as_ref(), &request) => outcome,
            };

            let mut clip = SpeechClip::new(sequence, request);
            clip.payload = match outcome {
                Ok(audio) => ClipPayload::Ready(audio),
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "speech synthesis failed");
                    ClipPayload::Failed(e.to_string())
                }
            };

            if deposits.send(clip).is_err() {
                tracing::debug!(sequence, "playback worker gone, clip dropped");
            }
        });

        Ok(sequence)
    }

    /// Clip currently producing audio
    #[must_use]
    pub fn playing_clip(&self) -> Option<PlayingClip> {
        self.playing.borrow().clone()
    }

    /// Watch the playing clip change
    #[must_use]
    pub fn watch_playing(&self) -> watch::Receiver<Option<PlayingClip>> {
        self.playing.clone()
    }

    /// Subscribe to playback events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    /// Sequence number the next `speak` will receive
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.dispatch.lock().unwrap_or_else(|e| e.into_inner()).next
    }

    /// Next sequence eligible to play
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.progress.cursor.load(Ordering::Acquire)
    }

    /// Resolved clips waiting for an earlier sequence
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.progress.pending.load(Ordering::Acquire)
    }

    /// Refuse new requests, cut off playback, and join the worker
    ///
    /// Synthesis still in flight is abandoned. A second call returns once the
    /// worker has exited.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the worker does not exit in time, or
    /// `WorkerFailed` if it panicked
    pub async fn stop(&self) -> Result<()> {
        self.dispatch.lock().unwrap_or_else(|e| e.into_inner()).open = false;
        self.cancel.cancel();

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(worker) = worker else {
            return tokio::time::timeout(STOP_GRACE, self.exited.cancelled())
                .await
                .map_err(|_| Error::ShutdownTimeout {
                    component: "speech sequencer",
                    grace: STOP_GRACE,
                });
        };

        match tokio::time::timeout(STOP_GRACE, worker).await {
            Ok(Ok(())) => {
                tracing::info!(cursor = self.cursor(), "speech sequencer stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "playback worker failed");
                Err(Error::WorkerFailed {
                    component: "speech sequencer",
                    reason: e.to_string(),
                })
            }
            Err(_) => Err(Error::ShutdownTimeout {
                component: "speech sequencer",
                grace: STOP_GRACE,
            }),
        }
    }
}

impl Drop for SpeechSequencer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PlaybackWorker {
    deposits: mpsc::UnboundedReceiver<SpeechClip>,
    timeline: BTreeMap<u64, SpeechClip>,
    cursor: u64,
    sink: Arc<dyn AudioSink>,
    signals: Arc<ConversationSignals>,
    playing: watch::Sender<Option<PlayingClip>>,
    events: broadcast::Sender<SequencerEvent>,
    cancel: CancellationToken,
    progress: Arc<Progress>,
}

impl PlaybackWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                deposit = self.deposits.recv() => {
                    let Some(clip) = deposit else { break };
                    self.accept(clip);
                    self.drain().await;
                }
            }
        }

        self.playing.send_replace(None);
        self.signals.set_speaking(false);
        tracing::debug!(
            cursor = self.cursor,
            abandoned = self.timeline.len(),
            "playback worker exited"
        );
    }

    fn accept(&mut self, clip: SpeechClip) {
        if clip.sequence < self.cursor {
            tracing::debug!(sequence = clip.sequence, cursor = self.cursor, "stale clip dropped");
            return;
        }
        self.timeline.insert(clip.sequence, clip);
        self.progress.pending.store(self.timeline.len(), Ordering::Release);
    }

    /// Play every clip from the cursor until the first gap
    ///
    /// Clips that resolve while an earlier one plays join the same run, so
    /// speaking stays set across back-to-back clips.
    async fn drain(&mut self) {
        let mut spoke = false;

        while !self.cancel.is_cancelled() {
            while let Ok(clip) = self.deposits.try_recv() {
                self.accept(clip);
            }
            let Some(clip) = self.timeline.remove(&self.cursor) else {
                break;
            };
            self.progress.pending.store(self.timeline.len(), Ordering::Release);

            let sequence = clip.sequence;
            let event = match clip.payload {
                ClipPayload::Ready(ref audio) => {
                    spoke = true;
                    self.play(&clip, audio).await;
                    SequencerEvent::Finished { sequence }
                }
                ClipPayload::Failed(reason) => {
                    tracing::warn!(sequence, reason = %reason, "skipping failed clip");
                    SequencerEvent::Skipped { sequence, reason }
                }
                ClipPayload::Pending => SequencerEvent::Skipped {
                    sequence,
                    reason: "unresolved".to_string(),
                },
            };

            self.cursor += 1;
            self.progress.cursor.store(self.cursor, Ordering::Release);
            let _ = self.events.send(event);
        }

        if spoke {
            self.signals.set_speaking(false);
        }
    }

    async fn play(&self, clip: &SpeechClip, audio: &[u8]) {
        let now_playing = PlayingClip::from_clip(clip);

        self.signals.set_active_persona(clip.persona);
        self.signals.set_speaking(true);
        self.playing.send_replace(Some(now_playing.clone()));
        let _ = self.events.send(SequencerEvent::Started { clip: now_playing });

        tracing::info!(
            sequence = clip.sequence,
            persona = %clip.persona,
            emotion = clip.emotion.as_deref().unwrap_or("-"),
            "playing clip"
        );

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::debug!(sequence = clip.sequence, "playback cut off");
            }
            result = self.sink.play(audio, &self.cancel) => {
                if let Err(e) = result {
                    tracing::warn!(sequence = clip.sequence, error = %e, "playback failed");
                }
            }
        }

        self.playing.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::speech::{NullSink, Synthesized};

    struct Echo;

    #[async_trait]
    impl SpeechService for Echo {
        async fn synthesize(&self, request: &SpeechRequest) -> Result<Synthesized> {
            Ok(Synthesized::Audio(request.text.as_bytes().to_vec()))
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>> {
            Err(Error::Download(url.to_string()))
        }
    }

    fn sequencer() -> SpeechSequencer {
        SpeechSequencer::start(
            Arc::new(Echo),
            Arc::new(NullSink),
            Arc::new(ConversationSignals::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = SpeechSequencer::start(
            Arc::new(Echo),
            Arc::new(NullSink),
            Arc::new(ConversationSignals::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_sequences_are_assigned_in_call_order() {
        let seq = sequencer();
        assert_eq!(seq.speak("a", Persona::Benevolent).unwrap(), 0);
        assert_eq!(seq.speak("b", Persona::Evil).unwrap(), 1);
        assert_eq!(seq.next_sequence(), 2);
        seq.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_speak_after_stop_consumes_nothing() {
        let seq = sequencer();
        seq.stop().await.unwrap();
        assert!(matches!(
            seq.speak("late", Persona::Evil),
            Err(Error::Stopped(_))
        ));
        assert_eq!(seq.next_sequence(), 0);
        seq.stop().await.unwrap();
    }

    /// Deposits the next clip while the first one is still playing
    struct HandOffSink {
        signals: Arc<ConversationSignals>,
        hand_off: Mutex<Option<(mpsc::UnboundedSender<SpeechClip>, SpeechClip)>>,
        speaking_at_start: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl AudioSink for HandOffSink {
        async fn play(&self, _audio: &[u8], _cancel: &CancellationToken) -> Result<()> {
            self.speaking_at_start
                .lock()
                .unwrap()
                .push(self.signals.is_speaking());
            if let Some((deposits, clip)) = self.hand_off.lock().unwrap().take() {
                deposits.send(clip).unwrap();
            }
            Ok(())
        }
    }

    fn ready_clip(sequence: u64, text: &str) -> SpeechClip {
        let mut clip = SpeechClip::new(sequence, SpeechRequest::new(text, Persona::Evil));
        clip.payload = ClipPayload::Ready(text.as_bytes().to_vec());
        clip
    }

    #[tokio::test]
    async fn test_clip_resolved_during_playback_joins_the_same_run() {
        let signals = Arc::new(ConversationSignals::new());
        let (deposits, deposit_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(HandOffSink {
            signals: Arc::clone(&signals),
            hand_off: Mutex::new(Some((deposits, ready_clip(1, "second")))),
            speaking_at_start: Mutex::new(Vec::new()),
        });
        let (playing, _) = watch::channel(None);
        let (events, mut event_rx) = broadcast::channel(EVENT_CAPACITY);

        let mut worker = PlaybackWorker {
            deposits: deposit_rx,
            timeline: BTreeMap::new(),
            cursor: 0,
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
            signals: Arc::clone(&signals),
            playing,
            events,
            cancel: CancellationToken::new(),
            progress: Arc::new(Progress::default()),
        };

        worker.accept(ready_clip(0, "first"));
        worker.drain().await;

        // One pass played both clips without clearing speaking in between
        assert_eq!(worker.cursor, 2);
        assert_eq!(*sink.speaking_at_start.lock().unwrap(), vec![true, true]);
        assert!(!signals.is_speaking());

        let mut order = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            order.push(match event {
                SequencerEvent::Started { clip } => format!("started {}", clip.sequence),
                SequencerEvent::Finished { sequence } => format!("finished {sequence}"),
                SequencerEvent::Skipped { sequence, .. } => format!("skipped {sequence}"),
            });
        }
        assert_eq!(order, ["started 0", "finished 0", "started 1", "finished 1"]);
    }

    #[tokio::test]
    async fn test_single_clip_plays_and_clears_speaking() {
        let signals = Arc::new(ConversationSignals::new());
        let seq = SpeechSequencer::start(Arc::new(Echo), Arc::new(NullSink), Arc::clone(&signals))
            .unwrap();
        let mut events = seq.subscribe();

        seq.speak("boo", Persona::Evil).unwrap();

        let started = events.recv().await.unwrap();
        assert!(matches!(started, SequencerEvent::Started { ref clip } if clip.persona == Persona::Evil));
        let finished = events.recv().await.unwrap();
        assert_eq!(finished, SequencerEvent::Finished { sequence: 0 });

        assert_eq!(seq.cursor(), 1);
        assert_eq!(signals.active_persona(), Persona::Evil);
        seq.stop().await.unwrap();
        assert!(!signals.is_speaking());
        assert!(seq.playing_clip().is_none());
    }
}
