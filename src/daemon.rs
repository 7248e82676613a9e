//! Daemon - the main panel service
//!
//! Wires the show engine, device transmitter, and speech sequencer around one
//! set of conversation signals, then runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PanelConfig, ShowMap};
use crate::device::{DeviceTransmitter, FrameEncoder, available_ports};
use crate::show::{FrameObserver, ShowEngine, ShowRegistry};
use crate::speech::{
    AudioSink, CpalSink, HttpSpeechService, NullSink, SequencerEvent, SpeechRequest,
    SpeechSequencer,
};
use crate::state::{ConversationSignals, Persona};
use crate::{Error, Result};

/// How often the mode watcher samples the conversation signals
const MODE_POLL: Duration = Duration::from_millis(100);

/// Runtime switches from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    /// Render without opening a device
    pub headless: bool,
    /// Discard speech audio
    pub mute: bool,
    /// Read speak requests from stdin
    pub stdin: bool,
}

/// The panel daemon
pub struct Daemon {
    config: Config,
    options: DaemonOptions,
    signals: Arc<ConversationSignals>,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns `Config` if the config names a show that is not registered
    pub fn new(config: Config, options: DaemonOptions) -> Result<Self> {
        config.validate(&ShowRegistry::with_builtins())?;
        Ok(Self {
            config,
            options,
            signals: Arc::new(ConversationSignals::new()),
        })
    }

    /// Signals shared by every component
    #[must_use]
    pub fn signals(&self) -> Arc<ConversationSignals> {
        Arc::clone(&self.signals)
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if startup fails or a component does not shut down in time
    pub async fn run(self) -> Result<()> {
        let engine = Arc::new(ShowEngine::new(
            ShowRegistry::with_builtins(),
            Arc::clone(&self.signals),
            self.config.engine_config(),
        )?);

        let transmitter = if self.options.headless {
            tracing::info!("headless mode, no device opened");
            None
        } else {
            open_transmitter(&self.config.panel)
        };
        if let Some(tx) = &transmitter {
            let observer: Arc<dyn FrameObserver> = Arc::clone(tx) as Arc<dyn FrameObserver>;
            engine.register_frame_callback(&observer);
        }

        engine.start(&self.config.panel.initial_show)?;

        let sequencer = self.start_sequencer()?;

        let cancel = CancellationToken::new();
        let watcher = spawn_mode_watcher(
            Arc::clone(&engine),
            Arc::clone(&self.signals),
            self.config.shows.clone(),
            cancel.clone(),
        );

        let event_log = sequencer
            .as_ref()
            .map(|seq| spawn_event_log(seq.subscribe(), cancel.clone()));

        let reader = self.options.stdin.then(|| {
            spawn_stdin_reader(
                Arc::clone(&engine),
                sequencer.clone(),
                Arc::clone(&self.signals),
                cancel.clone(),
            )
        });

        tracing::info!(
            width = self.config.panel.width,
            height = self.config.panel.height,
            fps = self.config.panel.fps,
            device = transmitter.as_ref().map_or("none", |tx| tx.address()),
            speech = sequencer.is_some(),
            "spooky panel running"
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown requested");

        cancel.cancel();
        let _ = watcher.await;
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(event_log) = event_log {
            let _ = event_log.await;
        }

        shutdown(sequencer.as_deref(), &engine, transmitter).await
    }

    fn start_sequencer(&self) -> Result<Option<Arc<SpeechSequencer>>> {
        let service = match self.config.http_speech_config() {
            Ok(cfg) => HttpSpeechService::new(cfg)?,
            Err(e) => {
                tracing::warn!(error = %e, "speech disabled");
                return Ok(None);
            }
        };

        let sink = audio_sink(self.options.mute || self.config.speech.mute);
        let sequencer = SpeechSequencer::start(Arc::new(service), sink, Arc::clone(&self.signals))?;
        Ok(Some(Arc::new(sequencer)))
    }
}

/// Stop components in dependency order: audio, rendering, then the device
///
/// Every component is stopped even if an earlier one fails; the first
/// failure is returned.
///
/// # Errors
///
/// Returns the first `ShutdownTimeout`
pub async fn shutdown(
    sequencer: Option<&SpeechSequencer>,
    engine: &ShowEngine,
    transmitter: Option<Arc<DeviceTransmitter>>,
) -> Result<()> {
    let mut first_error = None;

    if let Some(sequencer) = sequencer {
        if let Err(e) = sequencer.stop().await {
            tracing::error!(error = %e, "speech sequencer shutdown failed");
            first_error.get_or_insert(e);
        }
    }

    if let Err(e) = engine.stop().await {
        tracing::error!(error = %e, "show engine shutdown failed");
        first_error.get_or_insert(e);
    }

    if let Some(tx) = transmitter {
        let stopped = tokio::task::spawn_blocking(move || tx.stop())
            .await
            .map_err(|e| Error::Config(format!("transmitter stop task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = stopped {
            tracing::error!(error = %e, "transmitter shutdown failed");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

/// Open the configured device, or the first serial port found
///
/// Returns `None` when no device can be opened; the panel then runs headless.
#[must_use]
pub fn open_transmitter(panel: &PanelConfig) -> Option<Arc<DeviceTransmitter>> {
    let encoder = match FrameEncoder::new(
        panel.topology.build(),
        panel.channel_order,
        panel.width,
        panel.height,
    ) {
        Ok(encoder) => encoder.with_brightness(panel.brightness),
        Err(e) => {
            tracing::error!(error = %e, "invalid panel wiring");
            return None;
        }
    };

    let Some(address) = panel
        .device
        .clone()
        .or_else(|| available_ports().into_iter().next())
    else {
        tracing::warn!("no serial device found, running headless");
        return None;
    };

    match DeviceTransmitter::open(&address, panel.baud, encoder) {
        Ok(tx) => Some(Arc::new(tx)),
        Err(e) => {
            tracing::warn!(error = %e, "running headless");
            None
        }
    }
}

/// Pick the audio output, falling back to silence without a device
#[must_use]
pub fn audio_sink(mute: bool) -> Arc<dyn AudioSink> {
    if mute {
        tracing::info!("speech muted");
        return Arc::new(NullSink);
    }
    match CpalSink::new() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::warn!(error = %e, "no audio output, speech will be silent");
            Arc::new(NullSink)
        }
    }
}

/// Keep the active show in step with the conversation mode and persona
///
/// Only a change in mode or persona triggers a switch, so a show switched by
/// hand stays up until the conversation moves on.
pub fn spawn_mode_watcher(
    engine: Arc<ShowEngine>,
    signals: Arc<ConversationSignals>,
    shows: ShowMap,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MODE_POLL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let current = (signals.mode(), signals.active_persona());
            if last == Some(current) {
                continue;
            }
            last = Some(current);

            tracing::debug!(signals = ?signals.snapshot(), "conversation state changed");
            let (mode, persona) = current;
            let show = shows.show_for(mode, persona);
            match engine.switch_show(show) {
                Ok(true) => tracing::info!(%mode, %persona, show, "mode changed"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, show, "mode show rejected"),
            }
        }
    })
}

/// Log sequencer events as JSON at debug level
fn spawn_event_log(
    mut events: broadcast::Receiver<SequencerEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::debug!(event = %json, "speech event"),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize speech event"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "speech event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// A line read from stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Speak(SpeechRequest),
    Listening,
    Thinking,
    Idle,
    Persona(Persona),
    /// Put a show up by name
    Show(String),
}

/// Parse a console line
///
/// `evil: text` and `good: text` pick the persona; bare text is spoken
/// benevolently. `/listen`, `/think`, `/idle`, `/evil` and `/good` drive the
/// signals directly, and `/show <name>` switches the panel by hand.
#[must_use]
pub fn parse_console_line(line: &str) -> Option<ConsoleLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(command) = line.strip_prefix('/') {
        let command = command.trim();
        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));
        return match name {
            "show" if argument.is_empty() => None,
            "show" => Some(ConsoleLine::Show(argument.to_string())),
            _ if !argument.is_empty() => None,
            "listen" => Some(ConsoleLine::Listening),
            "think" => Some(ConsoleLine::Thinking),
            "idle" => Some(ConsoleLine::Idle),
            other => other.parse().ok().map(ConsoleLine::Persona),
        };
    }

    let (persona, text) = match line.split_once(':') {
        Some((prefix, rest)) => match prefix.parse::<Persona>() {
            Ok(persona) => (persona, rest.trim()),
            Err(_) => (Persona::Benevolent, line),
        },
        None => (Persona::Benevolent, line),
    };

    (!text.is_empty()).then(|| ConsoleLine::Speak(SpeechRequest::new(text, persona)))
}

/// Carry out one console command
///
/// # Errors
///
/// Returns `UnknownShow` for `/show` with an unregistered name, `Stopped`
/// when speech is unavailable or shut down
pub fn apply_console_line(
    line: ConsoleLine,
    engine: &ShowEngine,
    sequencer: Option<&SpeechSequencer>,
    signals: &ConversationSignals,
) -> Result<()> {
    match line {
        ConsoleLine::Speak(request) => {
            signals.set_listening(false);
            signals.set_thinking(false);
            let sequencer = sequencer.ok_or(Error::Stopped("speech"))?;
            sequencer.speak_with(request)?;
        }
        ConsoleLine::Listening => {
            signals.set_thinking(false);
            signals.set_listening(true);
        }
        ConsoleLine::Thinking => {
            signals.set_listening(false);
            signals.set_thinking(true);
        }
        ConsoleLine::Idle => {
            signals.set_listening(false);
            signals.set_thinking(false);
        }
        ConsoleLine::Persona(persona) => signals.set_active_persona(persona),
        ConsoleLine::Show(name) => {
            if engine.switch_show(&name)? {
                tracing::info!(show = %name, "show switched from console");
            }
        }
    }
    Ok(())
}

fn spawn_stdin_reader(
    engine: Arc<ShowEngine>,
    sequencer: Option<Arc<SpeechSequencer>>,
    signals: Arc<ConversationSignals>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let registry = ShowRegistry::with_builtins();
        let known = registry.names().collect::<Vec<_>>().join(", ");
        tracing::info!(speech = sequencer.is_some(), "reading commands from stdin");

        loop {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            };

            let Some(command) = parse_console_line(&line) else {
                tracing::debug!(line = %line.trim(), "console line ignored");
                continue;
            };
            match apply_console_line(command, &engine, sequencer.as_deref(), &signals) {
                Ok(()) => {}
                Err(e @ Error::UnknownShow(_)) => {
                    tracing::warn!(error = %e, known = %known, "show not switched");
                }
                Err(e) => tracing::warn!(error = %e, "console command rejected"),
            }
        }
    })
}

/// Speak one utterance and wait for it to finish
///
/// # Errors
///
/// Returns error if speech is not configured, synthesis fails, or playback
/// cannot be shut down
pub async fn speak_once(config: &Config, request: SpeechRequest, mute: bool) -> Result<()> {
    let service = HttpSpeechService::new(config.http_speech_config()?)?;
    let sink = audio_sink(mute || config.speech.mute);
    let sequencer = SpeechSequencer::start(
        Arc::new(service),
        sink,
        Arc::new(ConversationSignals::new()),
    )?;

    let mut events = sequencer.subscribe();
    let sequence = sequencer.speak_with(request)?;

    let outcome = loop {
        match events.recv().await {
            Ok(SequencerEvent::Finished { sequence: s }) if s == sequence => break Ok(()),
            Ok(SequencerEvent::Skipped { sequence: s, reason }) if s == sequence => {
                break Err(Error::Synthesis(reason));
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break Err(Error::Stopped("speech sequencer")),
        }
    };

    sequencer.stop().await?;
    outcome
}

/// Render one show to the panel for a fixed time
///
/// # Errors
///
/// Returns error if the show is unknown or a component fails to stop
pub async fn run_test_panel(
    config: &Config,
    show: &str,
    duration: Duration,
    headless: bool,
) -> Result<()> {
    let engine = ShowEngine::new(
        ShowRegistry::with_builtins(),
        Arc::new(ConversationSignals::new()),
        config.engine_config(),
    )?;

    let transmitter = if headless {
        None
    } else {
        open_transmitter(&config.panel)
    };
    if let Some(tx) = &transmitter {
        let observer: Arc<dyn FrameObserver> = Arc::clone(tx) as Arc<dyn FrameObserver>;
        engine.register_frame_callback(&observer);
    }

    engine.start(show)?;
    tracing::info!(show, seconds = duration.as_secs(), "test pattern running");

    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    if let Some(tx) = &transmitter {
        tracing::info!(
            sent = tx.frames_sent(),
            dropped = tx.frames_dropped(),
            write_errors = tx.write_errors(),
            "link statistics"
        );
    }
    shutdown(None, &engine, transmitter).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_line_is_benevolent_speech() {
        let parsed = parse_console_line("  hello there  ").unwrap();
        assert_eq!(
            parsed,
            ConsoleLine::Speak(SpeechRequest::new("hello there", Persona::Benevolent))
        );
    }

    #[test]
    fn test_persona_prefix() {
        let parsed = parse_console_line("evil: you will never leave").unwrap();
        assert_eq!(
            parsed,
            ConsoleLine::Speak(SpeechRequest::new("you will never leave", Persona::Evil))
        );
        let parsed = parse_console_line("good:welcome").unwrap();
        assert_eq!(
            parsed,
            ConsoleLine::Speak(SpeechRequest::new("welcome", Persona::Benevolent))
        );
    }

    #[test]
    fn test_unknown_prefix_is_part_of_text() {
        let parsed = parse_console_line("note: bring candy").unwrap();
        assert_eq!(
            parsed,
            ConsoleLine::Speak(SpeechRequest::new("note: bring candy", Persona::Benevolent))
        );
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse_console_line("/listen"), Some(ConsoleLine::Listening));
        assert_eq!(parse_console_line("/think"), Some(ConsoleLine::Thinking));
        assert_eq!(parse_console_line("/idle"), Some(ConsoleLine::Idle));
        assert_eq!(
            parse_console_line("/evil"),
            Some(ConsoleLine::Persona(Persona::Evil))
        );
        assert_eq!(parse_console_line("/dance"), None);
    }

    #[test]
    fn test_show_command() {
        assert_eq!(
            parse_console_line("/show rainbow"),
            Some(ConsoleLine::Show("rainbow".to_string()))
        );
        assert_eq!(
            parse_console_line("  /show   two-axis "),
            Some(ConsoleLine::Show("two-axis".to_string()))
        );
        assert_eq!(parse_console_line("/show"), None);
        assert_eq!(parse_console_line("/show   "), None);
        assert_eq!(parse_console_line("/think hard"), None);
    }

    fn console_engine() -> ShowEngine {
        ShowEngine::new(
            ShowRegistry::with_builtins(),
            Arc::new(ConversationSignals::new()),
            crate::show::EngineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_console_show_switches_and_reports_unknown() {
        let engine = console_engine();
        let signals = ConversationSignals::new();
        engine.start("breathe").unwrap();

        apply_console_line(
            ConsoleLine::Show("rainbow".to_string()),
            &engine,
            None,
            &signals,
        )
        .unwrap();

        let err = apply_console_line(
            ConsoleLine::Show("fireworks".to_string()),
            &engine,
            None,
            &signals,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownShow(ref name) if name == "fireworks"));

        engine.stop().await.unwrap();
    }

    #[test]
    fn test_console_speak_without_speech_is_rejected() {
        let engine = console_engine();
        let signals = ConversationSignals::new();
        signals.set_thinking(true);

        let line = parse_console_line("evil: boo").unwrap();
        let err = apply_console_line(line, &engine, None, &signals).unwrap_err();
        assert!(matches!(err, Error::Stopped(_)));
        assert!(!signals.is_thinking());
    }

    #[test]
    fn test_blank_lines_ignored() {
        assert_eq!(parse_console_line("   "), None);
        assert_eq!(parse_console_line("evil:   "), None);
    }
}
