//! Configuration management for the panel daemon

pub mod file;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use self::file::{ModeShowsFile, PanelConfigFile};
use crate::device::{ChannelOrder, DEFAULT_BAUD, TopologyKind};
use crate::show::{EngineConfig, MAX_FPS, ShowRegistry};
use crate::speech::{HttpSpeechConfig, PersonaVoices, TtsProvider};
use crate::state::{ConversationMode, Persona};
use crate::{Error, Result};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub panel: PanelConfig,
    pub speech: SpeechConfig,
    pub shows: ShowMap,
}

/// Panel geometry, wiring, and link settings
#[derive(Debug, Clone)]
pub struct PanelConfig {
    pub width: usize,
    pub height: usize,
    pub fps: u32,

    /// Serial device; `None` picks the first port found
    pub device: Option<String>,
    pub baud: u32,
    pub topology: TopologyKind,
    pub channel_order: ChannelOrder,
    pub brightness: u8,
    pub initial_show: String,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub provider: TtsProvider,

    /// Key for the selected provider (from `OPENAI_API_KEY` or
    /// `ELEVENLABS_API_KEY`)
    pub api_key: Option<String>,
    pub model: String,
    pub voices: PersonaVoices,

    /// TTS speed multiplier (0.25 to 4.0)
    pub speed: f32,
    pub timeout: Duration,
    pub mute: bool,
}

/// Show names per conversation mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeShows {
    pub idle: String,
    pub listening: String,
    pub thinking: String,
    pub speaking: String,
}

impl ModeShows {
    #[must_use]
    pub fn get(&self, mode: ConversationMode) -> &str {
        match mode {
            ConversationMode::Idle => &self.idle,
            ConversationMode::Listening => &self.listening,
            ConversationMode::Thinking => &self.thinking,
            ConversationMode::Speaking => &self.speaking,
        }
    }

    fn names(&self) -> [&str; 4] {
        [&self.idle, &self.listening, &self.thinking, &self.speaking]
    }

    fn overlay(&self, file: ModeShowsFile) -> Self {
        Self {
            idle: file.idle.unwrap_or_else(|| self.idle.clone()),
            listening: file.listening.unwrap_or_else(|| self.listening.clone()),
            thinking: file.thinking.unwrap_or_else(|| self.thinking.clone()),
            speaking: file.speaking.unwrap_or_else(|| self.speaking.clone()),
        }
    }
}

/// Which show to run for each mode and persona
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowMap {
    pub benevolent: ModeShows,
    pub evil: ModeShows,
}

impl ShowMap {
    #[must_use]
    pub fn show_for(&self, mode: ConversationMode, persona: Persona) -> &str {
        match persona {
            Persona::Benevolent => self.benevolent.get(mode),
            Persona::Evil => self.evil.get(mode),
        }
    }
}

impl Default for ShowMap {
    fn default() -> Self {
        Self {
            benevolent: ModeShows {
                idle: "breathe".to_string(),
                listening: "listen".to_string(),
                thinking: "think".to_string(),
                speaking: "speak".to_string(),
            },
            evil: ModeShows {
                idle: "ember".to_string(),
                listening: "listen".to_string(),
                thinking: "think".to_string(),
                speaking: "speak".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the config file or an environment value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with values from `env`
    ///
    /// # Errors
    ///
    /// Returns `Config` if a value cannot be parsed
    pub fn from_sources(
        fc: PanelConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = EngineConfig::default();

        let panel = PanelConfig {
            width: env_parse(&env, "SPOOKY_WIDTH")?
                .or(fc.panel.width)
                .unwrap_or(defaults.width),
            height: env_parse(&env, "SPOOKY_HEIGHT")?
                .or(fc.panel.height)
                .unwrap_or(defaults.height),
            fps: env_parse(&env, "SPOOKY_FPS")?
                .or(fc.panel.fps)
                .unwrap_or(defaults.fps),
            device: env("SPOOKY_DEVICE").or(fc.panel.device),
            baud: env_parse(&env, "SPOOKY_BAUD")?
                .or(fc.panel.baud)
                .unwrap_or(DEFAULT_BAUD),
            topology: pick(&env, "SPOOKY_TOPOLOGY", fc.panel.topology)?.unwrap_or_default(),
            channel_order: pick(&env, "SPOOKY_CHANNEL_ORDER", fc.panel.channel_order)?
                .unwrap_or_default(),
            brightness: env_parse(&env, "SPOOKY_BRIGHTNESS")?
                .or(fc.panel.brightness)
                .unwrap_or(u8::MAX),
            initial_show: env("SPOOKY_INITIAL_SHOW")
                .or(fc.panel.initial_show)
                .unwrap_or_else(|| "breathe".to_string()),
        };

        let provider: TtsProvider =
            pick(&env, "SPOOKY_TTS_PROVIDER", fc.speech.provider)?.unwrap_or(TtsProvider::OpenAI);

        let (api_key, default_model, default_voices) = match provider {
            TtsProvider::OpenAI => (
                env("OPENAI_API_KEY").or(fc.api_keys.openai),
                "gpt-4o-mini-tts",
                ("nova", "onyx"),
            ),
            TtsProvider::ElevenLabs => (
                env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
                "eleven_multilingual_v2",
                ("21m00Tcm4TlvDq8ikWAM", "pNInz6obpgDQGcFmaJgB"),
            ),
        };

        let speech = SpeechConfig {
            provider,
            api_key: api_key.filter(|k| !k.is_empty()),
            model: env("SPOOKY_TTS_MODEL")
                .or(fc.speech.model)
                .unwrap_or_else(|| default_model.to_string()),
            voices: PersonaVoices {
                benevolent: env("SPOOKY_VOICE_BENEVOLENT")
                    .or(fc.speech.voice_benevolent)
                    .unwrap_or_else(|| default_voices.0.to_string()),
                evil: env("SPOOKY_VOICE_EVIL")
                    .or(fc.speech.voice_evil)
                    .unwrap_or_else(|| default_voices.1.to_string()),
            },
            speed: env_parse(&env, "SPOOKY_TTS_SPEED")?
                .or(fc.speech.speed)
                .unwrap_or(1.0),
            timeout: Duration::from_secs(
                env_parse(&env, "SPOOKY_TTS_TIMEOUT")?
                    .or(fc.speech.timeout_secs)
                    .unwrap_or(30),
            ),
            mute: env("SPOOKY_MUTE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.speech.mute)
                .unwrap_or(false),
        };

        let base = ShowMap::default();
        let benevolent = base.benevolent.overlay(fc.shows.benevolent);
        let evil = match fc.shows.evil {
            Some(evil) => base.evil.overlay(evil),
            None => base.evil,
        };

        let config = Self {
            panel,
            speech,
            shows: ShowMap { benevolent, evil },
        };
        config.check_ranges()?;
        Ok(config)
    }

    fn check_ranges(&self) -> Result<()> {
        if self.panel.width == 0 || self.panel.height == 0 {
            return Err(Error::Config(format!(
                "panel size must be non-zero, got {}x{}",
                self.panel.width, self.panel.height
            )));
        }
        if !(1..=MAX_FPS).contains(&self.panel.fps) {
            return Err(Error::Config(format!(
                "fps must be between 1 and {MAX_FPS}, got {}",
                self.panel.fps
            )));
        }
        if !(0.25..=4.0).contains(&self.speech.speed) {
            return Err(Error::Config(format!(
                "TTS speed must be between 0.25 and 4.0, got {}",
                self.speech.speed
            )));
        }
        Ok(())
    }

    /// Check that every show name refers to a registered show
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the first unknown show
    pub fn validate(&self, registry: &ShowRegistry) -> Result<()> {
        let names = std::iter::once(self.panel.initial_show.as_str())
            .chain(self.shows.benevolent.names())
            .chain(self.shows.evil.names());

        for name in names {
            if !registry.contains(name) {
                return Err(Error::Config(format!("unknown show in config: {name}")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            width: self.panel.width,
            height: self.panel.height,
            fps: self.panel.fps,
        }
    }

    /// Settings for the HTTP speech service
    ///
    /// # Errors
    ///
    /// Returns `Config` if no API key is set for the provider
    pub fn http_speech_config(&self) -> Result<HttpSpeechConfig> {
        let api_key = self.speech.api_key.clone().ok_or_else(|| {
            Error::Config(format!(
                "no API key for {:?}; set OPENAI_API_KEY or ELEVENLABS_API_KEY",
                self.speech.provider
            ))
        })?;

        Ok(HttpSpeechConfig {
            provider: self.speech.provider,
            api_key,
            model: self.speech.model.clone(),
            voices: self.speech.voices.clone(),
            speed: self.speech.speed,
            timeout: self.speech.timeout,
        })
    }
}

/// Parse an environment value, naming the variable on failure
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

/// Environment value if set, else the file value, parsed with `FromStr`
fn pick<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file_value: Option<String>,
) -> Result<Option<T>>
where
    T: FromStr<Err = Error>,
{
    env(key).or(file_value).map(|raw| raw.parse()).transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(PanelConfigFile::default(), no_env).unwrap();
        assert_eq!(config.panel.width, 20);
        assert_eq!(config.panel.height, 10);
        assert_eq!(config.panel.fps, 30);
        assert_eq!(config.panel.baud, 230_400);
        assert_eq!(config.panel.channel_order, ChannelOrder::Grb);
        assert_eq!(config.panel.topology, TopologyKind::RowMajor);
        assert_eq!(config.speech.provider, TtsProvider::OpenAI);
        assert!(config.speech.api_key.is_none());
        assert!(!config.speech.mute);
        assert_eq!(config.shows, ShowMap::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: PanelConfigFile = toml::from_str(
            r#"
            [panel]
            width = 8
            fps = 60
            channel_order = "rgb"
            "#,
        )
        .unwrap();
        let env = env_of(&[("SPOOKY_WIDTH", "32"), ("SPOOKY_MUTE", "true")]);

        let config = Config::from_sources(fc, env).unwrap();
        assert_eq!(config.panel.width, 32);
        assert_eq!(config.panel.fps, 60);
        assert_eq!(config.panel.channel_order, ChannelOrder::Rgb);
        assert!(config.speech.mute);
    }

    #[test]
    fn test_invalid_env_value_names_the_variable() {
        let env = env_of(&[("SPOOKY_FPS", "fast")]);
        let err = Config::from_sources(PanelConfigFile::default(), env).unwrap_err();
        assert!(err.to_string().contains("SPOOKY_FPS"));
    }

    #[test]
    fn test_zero_size_rejected() {
        let env = env_of(&[("SPOOKY_HEIGHT", "0")]);
        assert!(matches!(
            Config::from_sources(PanelConfigFile::default(), env),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_fps_out_of_range_rejected() {
        for fps in ["0", "1001", "2000000000"] {
            let env = env_of(&[("SPOOKY_FPS", fps)]);
            let err = Config::from_sources(PanelConfigFile::default(), env).unwrap_err();
            assert!(err.to_string().contains("fps"), "{fps}: {err}");
        }
        let env = env_of(&[("SPOOKY_FPS", "1000")]);
        assert_eq!(
            Config::from_sources(PanelConfigFile::default(), env)
                .unwrap()
                .panel
                .fps,
            1000
        );
    }

    #[test]
    fn test_elevenlabs_uses_its_key_and_defaults() {
        let env = env_of(&[
            ("SPOOKY_TTS_PROVIDER", "elevenlabs"),
            ("OPENAI_API_KEY", "sk-wrong"),
            ("ELEVENLABS_API_KEY", "xi-right"),
        ]);
        let config = Config::from_sources(PanelConfigFile::default(), env).unwrap();
        assert_eq!(config.speech.api_key.as_deref(), Some("xi-right"));
        assert_eq!(config.speech.model, "eleven_multilingual_v2");
        assert_eq!(config.http_speech_config().unwrap().api_key, "xi-right");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let config = Config::from_sources(PanelConfigFile::default(), no_env).unwrap();
        assert!(matches!(config.http_speech_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_evil_shows_overlay() {
        let fc: PanelConfigFile = toml::from_str(
            r#"
            [shows]
            speaking = "rainbow"

            [shows.evil]
            speaking = "two-axis"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(fc, no_env).unwrap();

        let shows = &config.shows;
        assert_eq!(shows.show_for(ConversationMode::Speaking, Persona::Benevolent), "rainbow");
        assert_eq!(shows.show_for(ConversationMode::Speaking, Persona::Evil), "two-axis");
        assert_eq!(shows.show_for(ConversationMode::Idle, Persona::Evil), "ember");
    }

    #[test]
    fn test_validate_against_registry() {
        let registry = ShowRegistry::with_builtins();
        let config = Config::from_sources(PanelConfigFile::default(), no_env).unwrap();
        config.validate(&registry).unwrap();

        let env = env_of(&[("SPOOKY_INITIAL_SHOW", "fireworks")]);
        let config = Config::from_sources(PanelConfigFile::default(), env).unwrap();
        let err = config.validate(&registry).unwrap_err();
        assert!(err.to_string().contains("fireworks"));
    }
}
