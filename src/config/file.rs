//! TOML configuration file loading
//!
//! Supports `~/.config/spooky/panel/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelConfigFile {
    /// Panel geometry and wiring
    #[serde(default)]
    pub panel: PanelFileConfig,

    /// Speech synthesis and playback
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// API keys for TTS providers
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Show chosen for each conversation mode
    #[serde(default)]
    pub shows: ShowsFileConfig,
}

/// Panel configuration
#[derive(Debug, Default, Deserialize)]
pub struct PanelFileConfig {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub fps: Option<u32>,

    /// Serial device path (e.g. "/dev/ttyACM0")
    pub device: Option<String>,
    pub baud: Option<u32>,

    /// "row-major", "serpentine-rows" or "serpentine-columns"
    pub topology: Option<String>,

    /// Byte order the strip expects (e.g. "grb")
    pub channel_order: Option<String>,

    /// Global brightness, 0-255
    pub brightness: Option<u8>,

    /// Show rendered before any mode change
    pub initial_show: Option<String>,
}

/// Speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,

    /// TTS model (e.g. "gpt-4o-mini-tts")
    pub model: Option<String>,

    pub voice_benevolent: Option<String>,
    pub voice_evil: Option<String>,

    /// TTS speed multiplier
    pub speed: Option<f32>,

    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Skip audio output
    pub mute: Option<bool>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Mode to show mapping
///
/// Top-level keys apply to the benevolent persona; `[shows.evil]` overrides
/// them for the evil persona.
#[derive(Debug, Default, Deserialize)]
pub struct ShowsFileConfig {
    #[serde(flatten)]
    pub benevolent: ModeShowsFile,

    #[serde(default)]
    pub evil: Option<ModeShowsFile>,
}

/// Show names per conversation mode
#[derive(Debug, Default, Deserialize)]
pub struct ModeShowsFile {
    pub idle: Option<String>,
    pub listening: Option<String>,
    pub thinking: Option<String>,
    pub speaking: Option<String>,
}

/// Load the TOML config file
///
/// With an explicit `path`, a missing or malformed file is an error. Without
/// one, the standard path is tried and problems fall back to defaults.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<PanelConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(PanelConfigFile::default());
    };

    if !path.exists() {
        return Ok(PanelConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(PanelConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(PanelConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/spooky/panel/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("spooky")
            .join("panel")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let config: PanelConfigFile = toml::from_str(
            r#"
            [panel]
            width = 16
            topology = "serpentine-rows"

            [shows]
            idle = "rainbow"

            [shows.evil]
            idle = "ember"
            "#,
        )
        .unwrap();

        assert_eq!(config.panel.width, Some(16));
        assert_eq!(config.panel.height, None);
        assert_eq!(config.shows.benevolent.idle.as_deref(), Some("rainbow"));
        assert_eq!(
            config.shows.evil.and_then(|e| e.idle).as_deref(),
            Some("ember")
        );
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let result = load_config_file(Some(Path::new("/nonexistent/spooky.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_explicit_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[panel\nwidth = ").unwrap();
        let result = load_config_file(Some(file.path()));
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let result: std::result::Result<PanelConfigFile, _> = toml::from_str("[bogus]\nx = 1\n");
        assert!(result.is_err());
    }
}
