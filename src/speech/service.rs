//! Text-to-speech service seam
//!
//! The sequencer only needs a success/failure outcome per clip. Transport,
//! retries, and timeouts belong to the [`SpeechService`] implementation.

use std::time::Duration;

use async_trait::async_trait;

use super::clip::SpeechRequest;
use crate::state::Persona;
use crate::{Error, Result};

/// Result of a synthesis request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesized {
    /// Audio bytes returned inline
    Audio(Vec<u8>),
    /// Audio must be fetched from this URL
    Remote(String),
}

/// Turns text into audio
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Request synthesis of one utterance
    ///
    /// # Errors
    ///
    /// Returns `Synthesis` if the provider rejects or fails the request
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Synthesized>;

    /// Fetch audio for a [`Synthesized::Remote`] result
    ///
    /// # Errors
    ///
    /// Returns `Download` if the audio cannot be retrieved
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// Synthesize and, when needed, download the audio for one request
///
/// # Errors
///
/// Returns the synthesis or download failure
pub async fn fetch_audio(service: &dyn SpeechService, request: &SpeechRequest) -> Result<Vec<u8>> {
    match service.synthesize(request).await? {
        Synthesized::Audio(bytes) => Ok(bytes),
        Synthesized::Remote(url) => {
            tracing::debug!(url = %url, "downloading synthesized audio");
            service.download(&url).await
        }
    }
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" | "eleven-labs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Voice identifier per persona
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaVoices {
    pub benevolent: String,
    pub evil: String,
}

impl PersonaVoices {
    #[must_use]
    pub fn voice_for(&self, persona: Persona) -> &str {
        match persona {
            Persona::Benevolent => &self.benevolent,
            Persona::Evil => &self.evil,
        }
    }
}

/// Settings for [`HttpSpeechService`]
#[derive(Debug, Clone)]
pub struct HttpSpeechConfig {
    pub provider: TtsProvider,
    pub api_key: String,
    pub model: String,
    pub voices: PersonaVoices,
    /// Speech rate multiplier (`OpenAI` only)
    pub speed: f32,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Synthesizes speech over HTTP via `OpenAI` or `ElevenLabs`
pub struct HttpSpeechService {
    client: reqwest::Client,
    config: HttpSpeechConfig,
}

impl HttpSpeechService {
    /// Create a new HTTP speech service
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the client cannot be built
    pub fn new(config: HttpSpeechConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(format!(
                "{:?} API key required for TTS",
                config.provider
            )));
        }

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self { client, config })
    }

    /// Synthesize using `OpenAI` TTS
    async fn synthesize_openai(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            #[serde(skip_serializing_if = "Option::is_none")]
            instructions: Option<String>,
        }

        let body = TtsRequest {
            model: &self.config.model,
            input: &request.text,
            voice: self.config.voices.voice_for(request.persona),
            speed: self.config.speed,
            instructions: request
                .emotion
                .as_deref()
                .map(|e| format!("Speak in a {e} tone.")),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        Ok(audio.to_vec())
    }

    /// Synthesize using `ElevenLabs` TTS
    async fn synthesize_elevenlabs(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.config.voices.voice_for(request.persona)
        );

        let body = ElevenLabsRequest {
            text: &request.text,
            model_id: &self.config.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Synthesized> {
        tracing::debug!(
            provider = ?self.config.provider,
            persona = %request.persona,
            chars = request.text.len(),
            "synthesizing speech"
        );

        let audio = match self.config.provider {
            TtsProvider::OpenAI => self.synthesize_openai(request).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(request).await?,
        };
        Ok(Synthesized::Audio(audio))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Download(format!("{url} returned {}", response.status())));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Download(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str) -> HttpSpeechConfig {
        HttpSpeechConfig {
            provider: TtsProvider::OpenAI,
            api_key: api_key.to_string(),
            model: "tts-1".to_string(),
            voices: PersonaVoices {
                benevolent: "nova".to_string(),
                evil: "onyx".to_string(),
            },
            speed: 1.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_missing_api_key_rejected() {
        assert!(matches!(HttpSpeechService::new(config("")), Err(Error::Config(_))));
        assert!(HttpSpeechService::new(config("sk-test")).is_ok());
    }

    #[test]
    fn test_voice_per_persona() {
        let voices = config("k").voices;
        assert_eq!(voices.voice_for(Persona::Benevolent), "nova");
        assert_eq!(voices.voice_for(Persona::Evil), "onyx");
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("OpenAI".parse::<TtsProvider>().unwrap(), TtsProvider::OpenAI);
        assert_eq!("elevenlabs".parse::<TtsProvider>().unwrap(), TtsProvider::ElevenLabs);
        assert!("polly".parse::<TtsProvider>().is_err());
    }

    struct RemoteOnly;

    #[async_trait]
    impl SpeechService for RemoteOnly {
        async fn synthesize(&self, request: &SpeechRequest) -> Result<Synthesized> {
            Ok(Synthesized::Remote(format!("mem://{}", request.text)))
        }

        async fn download(&self, url: &str) -> Result<Vec<u8>> {
            url.strip_prefix("mem://")
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| Error::Download(url.to_string()))
        }
    }

    #[tokio::test]
    async fn test_fetch_audio_follows_remote() {
        let audio = fetch_audio(&RemoteOnly, &SpeechRequest::new("boo", Persona::Evil))
            .await
            .unwrap();
        assert_eq!(audio, b"boo");
    }
}
