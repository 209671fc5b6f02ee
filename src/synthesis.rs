//! Speech synthesis seam.
//!
//! [`Synthesizer`] turns one text chunk into audio bytes and reports typed
//! failures the orchestrator can retry or escalate. It never touches the
//! filesystem; persisting audio is the orchestrator's job.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::chunker::TextChunk;
use crate::config::{AudioFormat, VoiceConfig, PROVIDER_MAX_BYTES};
use crate::error::SynthesisError;

pub const GOOGLE_TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, chunk: &TextChunk, voice: &VoiceConfig) -> Result<Vec<u8>, SynthesisError>;
}

#[derive(Debug, Clone)]
pub enum Credentials {
    ApiKey(String),
    AccessToken(String),
}

impl Credentials {
    /// Reads `GOOGLE_TTS_API_KEY`, then `GOOGLE_OAUTH_ACCESS_TOKEN`.
    pub fn from_env() -> Result<Self, SynthesisError> {
        if let Some(key) = non_empty_var("GOOGLE_TTS_API_KEY") {
            return Ok(Credentials::ApiKey(key));
        }
        if let Some(token) = non_empty_var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok(Credentials::AccessToken(token));
        }
        Err(SynthesisError::Auth(
            "no credentials: set GOOGLE_TTS_API_KEY or GOOGLE_OAUTH_ACCESS_TOKEN".into(),
        ))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    speaking_rate: f32,
    pitch: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Google Cloud Text-to-Speech over its REST API.
pub struct GoogleTtsClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
    quota_project: Option<String>,
    format: AudioFormat,
}

impl GoogleTtsClient {
    pub fn new(
        credentials: Credentials,
        format: AudioFormat,
        timeout: Duration,
    ) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::Transient(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: GOOGLE_TTS_URL.to_string(),
            credentials,
            quota_project: non_empty_var("GCP_PROJECT_ID"),
            format,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn classify_status(status: u16, body: &str, chunk_bytes: usize) -> SynthesisError {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.chars().take(300).collect());

        match status {
            401 | 403 => SynthesisError::Auth(message),
            429 => SynthesisError::Quota(message),
            400 if mentions_size_limit(&message) => SynthesisError::PayloadTooLarge {
                bytes: chunk_bytes,
                limit: PROVIDER_MAX_BYTES,
            },
            408 | 500..=599 => SynthesisError::Transient(format!("HTTP {status}: {message}")),
            _ => SynthesisError::InvalidResponse(format!("HTTP {status}: {message}")),
        }
    }
}

fn mentions_size_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("5000 bytes") || lower.contains("too long") || lower.contains("longer than")
}

#[async_trait]
impl Synthesizer for GoogleTtsClient {
    async fn synthesize(&self, chunk: &TextChunk, voice: &VoiceConfig) -> Result<Vec<u8>, SynthesisError> {
        if chunk.byte_len() > PROVIDER_MAX_BYTES {
            return Err(SynthesisError::PayloadTooLarge {
                bytes: chunk.byte_len(),
                limit: PROVIDER_MAX_BYTES,
            });
        }

        let body = SynthesizeRequest {
            input: SynthesisInput {
                text: chunk.text.trim(),
            },
            voice: VoiceSelection {
                language_code: &voice.language_code,
                name: &voice.name,
            },
            audio_config: AudioConfig {
                audio_encoding: self.format.provider_encoding(),
                speaking_rate: voice.speaking_rate,
                pitch: voice.pitch,
            },
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        request = match &self.credentials {
            Credentials::ApiKey(key) => request.query(&[("key", key)]),
            Credentials::AccessToken(token) => request.bearer_auth(token),
        };
        if let Some(project) = &self.quota_project {
            request = request.header("x-goog-user-project", project);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SynthesisError::Transient("request timed out".into())
            } else {
                SynthesisError::Transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = Self::classify_status(status.as_u16(), &body, chunk.byte_len());
            warn!("Synthesis of chunk {} failed: {}", chunk.index, error);
            return Err(error);
        }

        let parsed: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::InvalidResponse(format!("malformed body: {e}")))?;
        let audio = BASE64
            .decode(parsed.audio_content.as_bytes())
            .map_err(|e| SynthesisError::InvalidResponse(format!("audioContent is not base64: {e}")))?;
        if audio.is_empty() {
            return Err(SynthesisError::InvalidResponse("empty audioContent".into()));
        }

        debug!("Chunk {} synthesized into {} bytes", chunk.index, audio.len());
        Ok(audio)
    }
}
