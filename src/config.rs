use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Provider hard limit for one synthesis request, in bytes of UTF-8 text.
pub const PROVIDER_MAX_BYTES: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub voice: VoiceConfig,
    pub encoding: EncodingConfig,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub max_chunk_bytes: usize,
    pub announce_chapters: bool,
    pub force_reprocess: bool,
    pub extract_only: bool,
    pub show_progress: bool,
    pub ffmpeg_path: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: OutputConfig::default(),
            voice: VoiceConfig::default(),
            encoding: EncodingConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            // Slightly under the provider limit.
            max_chunk_bytes: 4800,
            announce_chapters: true,
            force_reprocess: false,
            extract_only: false,
            show_progress: true,
            ffmpeg_path: "ffmpeg".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AudiobookBot/1.0".to_string(),
        }
    }
}

impl Config {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("reading config {}", path.display()), e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        // Four bytes fit any UTF-8 character.
        if self.max_chunk_bytes < 4 || self.max_chunk_bytes > PROVIDER_MAX_BYTES {
            return Err(PipelineError::Config(format!(
                "max_chunk_bytes must be between 4 and {PROVIDER_MAX_BYTES}, got {}",
                self.max_chunk_bytes
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.encoding.max_replacement_ratio) {
            return Err(PipelineError::Config(
                "encoding.max_replacement_ratio must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub base_dir: PathBuf,
    pub parts_subdir: String,
    pub text_subdir: String,
    pub audio_format: AudioFormat,
    pub keep_text_snapshots: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("audiobook"),
            parts_subdir: "parts".to_string(),
            text_subdir: "text".to_string(),
            audio_format: AudioFormat::Mp3,
            keep_text_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoiceConfig {
    pub name: String,
    pub language_code: String,
    pub speaking_rate: f32,
    pub pitch: f32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            name: "ru-RU-Wavenet-B".to_string(),
            language_code: "ru-RU".to_string(),
            speaking_rate: 1.0,
            pitch: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    pub default_encoding: String,
    pub fallback_encodings: Vec<String>,
    /// Share of U+FFFD in decoded text above which decoding is rejected.
    pub max_replacement_ratio: f64,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            default_encoding: "windows-1251".to_string(),
            fallback_encodings: vec![
                "utf-8".to_string(),
                "windows-1251".to_string(),
                "koi8-r".to_string(),
            ],
            max_replacement_ratio: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1 = first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub fetch_secs: u64,
    pub synthesis_secs: u64,
    pub merge_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch_secs: 30,
            synthesis_secs: 60,
            merge_secs: 600,
        }
    }
}

impl Timeouts {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn synthesis(&self) -> Duration {
        Duration::from_secs(self.synthesis_secs)
    }

    pub fn merge(&self) -> Duration {
        Duration::from_secs(self.merge_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Ogg,
    Wav,
}

impl AudioFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "ogg" | "opus" | "ogg_opus" => Some(AudioFormat::Ogg),
            "wav" | "linear16" => Some(AudioFormat::Wav),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Wav => "wav",
        }
    }

    /// Encoding name understood by the speech provider.
    pub fn provider_encoding(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::Ogg => "OGG_OPUS",
            AudioFormat::Wav => "LINEAR16",
        }
    }

    /// Checks the container signature at the start of a file.
    pub fn matches_header(&self, header: &[u8]) -> bool {
        match self {
            AudioFormat::Mp3 => {
                header.starts_with(b"ID3")
                    || (header.len() >= 2 && header[0] == 0xFF && (header[1] & 0xE0) == 0xE0)
            }
            AudioFormat::Ogg => header.starts_with(b"OggS"),
            AudioFormat::Wav => {
                header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WAVE"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"voice": {"name": "ru-RU-Wavenet-D"}, "max_chunk_bytes": 3000}"#)
                .unwrap();
        assert_eq!(config.voice.name, "ru-RU-Wavenet-D");
        assert_eq!(config.voice.language_code, "ru-RU");
        assert_eq!(config.max_chunk_bytes, 3000);
        assert_eq!(config.encoding.default_encoding, "windows-1251");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_chunk_ceiling_above_provider_limit() {
        let config = Config {
            max_chunk_bytes: 6000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn container_signatures() {
        assert!(AudioFormat::Mp3.matches_header(b"ID3\x04\x00"));
        assert!(AudioFormat::Mp3.matches_header(&[0xFF, 0xFB, 0x90]));
        assert!(!AudioFormat::Mp3.matches_header(b"<html>"));
        assert!(AudioFormat::Ogg.matches_header(b"OggS\x00"));
        assert!(AudioFormat::Wav.matches_header(b"RIFF\x24\x00\x00\x00WAVEfmt "));
    }
}
