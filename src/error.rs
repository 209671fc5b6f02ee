//! Error taxonomy for the chapter pipeline.
//!
//! Stage-level errors are classified at the orchestrator boundary: only
//! [`SynthesisError::Auth`] escalates to a run-fatal [`PipelineError`],
//! everything else fails the current chapter and the run continues.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors the bounded-retry wrapper may repeat.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("unknown encoding label: {0}")]
    UnknownLabel(String),

    #[error("decoding as {encoding} produced {ratio:.1}% replacement characters")]
    TooManyReplacements { encoding: String, ratio: f64 },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Retryable for ExtractionError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Io { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech provider rejected credentials: {0}")]
    Auth(String),

    #[error("speech provider quota exceeded: {0}")]
    Quota(String),

    #[error("transient speech provider failure: {0}")]
    Transient(String),

    #[error("chunk of {bytes} bytes exceeds the provider limit of {limit} bytes")]
    PayloadTooLarge { bytes: usize, limit: usize },

    #[error("invalid speech provider response: {0}")]
    InvalidResponse(String),
}

impl Retryable for SynthesisError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no audio parts to merge")]
    NoParts,

    #[error("audio parts are not contiguous: expected part {expected}, found {found}")]
    NonContiguous { expected: usize, found: usize },

    #[error("expected {expected} audio parts, found {found}")]
    MissingParts { expected: usize, found: usize },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("merge did not finish within {0:?}")]
    Timeout(Duration),

    #[error("merged output {0} failed validation")]
    InvalidOutput(PathBuf),

    #[error("merge i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Retryable for MergeError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Why a single chapter failed.
#[derive(Debug, Error)]
pub enum ChapterError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("interrupted")]
    Interrupted,
}

impl ChapterError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Failures that end the whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("speech provider authentication failed: {0}. Check GOOGLE_TTS_API_KEY or GOOGLE_OAUTH_ACCESS_TOKEN")]
    Auth(String),

    #[error("interrupted; run the same command again to resume")]
    Interrupted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
