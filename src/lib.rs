//! Resumable pipeline that turns web-hosted books into per-chapter audio.
//!
//! A run walks the chapters of a [`Book`] in order: fetch, decode and clean
//! the text, split it into provider-sized chunks, synthesize each chunk to an
//! audio part on disk, and merge the parts into one artifact per chapter.
//! Every intermediate is written atomically, so an interrupted run picks up
//! where it stopped.

pub mod assembler;
pub mod book;
pub mod chunker;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod normalizer;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod state;
pub mod synthesis;

pub use assembler::{AudioAssembler, AudioConcat, FfmpegConcat};
pub use book::{Book, BookManifest, ChapterEntry, ChapterRef};
pub use chunker::{Chunker, TextChunk};
pub use config::{AudioFormat, Config};
pub use error::{ChapterError, EncodingError, ExtractionError, MergeError, PipelineError, SynthesisError};
pub use normalizer::TextNormalizer;
pub use pipeline::{CancelFlag, ChapterOutcome, ChapterReport, Pipeline, RunReport};
pub use source::{ChapterSource, DefaultChapterSource, RawChapter};
pub use state::{ChapterStatus, StateStore};
pub use synthesis::{Credentials, GoogleTtsClient, Synthesizer};
