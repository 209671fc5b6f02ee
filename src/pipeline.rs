//! Chapter orchestrator.
//!
//! Chapters run one at a time in manifest order. Each chapter resumes from
//! the earliest stage whose files are missing: the clean-text snapshot
//! short-circuits extraction, existing audio parts short-circuit their
//! synthesis, and a valid final artifact skips the chapter altogether.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};

use crate::assembler::{AudioAssembler, AudioConcat};
use crate::book::{Book, ChapterRef};
use crate::chunker::Chunker;
use crate::config::Config;
use crate::error::{ChapterError, ExtractionError, PipelineError, SynthesisError};
use crate::fsutil::{atomic_write, MIN_AUDIO_BYTES};
use crate::normalizer::TextNormalizer;
use crate::retry::with_backoff;
use crate::source::{ChapterSource, MAX_PAGES};
use crate::state::{ChapterPaths, ChapterStatus, StateStore};
use crate::synthesis::Synthesizer;

/// Shared interrupt flag, checked between chunk-level operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    /// Artifact produced in this run.
    Complete,
    /// A valid artifact already existed.
    Skipped,
    /// Extract-only run: text snapshots written, no audio.
    Extracted,
    /// Nothing left to speak after cleaning; needs a human look.
    Empty,
    Failed(String),
}

impl fmt::Display for ChapterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterOutcome::Complete => write!(f, "complete"),
            ChapterOutcome::Skipped => write!(f, "skipped (already done)"),
            ChapterOutcome::Extracted => write!(f, "extracted"),
            ChapterOutcome::Empty => write!(f, "empty (review source)"),
            ChapterOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChapterReport {
    pub ordinal: usize,
    pub title: String,
    pub outcome: ChapterOutcome,
    pub artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub chapters: Vec<ChapterReport>,
}

impl RunReport {
    fn count(&self, matches: impl Fn(&ChapterOutcome) -> bool) -> usize {
        self.chapters.iter().filter(|c| matches(&c.outcome)).count()
    }

    pub fn complete(&self) -> usize {
        self.count(|o| *o == ChapterOutcome::Complete)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| *o == ChapterOutcome::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ChapterOutcome::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    pub fn outcome(&self, ordinal: usize) -> Option<&ChapterOutcome> {
        self.chapters.iter().find(|c| c.ordinal == ordinal).map(|c| &c.outcome)
    }

    pub fn log_summary(&self) {
        info!(
            "Run finished: {} complete, {} skipped, {} failed, {} other",
            self.complete(),
            self.skipped(),
            self.failed(),
            self.chapters.len() - self.complete() - self.skipped() - self.failed()
        );
        for chapter in &self.chapters {
            match &chapter.outcome {
                ChapterOutcome::Failed(_) => {
                    error!("  Chapter {:02} {}: {}", chapter.ordinal, chapter.title, chapter.outcome)
                }
                ChapterOutcome::Empty => {
                    warn!("  Chapter {:02} {}: {}", chapter.ordinal, chapter.title, chapter.outcome)
                }
                _ => info!("  Chapter {:02} {}: {}", chapter.ordinal, chapter.title, chapter.outcome),
            }
        }
    }
}

pub struct Pipeline {
    config: Config,
    source: Arc<dyn ChapterSource>,
    synthesizer: Arc<dyn Synthesizer>,
    concat: Arc<dyn AudioConcat>,
    normalizer: TextNormalizer,
    chunker: Chunker,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(
        config: Config,
        source: Arc<dyn ChapterSource>,
        synthesizer: Arc<dyn Synthesizer>,
        concat: Arc<dyn AudioConcat>,
    ) -> Self {
        let normalizer = TextNormalizer::new(&config.encoding);
        let chunker = Chunker::new(config.max_chunk_bytes);
        Self {
            config,
            source,
            synthesizer,
            concat,
            normalizer,
            chunker,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Processes every chapter of `book`. Individual chapter failures are
    /// reported in the returned [`RunReport`]; only authentication failures
    /// and interrupts end the run early.
    pub async fn run(&self, book: &Book) -> Result<RunReport, PipelineError> {
        let book_dir = book.output_dir(&self.config.output.base_dir);
        info!(
            "Processing \"{}\" ({} chapters) into {}",
            book.title,
            book.chapters.len(),
            book_dir.display()
        );

        let mut store = StateStore::open(&book_dir, &self.config.output)
            .map_err(|e| PipelineError::io(format!("preparing {}", book_dir.display()), e))?;

        let progress = self.progress_bar(book.chapters.len());
        let mut report = RunReport::default();

        for chapter in &book.chapters {
            if self.cancel.is_cancelled() {
                progress.abandon_with_message("interrupted");
                return Err(PipelineError::Interrupted);
            }
            progress.set_message(format!("{:02} {}", chapter.ordinal, chapter.title));

            let outcome = match self.process_chapter(&mut store, chapter).await {
                Ok(outcome) => outcome,
                Err(ChapterError::Interrupted) => {
                    warn!("Chapter {}: interrupted, state kept for resume", chapter.ordinal);
                    progress.abandon_with_message("interrupted");
                    return Err(PipelineError::Interrupted);
                }
                Err(ChapterError::Synthesis(SynthesisError::Auth(message))) => {
                    self.record_failure(&mut store, chapter, &message);
                    progress.abandon_with_message("authentication failed");
                    return Err(PipelineError::Auth(message));
                }
                Err(e) if self.cancel.is_cancelled() => {
                    debug!("Chapter {}: {} (after interrupt)", chapter.ordinal, e);
                    progress.abandon_with_message("interrupted");
                    return Err(PipelineError::Interrupted);
                }
                Err(e) => {
                    if matches!(e, ChapterError::Synthesis(SynthesisError::PayloadTooLarge { .. })) {
                        error!("Chapter {}: chunking produced an oversized request, please report: {}", chapter.ordinal, e);
                    } else {
                        error!("Chapter {} failed: {}", chapter.ordinal, e);
                    }
                    let reason = e.to_string();
                    self.record_failure(&mut store, chapter, &reason);
                    ChapterOutcome::Failed(reason)
                }
            };

            let artifact = matches!(outcome, ChapterOutcome::Complete | ChapterOutcome::Skipped)
                .then(|| store.paths(chapter).artifact);
            report.chapters.push(ChapterReport {
                ordinal: chapter.ordinal,
                title: chapter.title.clone(),
                outcome,
                artifact,
            });
            progress.inc(1);
        }

        progress.finish_with_message("done");
        if !self.config.extract_only {
            match write_playlist(store.book_dir(), &report) {
                Ok(Some(path)) => info!("Playlist written to {}", path.display()),
                Ok(None) => {}
                Err(e) => warn!("Could not write playlist: {}", e),
            }
        }
        report.log_summary();
        Ok(report)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}/{len:3} {msg}")
            .map(|s| s.progress_chars("█▉▊▋▌▍▎▏  "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar
    }

    fn record_failure(&self, store: &mut StateStore, chapter: &ChapterRef, reason: &str) {
        if let Err(e) = store.mark_failed(chapter, reason) {
            warn!("Chapter {}: could not record failure: {}", chapter.ordinal, e);
        }
    }

    async fn process_chapter(
        &self,
        store: &mut StateStore,
        chapter: &ChapterRef,
    ) -> Result<ChapterOutcome, ChapterError> {
        let paths = store.paths(chapter);

        if self.config.force_reprocess {
            info!("Chapter {}: forced, discarding cached work", chapter.ordinal);
            store
                .reset(chapter)
                .map_err(|e| ChapterError::io("resetting chapter state", e))?;
        }

        let probe = store
            .probe(chapter)
            .map_err(|e| ChapterError::io("inspecting chapter files", e))?;

        if probe.artifact_valid && !self.config.force_reprocess {
            info!("Chapter {}: already complete, skipping", chapter.ordinal);
            self.finish_cleanup(store, chapter)?;
            return Ok(ChapterOutcome::Skipped);
        }
        if let Some(previous) = &probe.last_error {
            info!("Chapter {}: previous attempt failed ({}), resuming", chapter.ordinal, previous);
        }
        debug!(
            "Chapter {}: resuming from {:?} ({} part file(s) on disk)",
            chapter.ordinal, probe.status, probe.parts_on_disk
        );

        let text = self.clean_text(store, chapter, &paths).await?;

        if self.config.extract_only {
            info!("Chapter {}: text extracted to {}", chapter.ordinal, paths.clean_text.display());
            return Ok(ChapterOutcome::Extracted);
        }
        if text.trim().is_empty() {
            warn!("Chapter {}: no speakable text after cleaning, flagged for review", chapter.ordinal);
            return Ok(ChapterOutcome::Empty);
        }

        self.check_cancelled()?;
        self.synthesize_and_assemble(store, chapter, &paths, &text).await?;

        self.finish_cleanup(store, chapter)?;
        store
            .mark_complete(chapter)
            .map_err(|e| ChapterError::io("recording completion", e))?;
        info!("Chapter {}: complete -> {}", chapter.ordinal, paths.artifact.display());
        Ok(ChapterOutcome::Complete)
    }

    /// Returns the exact text to speak, from the clean snapshot when present,
    /// else from the raw snapshot, else from the source.
    async fn clean_text(
        &self,
        store: &mut StateStore,
        chapter: &ChapterRef,
        paths: &ChapterPaths,
    ) -> Result<String, ChapterError> {
        if paths.clean_text.is_file() {
            debug!("Chapter {}: reusing {}", chapter.ordinal, paths.clean_text.display());
            return tokio::fs::read_to_string(&paths.clean_text)
                .await
                .map_err(|e| ChapterError::io("reading clean text snapshot", e));
        }

        let raw = if paths.raw_text.is_file() {
            debug!("Chapter {}: reusing {}", chapter.ordinal, paths.raw_text.display());
            tokio::fs::read_to_string(&paths.raw_text)
                .await
                .map_err(|e| ChapterError::io("reading raw text snapshot", e))?
        } else {
            let raw = self.extract(store, chapter).await?;
            atomic_write(&paths.raw_text, raw.as_bytes())
                .map_err(|e| ChapterError::io("writing raw text snapshot", e))?;
            store
                .mark(chapter, ChapterStatus::Extracted)
                .map_err(|e| ChapterError::io("recording extraction", e))?;
            raw
        };

        let body = self.normalizer.clean(&raw);
        let text = if self.config.announce_chapters && !body.is_empty() {
            self.normalizer.announce(chapter.ordinal, &chapter.title, &body)
        } else {
            body
        };

        atomic_write(&paths.clean_text, text.as_bytes())
            .map_err(|e| ChapterError::io("writing clean text snapshot", e))?;
        store
            .mark(chapter, ChapterStatus::Cleaned)
            .map_err(|e| ChapterError::io("recording cleaned text", e))?;
        debug!("Chapter {}: {} bytes of clean text", chapter.ordinal, text.len());
        Ok(text)
    }

    /// Fetches the source with retries and decodes it, falling back through
    /// the configured encodings.
    async fn extract(&self, store: &mut StateStore, chapter: &ChapterRef) -> Result<String, ChapterError> {
        info!("Chapter {}: extracting {}", chapter.ordinal, chapter.source);
        let source = &self.source;
        // Request timeouts are the source's own; this bounds a whole
        // multi-page chapter.
        let timeout = self.config.timeouts.fetch() * MAX_PAGES as u32;
        let label = format!("Chapter {} fetch", chapter.ordinal);

        let fetched = with_backoff(&self.config.retry, &label, &self.cancel, move || async move {
            match tokio::time::timeout(timeout, source.fetch(chapter)).await {
                Ok(result) => result,
                Err(_) => Err(ExtractionError::Timeout {
                    url: chapter.source.clone(),
                }),
            }
        })
        .await;
        let raw = match fetched {
            Ok(raw) => raw,
            Err(_) if self.cancel.is_cancelled() => return Err(ChapterError::Interrupted),
            Err(e) => return Err(e.into()),
        };
        if raw.title != chapter.title {
            debug!("Chapter {}: source calls itself \"{}\"", chapter.ordinal, raw.title);
        }

        let (text, encoding) = self.normalizer.decode_with_fallbacks(
            &raw.bytes,
            &raw.encoding,
            &self.config.encoding.fallback_encodings,
        )?;
        if encoding != raw.encoding {
            warn!(
                "Chapter {}: declared encoding {} did not decode cleanly, used {}",
                chapter.ordinal, raw.encoding, encoding
            );
        }
        store
            .set_encoding(chapter, &encoding)
            .map_err(|e| ChapterError::io("recording encoding", e))?;
        Ok(text)
    }

    async fn synthesize_and_assemble(
        &self,
        store: &mut StateStore,
        chapter: &ChapterRef,
        paths: &ChapterPaths,
        text: &str,
    ) -> Result<(), ChapterError> {
        let chunks = self.chunker.split(text);
        let total = chunks.len();
        let mut parts = store
            .reconcile_parts(chapter, &chunks)
            .map_err(|e| ChapterError::io("checking existing audio parts", e))?;

        let missing = total - parts.len();
        if missing == 0 {
            info!("Chapter {}: all {} parts already synthesized", chapter.ordinal, total);
        } else {
            info!(
                "Chapter {}: synthesizing {} of {} part(s)",
                chapter.ordinal, missing, total
            );
        }

        let format = store.format();
        let synthesizer = &self.synthesizer;
        let voice = &self.config.voice;
        let timeout = self.config.timeouts.synthesis();

        for chunk in &chunks {
            if parts.contains_key(&chunk.index) {
                debug!("Chapter {}: part {}/{} present", chapter.ordinal, chunk.index, total);
                continue;
            }
            self.check_cancelled()?;

            let label = format!("Chapter {} part {}/{}", chapter.ordinal, chunk.index, total);
            let synthesized = with_backoff(&self.config.retry, &label, &self.cancel, move || async move {
                match tokio::time::timeout(timeout, synthesizer.synthesize(chunk, voice)).await {
                    Ok(result) => result,
                    Err(_) => Err(SynthesisError::Transient(format!("no response within {timeout:?}"))),
                }
            })
            .await;
            let audio = match synthesized {
                Ok(audio) => audio,
                Err(_) if self.cancel.is_cancelled() => return Err(ChapterError::Interrupted),
                Err(e) => return Err(e.into()),
            };

            if (audio.len() as u64) < MIN_AUDIO_BYTES || !format.matches_header(&audio) {
                return Err(SynthesisError::InvalidResponse(format!(
                    "part {} is not {} audio ({} bytes)",
                    chunk.index,
                    format.extension(),
                    audio.len()
                ))
                .into());
            }

            let path = paths.part(chunk.index, total);
            atomic_write(&path, &audio).map_err(|e| ChapterError::io("writing audio part", e))?;
            debug!("{} saved to {}", label, path.display());
            parts.insert(chunk.index, path);
        }

        store
            .mark(chapter, ChapterStatus::Synthesized)
            .map_err(|e| ChapterError::io("recording synthesis", e))?;
        self.check_cancelled()?;

        info!("Chapter {}: merging {} part(s)", chapter.ordinal, total);
        let assembler = AudioAssembler::new(self.concat.as_ref(), format);
        let assembler = &assembler;
        let parts = &parts;
        let artifact = &paths.artifact;
        let label = format!("Chapter {} merge", chapter.ordinal);
        let merged = with_backoff(&self.config.retry, &label, &self.cancel, move || {
            assembler.assemble(parts, total, artifact)
        })
        .await;
        match merged {
            Ok(()) => Ok(()),
            Err(_) if self.cancel.is_cancelled() => Err(ChapterError::Interrupted),
            Err(e) => {
                warn!("Chapter {}: parts kept in place for inspection", chapter.ordinal);
                Err(e.into())
            }
        }
    }

    /// Drops leftovers of a finished chapter: stray parts and, unless
    /// configured to keep them, the text snapshots.
    fn finish_cleanup(&self, store: &StateStore, chapter: &ChapterRef) -> Result<(), ChapterError> {
        store
            .purge_parts(chapter)
            .map_err(|e| ChapterError::io("removing audio parts", e))?;
        if !self.config.output.keep_text_snapshots {
            store
                .purge_text(chapter)
                .map_err(|e| ChapterError::io("removing text snapshots", e))?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), ChapterError> {
        if self.cancel.is_cancelled() {
            Err(ChapterError::Interrupted)
        } else {
            Ok(())
        }
    }
}

pub const PLAYLIST_FILE: &str = "audiobook.m3u";

/// Writes an M3U playlist of every finished chapter artifact, in chapter
/// order, next to the artifacts. Nothing is written when no chapter has one.
pub fn write_playlist(book_dir: &Path, report: &RunReport) -> io::Result<Option<PathBuf>> {
    let mut entries = String::new();
    for chapter in &report.chapters {
        let Some(name) = chapter.artifact.as_deref().and_then(Path::file_name) else {
            continue;
        };
        entries.push_str(&format!("#EXTINF:-1,{}\n{}\n", chapter.title, name.to_string_lossy()));
    }
    if entries.is_empty() {
        return Ok(None);
    }

    let path = book_dir.join(PLAYLIST_FILE);
    atomic_write(&path, format!("#EXTM3U\n{entries}").as_bytes())?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn report_counts_outcomes() {
        let report = RunReport {
            chapters: vec![
                ChapterReport {
                    ordinal: 1,
                    title: "a".into(),
                    outcome: ChapterOutcome::Failed("quota".into()),
                    artifact: None,
                },
                ChapterReport {
                    ordinal: 2,
                    title: "b".into(),
                    outcome: ChapterOutcome::Complete,
                    artifact: Some(PathBuf::from("b.mp3")),
                },
                ChapterReport {
                    ordinal: 3,
                    title: "c".into(),
                    outcome: ChapterOutcome::Empty,
                    artifact: None,
                },
            ],
        };

        assert_eq!(report.failed(), 1);
        assert_eq!(report.complete(), 1);
        assert_eq!(report.skipped(), 0);
        assert!(report.has_failures());
        assert_eq!(report.outcome(3), Some(&ChapterOutcome::Empty));
        assert_eq!(ChapterOutcome::Failed("x".into()).to_string(), "failed: x");

        let dir = tempfile::TempDir::new().unwrap();
        let playlist = write_playlist(dir.path(), &report).unwrap().unwrap();
        assert_eq!(
            std::fs::read_to_string(playlist).unwrap(),
            "#EXTM3U\n#EXTINF:-1,b\nb.mp3\n"
        );
        assert!(write_playlist(dir.path(), &RunReport::default()).unwrap().is_none());
    }
}
