//! Per-chapter resume state.
//!
//! The files under the book directory are the run state: final artifacts,
//! `parts/` audio and `text/` snapshots. `state.json` caches what cannot be
//! read back from file names (chunk digests, last error) and is always
//! reconciled against the filesystem, never trusted over it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::book::ChapterRef;
use crate::chunker::TextChunk;
use crate::config::{AudioFormat, OutputConfig};
use crate::fsutil::{atomic_write, cleanup_temp_files, remove_if_exists, sanitize_filename, verify_audio_file};

pub const STATE_FILE: &str = "state.json";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    #[default]
    Pending,
    Extracted,
    Cleaned,
    Synthesized,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChapterRecord {
    pub status: ChapterStatus,
    pub title: String,
    pub encoding: Option<String>,
    /// Digests of the chunks the current parts were synthesized from.
    pub chunk_digests: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateFile {
    version: u32,
    chapters: BTreeMap<usize, ChapterRecord>,
}

/// An audio part found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFile {
    pub index: usize,
    pub total: usize,
    pub path: PathBuf,
}

/// File name slug for chapters whose title has no usable characters.
const UNTITLED: &str = "untitled";

/// Every path belonging to one chapter.
#[derive(Debug, Clone)]
pub struct ChapterPaths {
    pub ordinal: usize,
    pub artifact: PathBuf,
    pub raw_text: PathBuf,
    pub clean_text: PathBuf,
    parts_dir: PathBuf,
    slug: String,
    extension: &'static str,
}

impl ChapterPaths {
    fn new(book_dir: &Path, parts_dir: &Path, text_dir: &Path, chapter: &ChapterRef, format: AudioFormat) -> Self {
        let mut slug = sanitize_filename(&chapter.title);
        if slug.is_empty() {
            slug = UNTITLED.to_string();
        }
        let extension = format.extension();
        let stem = format!("chapter_{:02}_{}", chapter.ordinal, slug);

        Self {
            ordinal: chapter.ordinal,
            artifact: book_dir.join(format!("{stem}.{extension}")),
            raw_text: text_dir.join(format!("chapter_{:02}_raw.txt", chapter.ordinal)),
            clean_text: text_dir.join(format!("chapter_{:02}_clean.txt", chapter.ordinal)),
            parts_dir: parts_dir.to_path_buf(),
            slug,
            extension,
        }
    }

    /// `parts/chapter_NN_part_PPP_of_TTT_<title>.<ext>`
    pub fn part(&self, index: usize, total: usize) -> PathBuf {
        self.parts_dir.join(format!(
            "chapter_{:02}_part_{:03}_of_{:03}_{}.{}",
            self.ordinal, index, total, self.slug, self.extension
        ))
    }

    /// Part files of this chapter in ascending index order. Order comes
    /// from the parsed index, not from directory listing order.
    pub fn list_parts(&self) -> io::Result<Vec<PartFile>> {
        if !self.parts_dir.exists() {
            return Ok(Vec::new());
        }

        let pattern = format!(
            r"^chapter_{:02}_part_(\d+)_of_(\d+)(?:_[a-z0-9_]*)?\.{}$",
            self.ordinal,
            regex::escape(self.extension)
        );
        let re = Regex::new(&pattern).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut parts = Vec::new();
        for entry in fs::read_dir(&self.parts_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(caps) = re.captures(&name) else {
                continue;
            };
            let (Ok(index), Ok(total)) = (caps[1].parse::<usize>(), caps[2].parse::<usize>()) else {
                continue;
            };
            parts.push(PartFile {
                index,
                total,
                path: entry.path(),
            });
        }
        parts.sort_by_key(|p| (p.index, p.total));
        Ok(parts)
    }
}

/// What the filesystem says about a chapter.
#[derive(Debug, Clone)]
pub struct ChapterProbe {
    pub status: ChapterStatus,
    pub artifact_valid: bool,
    pub has_raw_text: bool,
    pub has_clean_text: bool,
    pub parts_on_disk: usize,
    pub last_error: Option<String>,
}

pub struct StateStore {
    book_dir: PathBuf,
    parts_dir: PathBuf,
    text_dir: PathBuf,
    format: AudioFormat,
    records: BTreeMap<usize, ChapterRecord>,
}

impl StateStore {
    /// Creates the directory layout, sweeps stale temp files and loads the
    /// cached records. An unreadable `state.json` is discarded.
    pub fn open(book_dir: &Path, output: &OutputConfig) -> io::Result<Self> {
        let parts_dir = book_dir.join(&output.parts_subdir);
        let text_dir = book_dir.join(&output.text_subdir);
        fs::create_dir_all(&parts_dir)?;
        fs::create_dir_all(&text_dir)?;

        let removed = cleanup_temp_files(book_dir)?;
        if removed > 0 {
            info!("Removed {} leftover temp file(s) from an interrupted run", removed);
        }

        let state_path = book_dir.join(STATE_FILE);
        let records = match fs::read_to_string(&state_path) {
            Ok(raw) => match serde_json::from_str::<StateFile>(&raw) {
                Ok(state) if state.version == STATE_VERSION => state.chapters,
                Ok(state) => {
                    warn!("Ignoring {} with unsupported version {}", state_path.display(), state.version);
                    BTreeMap::new()
                }
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", state_path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            book_dir: book_dir.to_path_buf(),
            parts_dir,
            text_dir,
            format: output.audio_format,
            records,
        })
    }

    pub fn book_dir(&self) -> &Path {
        &self.book_dir
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn paths(&self, chapter: &ChapterRef) -> ChapterPaths {
        ChapterPaths::new(&self.book_dir, &self.parts_dir, &self.text_dir, chapter, self.format)
    }

    pub fn record(&self, ordinal: usize) -> Option<&ChapterRecord> {
        self.records.get(&ordinal)
    }

    /// Derives the chapter's stage from the files on disk and overwrites the
    /// cached status with it.
    pub fn probe(&mut self, chapter: &ChapterRef) -> io::Result<ChapterProbe> {
        let paths = self.paths(chapter);
        let artifact_valid = paths.artifact.exists() && verify_audio_file(&paths.artifact, self.format);
        let has_raw_text = paths.raw_text.is_file();
        let has_clean_text = paths.clean_text.is_file();
        let parts = paths.list_parts()?;

        let record = self.records.get(&chapter.ordinal).cloned().unwrap_or_default();
        let expected = record.chunk_digests.len();
        let complete_parts = expected > 0
            && (1..=expected).all(|i| {
                parts
                    .iter()
                    .any(|p| p.index == i && p.total == expected && verify_audio_file(&p.path, self.format))
            });

        let status = if artifact_valid {
            ChapterStatus::Complete
        } else if has_clean_text && complete_parts {
            ChapterStatus::Synthesized
        } else if has_clean_text {
            ChapterStatus::Cleaned
        } else if has_raw_text {
            ChapterStatus::Extracted
        } else {
            ChapterStatus::Pending
        };

        if record.status != status {
            debug!(
                "Chapter {}: cached status {:?} reconciled to {:?} from disk",
                chapter.ordinal, record.status, status
            );
        }
        self.update(chapter, |r| r.status = status)?;

        Ok(ChapterProbe {
            status,
            artifact_valid,
            has_raw_text,
            has_clean_text,
            parts_on_disk: parts.len(),
            last_error: record.last_error,
        })
    }

    /// Records the chunk list the chapter will be synthesized from and
    /// returns the existing parts that still match it, keyed by index.
    ///
    /// Parts are discarded when their total differs from the chunk count,
    /// when the cached digest for their index no longer matches, or when the
    /// file is not valid audio.
    pub fn reconcile_parts(
        &mut self,
        chapter: &ChapterRef,
        chunks: &[TextChunk],
    ) -> io::Result<BTreeMap<usize, PathBuf>> {
        let paths = self.paths(chapter);
        let total = chunks.len();
        let previous = self
            .records
            .get(&chapter.ordinal)
            .map(|r| r.chunk_digests.clone())
            .unwrap_or_default();

        let mut valid = BTreeMap::new();
        for part in paths.list_parts()? {
            let stale_reason = if part.total != total || part.index == 0 || part.index > total {
                Some("belongs to a different chunking")
            } else if !previous.is_empty()
                && previous.get(part.index - 1) != Some(&chunks[part.index - 1].digest)
            {
                Some("was synthesized from different text")
            } else if valid.contains_key(&part.index) {
                Some("duplicates another part")
            } else if !verify_audio_file(&part.path, self.format) {
                Some("is not valid audio")
            } else {
                None
            };

            match stale_reason {
                Some(reason) => {
                    info!("Discarding part {} ({})", part.path.display(), reason);
                    remove_if_exists(&part.path)?;
                }
                None => {
                    valid.insert(part.index, part.path);
                }
            }
        }

        let digests = chunks.iter().map(|c| c.digest.clone()).collect();
        self.update(chapter, |r| r.chunk_digests = digests)?;
        Ok(valid)
    }

    pub fn mark(&mut self, chapter: &ChapterRef, status: ChapterStatus) -> io::Result<()> {
        self.update(chapter, |r| {
            r.status = status;
            if status != ChapterStatus::Failed {
                r.last_error = None;
            }
        })
    }

    pub fn set_encoding(&mut self, chapter: &ChapterRef, encoding: &str) -> io::Result<()> {
        self.update(chapter, |r| r.encoding = Some(encoding.to_string()))
    }

    pub fn mark_failed(&mut self, chapter: &ChapterRef, reason: &str) -> io::Result<()> {
        self.update(chapter, |r| {
            r.status = ChapterStatus::Failed;
            r.last_error = Some(reason.to_string());
        })
    }

    pub fn mark_complete(&mut self, chapter: &ChapterRef) -> io::Result<()> {
        self.update(chapter, |r| {
            r.status = ChapterStatus::Complete;
            r.last_error = None;
            r.chunk_digests.clear();
        })
    }

    /// Deletes every audio part of the chapter.
    pub fn purge_parts(&self, chapter: &ChapterRef) -> io::Result<usize> {
        let mut removed = 0;
        for part in self.paths(chapter).list_parts()? {
            if remove_if_exists(&part.path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} part file(s) of chapter {}", removed, chapter.ordinal);
        }
        Ok(removed)
    }

    pub fn purge_text(&self, chapter: &ChapterRef) -> io::Result<()> {
        let paths = self.paths(chapter);
        remove_if_exists(&paths.raw_text)?;
        remove_if_exists(&paths.clean_text)?;
        Ok(())
    }

    /// Forgets all intermediate work of a chapter. The final artifact is
    /// left alone; a new one replaces it atomically.
    pub fn reset(&mut self, chapter: &ChapterRef) -> io::Result<()> {
        self.purge_parts(chapter)?;
        self.purge_text(chapter)?;
        if self.records.remove(&chapter.ordinal).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn update(&mut self, chapter: &ChapterRef, change: impl FnOnce(&mut ChapterRecord)) -> io::Result<()> {
        let record = self.records.entry(chapter.ordinal).or_default();
        let before = record.clone();
        record.title = chapter.title.clone();
        change(record);
        if *record != before {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> io::Result<()> {
        let state = StateFile {
            version: STATE_VERSION,
            chapters: self.records.clone(),
        };
        let json = serde_json::to_vec_pretty(&state).map_err(io::Error::other)?;
        atomic_write(&self.book_dir.join(STATE_FILE), &json)
    }
}
