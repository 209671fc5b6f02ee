//! Book manifest: the ordered chapter list a run works through.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::fsutil::sanitize_dir_name;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookManifest {
    pub title: String,
    #[serde(default)]
    pub author: String,
    pub chapters: Vec<ChapterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterEntry {
    pub title: String,
    pub source: String,
}

/// One unit of resumable work. `ordinal` is 1-based and fixed by manifest
/// order; it drives every file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    pub ordinal: usize,
    pub title: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Book {
    pub title: String,
    pub author: String,
    pub chapters: Vec<ChapterRef>,
}

impl Book {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| PipelineError::io(format!("reading manifest {}", path.display()), e))?;
        let manifest: BookManifest = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_manifest(manifest)
    }

    pub fn from_manifest(manifest: BookManifest) -> Result<Self, PipelineError> {
        if manifest.chapters.is_empty() {
            return Err(PipelineError::Config("book manifest has no chapters".into()));
        }

        let mut chapters = Vec::with_capacity(manifest.chapters.len());
        for (i, entry) in manifest.chapters.into_iter().enumerate() {
            let ordinal = i + 1;
            if entry.title.trim().is_empty() {
                return Err(PipelineError::Config(format!("chapter {ordinal} has no title")));
            }
            if entry.source.trim().is_empty() {
                return Err(PipelineError::Config(format!("chapter {ordinal} has no source")));
            }
            chapters.push(ChapterRef {
                ordinal,
                title: entry.title.trim().to_string(),
                source: entry.source.trim().to_string(),
            });
        }

        Ok(Self {
            title: manifest.title,
            author: manifest.author,
            chapters,
        })
    }

    /// `<base>/<author>_<title>`, both parts sanitised.
    pub fn output_dir(&self, base: &Path) -> PathBuf {
        let slug = |s: &str| {
            let safe = sanitize_dir_name(s);
            if safe.is_empty() { "unknown".to_string() } else { safe }
        };
        base.join(format!("{}_{}", slug(&self.author), slug(&self.title)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(chapters: Vec<ChapterEntry>) -> BookManifest {
        BookManifest {
            title: "Крым, 1920".into(),
            author: "Слащов-Крымский Я. А.".into(),
            chapters,
        }
    }

    #[test]
    fn ordinals_follow_manifest_order() {
        let book = Book::from_manifest(manifest(vec![
            ChapterEntry { title: "Вступление".into(), source: "http://example.org/01.html".into() },
            ChapterEntry { title: " Глава II ".into(), source: "http://example.org/02.html".into() },
        ]))
        .unwrap();

        assert_eq!(book.chapters[0].ordinal, 1);
        assert_eq!(book.chapters[1].ordinal, 2);
        assert_eq!(book.chapters[1].title, "Глава II");
    }

    #[test]
    fn rejects_empty_book_and_blank_titles() {
        assert!(Book::from_manifest(manifest(vec![])).is_err());
        assert!(Book::from_manifest(manifest(vec![ChapterEntry {
            title: "  ".into(),
            source: "a.html".into()
        }]))
        .is_err());
    }

    #[test]
    fn output_dir_is_sanitised() {
        let book = Book::from_manifest(manifest(vec![ChapterEntry {
            title: "x".into(),
            source: "a.html".into(),
        }]))
        .unwrap();
        assert_eq!(
            book.output_dir(Path::new("out")),
            Path::new("out").join("slaschov_krymskiy_ya_a_krym_1920")
        );
    }
}
