//! Filesystem helpers: atomic writes, temp-file sweeping, artifact checks and
//! filename sanitising.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use log::{debug, info, warn};
use regex::Regex;

use crate::config::AudioFormat;

/// Audio files smaller than this are never considered playable.
pub const MIN_AUDIO_BYTES: u64 = 128;

/// Marker carried by every temporary file name this crate creates.
pub const TEMP_MARKER: &str = ".tmp";

/// Writes `contents` to `path` through a sibling temp file and a rename, so
/// readers only ever see the old file or the complete new one.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::Builder::new().prefix(TEMP_MARKER).tempfile_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    debug!("Atomically wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_MARKER) || name.ends_with(TEMP_MARKER) || name.contains(".tmp.")
}

/// Removes leftovers of interrupted atomic writes under `dir`, recursively.
pub fn cleanup_temp_files(dir: &Path) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            count += cleanup_temp_files(&path)?;
            continue;
        }
        let name = entry.file_name();
        if is_temp_file(&name.to_string_lossy()) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed temp file: {}", path.display());
                    count += 1;
                }
                Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }
    }

    if count > 0 {
        info!("Cleaned up {} temporary file(s) in {}", count, dir.display());
    }
    Ok(count)
}

/// True when `path` is a non-trivial file with the container signature of
/// `format`.
pub fn verify_audio_file(path: &Path, format: AudioFormat) -> bool {
    let size = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return false,
    };
    if size < MIN_AUDIO_BYTES {
        warn!("{} is too small to be audio ({} bytes)", path.display(), size);
        return false;
    }

    let mut header = [0u8; 12];
    let read = match File::open(path).and_then(|mut f| f.read(&mut header)) {
        Ok(n) => n,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return false;
        }
    };

    let ok = format.matches_header(&header[..read]);
    if !ok {
        warn!("{} has no valid {} header", path.display(), format.extension());
    }
    ok
}

pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn transliterate(c: char) -> Option<&'static str> {
    let latin = match c {
        'а' => "a", 'б' => "b", 'в' => "v", 'г' => "g", 'д' => "d", 'е' => "e", 'ё' => "yo",
        'ж' => "zh", 'з' => "z", 'и' => "i", 'й' => "y", 'к' => "k", 'л' => "l", 'м' => "m",
        'н' => "n", 'о' => "o", 'п' => "p", 'р' => "r", 'с' => "s", 'т' => "t", 'у' => "u",
        'ф' => "f", 'х' => "h", 'ц' => "ts", 'ч' => "ch", 'ш' => "sh", 'щ' => "sch",
        'ъ' | 'ь' => "", 'ы' => "y", 'э' => "e", 'ю' => "yu", 'я' => "ya",
        _ => return None,
    };
    Some(latin)
}

const MAX_SLUG_CHARS: usize = 50;

/// Filesystem-safe slug: Cyrillic transliterated, lower-case `[a-z0-9_]`,
/// at most 50 characters. Empty input yields an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let truncated: String = slugify(name).chars().take(MAX_SLUG_CHARS).collect();
    truncated.trim_matches(|c| c == '_' || c == '-').to_string()
}

/// Same alphabet as [`sanitize_filename`], but separators are trimmed before
/// truncating, so a cut can leave a trailing `_`.
pub fn sanitize_dir_name(name: &str) -> String {
    slugify(name)
        .trim_matches(|c| c == '_' || c == '-')
        .chars()
        .take(MAX_SLUG_CHARS)
        .collect()
}

fn slugify(name: &str) -> String {
    let mut latin = String::with_capacity(name.len());
    for c in name.chars() {
        let lower = c.to_lowercase().next().unwrap_or(c);
        match transliterate(lower) {
            Some(s) => latin.push_str(s),
            None => latin.extend(c.to_lowercase()),
        }
    }

    let invalid = Regex::new(r"[^a-z0-9\s_-]").expect("static pattern");
    let separators = Regex::new(r"[\s_-]+").expect("static pattern");

    let cleaned = invalid.replace_all(&latin, "");
    separators.replace_all(&cleaned, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_transliterates_cyrillic() {
        assert_eq!(sanitize_filename("Глава первая: Крым, 1920"), "glava_pervaya_krym_1920");
        assert_eq!(sanitize_filename("Щит и меч"), "schit_i_mech");
        assert_eq!(sanitize_filename("  --  "), "");
        assert_eq!(sanitize_filename(&"я".repeat(80)).len(), 50);
    }

    #[test]
    fn dir_names_trim_before_truncating() {
        let title = format!("-- {}", "я".repeat(60));
        assert_eq!(sanitize_filename(&title).len(), 49);
        assert_eq!(sanitize_dir_name(&title), "ya".repeat(25));

        let edge = format!("{} b", "a".repeat(49));
        assert_eq!(sanitize_filename(&edge), "a".repeat(49));
        assert_eq!(sanitize_dir_name(&edge), format!("{}_", "a".repeat(49)));
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["out.txt".to_string()]);
    }

    #[test]
    fn cleanup_removes_only_temp_files() {
        let dir = TempDir::new().unwrap();
        let parts = dir.path().join("parts");
        fs::create_dir_all(&parts).unwrap();
        fs::write(dir.path().join("chapter_01_x.tmp.mp3"), b"partial").unwrap();
        fs::write(parts.join(".tmpAbC123"), b"partial").unwrap();
        fs::write(parts.join("chapter_01_part_001_of_002_x.mp3"), b"keep").unwrap();

        assert_eq!(cleanup_temp_files(dir.path()).unwrap(), 2);
        assert!(parts.join("chapter_01_part_001_of_002_x.mp3").exists());
    }

    #[test]
    fn verify_rejects_small_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let small = dir.path().join("small.mp3");
        let html = dir.path().join("page.mp3");
        let good = dir.path().join("good.mp3");
        fs::write(&small, b"ID3").unwrap();
        fs::write(&html, [b"<html>".as_slice(), &[b' '; 200]].concat()).unwrap();
        fs::write(&good, [b"ID3".as_slice(), &[0u8; 200]].concat()).unwrap();

        assert!(!verify_audio_file(&small, AudioFormat::Mp3));
        assert!(!verify_audio_file(&html, AudioFormat::Mp3));
        assert!(verify_audio_file(&good, AudioFormat::Mp3));
        assert!(!verify_audio_file(&dir.path().join("missing.mp3"), AudioFormat::Mp3));
    }
}
