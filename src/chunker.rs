//! Splits cleaned chapter text into synthesis-sized chunks on sentence
//! boundaries.
//!
//! Chunks are contiguous slices of the input: concatenating every chunk's
//! text gives back the input exactly, and no chunk exceeds the byte ceiling
//! as long as the ceiling is at least one character wide.

use regex::Regex;
use sha2::{Digest, Sha256};

/// Words after which a period does not end a sentence.
const ABBREVIATIONS: &[&str] = &["г", "гг", "т", "е", "д", "п", "о", "и", "с", "р", "ул", "см", "стр", "им"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based position within the chapter.
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub digest: String,
}

impl TextChunk {
    fn new(index: usize, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self {
            index,
            text: text.to_string(),
            digest: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.text.len()
    }
}

pub struct Chunker {
    max_bytes: usize,
    sentence_end: Regex,
}

impl Chunker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
            sentence_end: Regex::new(r"[.!?]+(?:\s+|$)").expect("static pattern"),
        }
    }

    pub fn split(&self, text: &str) -> Vec<TextChunk> {
        let mut pieces: Vec<&str> = Vec::new();
        let mut start = 0;
        let mut end = 0;

        for sentence in self.sentences(text) {
            if (end - start) + sentence.len() <= self.max_bytes {
                end += sentence.len();
                continue;
            }

            if end > start {
                pieces.push(&text[start..end]);
            }
            start = end;
            end = start + sentence.len();

            if sentence.len() > self.max_bytes {
                let mut parts = self.hard_split(sentence);
                let last = parts.pop().unwrap_or_default();
                pieces.extend(parts);
                start = end - last.len();
            }
        }
        if end > start {
            pieces.push(&text[start..end]);
        }

        pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| TextChunk::new(i + 1, piece))
            .collect()
    }

    /// Sentence slices covering `text` completely; trailing whitespace stays
    /// with the sentence it follows.
    fn sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut start = 0;

        for m in self.sentence_end.find_iter(text) {
            if m.end() < text.len() && self.is_abbreviation(&text[..m.start()], m.as_str(), &text[m.end()..]) {
                continue;
            }
            if m.end() > start {
                sentences.push(&text[start..m.end()]);
                start = m.end();
            }
        }
        if start < text.len() {
            sentences.push(&text[start..]);
        }
        sentences
    }

    fn is_abbreviation(&self, before: &str, terminator: &str, after: &str) -> bool {
        if terminator.trim_end() != "." {
            return false;
        }
        let word: String = before
            .chars()
            .rev()
            .take_while(|c| c.is_alphabetic())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let mut chars = word.chars();
        match (chars.next(), chars.next()) {
            (None, _) => false,
            // Initials such as "А. С. Пушкин". After a lower-case word a lone
            // capital is a sentence end ("план Б. Далее") unless another
            // initial follows.
            (Some(c), None) if c.is_uppercase() => {
                let previous_lowercase = before[..before.len() - word.len()]
                    .split_whitespace()
                    .next_back()
                    .and_then(|w| w.chars().find(|c| c.is_alphabetic()))
                    .is_some_and(char::is_lowercase);
                !previous_lowercase || starts_with_initial(after)
            }
            _ => ABBREVIATIONS.contains(&word.to_lowercase().as_str()),
        }
    }

    /// Splits an oversized sentence at the last whitespace before the
    /// ceiling, falling back to the last character boundary.
    fn hard_split<'a>(&self, sentence: &'a str) -> Vec<&'a str> {
        let mut parts = Vec::new();
        let mut rest = sentence;

        while rest.len() > self.max_bytes {
            let mut limit = self.max_bytes;
            while !rest.is_char_boundary(limit) {
                limit -= 1;
            }
            if limit == 0 {
                // Ceiling narrower than one character: emit the character.
                limit = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
            }

            let window = &rest[..limit];
            let cut = window
                .char_indices()
                .filter(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(limit);

            parts.push(&rest[..cut]);
            rest = &rest[cut..];
        }
        if !rest.is_empty() {
            parts.push(rest);
        }
        parts
    }
}

fn starts_with_initial(text: &str) -> bool {
    let mut chars = text.chars();
    matches!((chars.next(), chars.next()), (Some(c), Some('.')) if c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(chunks: &[TextChunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(Chunker::new(100).split("").is_empty());
    }

    #[test]
    fn groups_sentences_greedily() {
        let text = "One two. Three four! Five six? Seven.";
        let chunks = Chunker::new(20).split(text);

        assert_eq!(
            chunks.iter().map(|c| c.text.as_str()).collect::<Vec<_>>(),
            vec!["One two. ", "Three four! ", "Five six? Seven."]
        );
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(joined(&chunks), text);
    }

    #[test]
    fn long_sentence_splits_at_whitespace() {
        let text = "alpha beta gamma delta epsilon zeta eta theta.";
        let chunks = Chunker::new(16).split(text);

        assert!(chunks.iter().all(|c| c.byte_len() <= 16), "{chunks:?}");
        assert_eq!(joined(&chunks), text);
        assert_eq!(chunks[0].text, "alpha beta ");
    }

    #[test]
    fn unbroken_text_splits_on_char_boundaries() {
        let text = "ж".repeat(25);
        let chunks = Chunker::new(9).split(&text);

        assert!(chunks.iter().all(|c| c.byte_len() <= 9));
        assert_eq!(chunks[0].text.chars().count(), 4);
        assert_eq!(joined(&chunks), text);
    }

    #[test]
    fn cyrillic_byte_ceiling_is_respected() {
        let sentence = "Солдаты шли через перевал всю ночь. ";
        let text = sentence.repeat(200);
        let chunks = Chunker::new(4800).split(&text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.byte_len() <= 4800));
        assert!(chunks.iter().all(|c| c.text.ends_with(". ")));
        assert_eq!(joined(&chunks), text);
    }

    #[test]
    fn abbreviations_and_initials_do_not_end_sentences() {
        let chunker = Chunker::new(1000);
        let sentences = chunker.sentences("В 1920 г. генерал Я. А. Слащов ушёл. Конец.");
        assert_eq!(sentences, vec!["В 1920 г. генерал Я. А. Слащов ушёл. ", "Конец."]);
    }

    #[test]
    fn lone_capital_after_lowercase_word_ends_sentence() {
        let chunker = Chunker::new(1000);
        assert_eq!(
            chunker.sentences("Остался план Б. Далее шли пешком."),
            vec!["Остался план Б. ", "Далее шли пешком."]
        );
        assert_eq!(
            chunker.sentences("Писал А. С. Пушкин. Конец."),
            vec!["Писал А. С. Пушкин. ", "Конец."]
        );
    }

    #[test]
    fn oversized_sentence_continues_into_next_chunk() {
        let text = "aaaa bbbb cccc dddd. ee.";
        let chunks = Chunker::new(10).split(text);
        assert_eq!(joined(&chunks), text);
        assert!(chunks.iter().all(|c| c.byte_len() <= 10), "{chunks:?}");
    }

    #[test]
    fn digests_identify_chunk_text() {
        let chunks = Chunker::new(10).split("Same. Same. Other.");
        assert_eq!(chunks[0].digest.len(), 64);
        assert_ne!(chunks[0].digest, chunks[chunks.len() - 1].digest);
    }
}
