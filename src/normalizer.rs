//! Turns raw chapter bytes into clean, speakable plain text.

use encoding_rs::Encoding;
use html2text::render::text_renderer::TrivialDecorator;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::config::EncodingConfig;
use crate::error::EncodingError;
use crate::source::CONTENT_SELECTOR;

const REPLACEMENT: char = '\u{FFFD}';

/// Wide enough that html2text never wraps a paragraph.
const RENDER_WIDTH: usize = 10_000;

pub struct TextNormalizer {
    markup_patterns: Vec<(Regex, &'static str)>,
    speech_patterns: Vec<(Regex, &'static str)>,
    html_detector: Regex,
    whitespace: Regex,
    space_before_punct: Regex,
    leading_junk: Regex,
    title_number: Regex,
    max_replacement_ratio: f64,
}

impl TextNormalizer {
    pub fn new(config: &EncodingConfig) -> Self {
        let re = |p: &str| Regex::new(p).expect("static pattern");

        let markup_patterns = vec![
            // Markdown headers and horizontal rules
            (re(r"(?m)^[ \t]*#+[ \t]*"), ""),
            (re(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$"), ""),
            // Images go entirely, links keep their visible text
            (re(r"!\[[^\]]*\]\([^)]*\)"), ""),
            (re(r"\[([^\]]+)\]\([^)]*\)"), "${1}"),
            // Bold before italic
            (re(r"\*\*([^*]+)\*\*"), "${1}"),
            (re(r"__([^_]+)__"), "${1}"),
            (re(r"\*([^*\n]+)\*"), "${1}"),
            (re(r"_([^_\n]+)_"), "${1}"),
            // Leftover tags and entities
            (re(r"<[^>]+>"), ""),
            (re(r"&[a-zA-Z0-9#]+;"), " "),
            // Page, footnote and reference markers: [12], {3}, [iv], [a], [*]
            (re(r"\[\d+\]"), ""),
            (re(r"\{\d+\}"), ""),
            (re(r"(?i)\[[ivxlcdm]+\]"), ""),
            (re(r"(?i)\[[a-z]\]"), ""),
            (re(r"\[\*+\]"), ""),
        ];

        let speech_patterns = vec![
            // Em-dash before punctuation collapses into the punctuation
            (re(r"\s*—\s*([,.!?;:])"), "${1}"),
            // Dialogue dash before a quote
            (re(r#"—\s*(["«])"#), "${1}"),
            (re(r"\s*—\s*"), ", "),
            (re(r"(\w)–(\w)"), "${1}-${2}"),
            (re(r"[«»„“”]"), "\""),
            (re(r"[‘’]"), "'"),
            (re(r"\.{4,}"), "..."),
            (re(r",(?:\s*,)+"), ","),
            (re(r",\s*\."), "."),
            // Sentence start that began with a dialogue dash
            (re(r"([.!?])\s*,\s*"), "${1} "),
        ];

        Self {
            markup_patterns,
            speech_patterns,
            html_detector: re(r"(?i)<(?:html|body|p|div|br|h[1-6]|span|table)\b"),
            whitespace: re(r"\s+"),
            space_before_punct: re(r" +([,.!?;:])"),
            leading_junk: re(r"^[#,\s]+"),
            title_number: re(r"^\d+\.\s*"),
            max_replacement_ratio: config.max_replacement_ratio,
        }
    }

    /// Decodes `bytes` as `label`. A byte-order mark overrides the label.
    pub fn decode(&self, bytes: &[u8], label: &str) -> Result<String, EncodingError> {
        let (encoding, body) = match Encoding::for_bom(bytes) {
            Some((encoding, bom_len)) => (encoding, &bytes[bom_len..]),
            None => {
                let encoding = Encoding::for_label(label.trim().as_bytes())
                    .ok_or_else(|| EncodingError::UnknownLabel(label.to_string()))?;
                (encoding, bytes)
            }
        };

        let (text, _had_errors) = encoding.decode_without_bom_handling(body);
        let total = text.chars().count();
        if total > 0 {
            let replaced = text.chars().filter(|&c| c == REPLACEMENT).count();
            let ratio = replaced as f64 / total as f64;
            if ratio > self.max_replacement_ratio {
                return Err(EncodingError::TooManyReplacements {
                    encoding: encoding.name().to_string(),
                    ratio: ratio * 100.0,
                });
            }
        }
        Ok(text.into_owned())
    }

    /// Tries `declared` first and then each fallback. Returns the text and the
    /// encoding that worked, or the error of the last attempt.
    pub fn decode_with_fallbacks(
        &self,
        bytes: &[u8],
        declared: &str,
        fallbacks: &[String],
    ) -> Result<(String, String), EncodingError> {
        let mut last_error = None;
        let candidates = std::iter::once(declared).chain(fallbacks.iter().map(String::as_str));
        for label in candidates {
            match self.decode(bytes, label) {
                Ok(text) => return Ok((text, label.to_string())),
                Err(e) => {
                    log::debug!("Decoding as {} failed: {}", label, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| EncodingError::UnknownLabel(declared.to_string())))
    }

    /// Strips markup and normalises punctuation and whitespace. HTML input is
    /// reduced to its content regions first.
    pub fn clean(&self, text: &str) -> String {
        let mut cleaned = if self.html_detector.is_match(text) {
            extract_content(text)
        } else {
            text.to_string()
        };

        for (regex, replacement) in &self.markup_patterns {
            cleaned = regex.replace_all(&cleaned, *replacement).into_owned();
        }
        for (regex, replacement) in &self.speech_patterns {
            cleaned = regex.replace_all(&cleaned, *replacement).into_owned();
        }

        let collapsed = self.whitespace.replace_all(&cleaned, " ");
        let tightened = self.space_before_punct.replace_all(collapsed.trim(), "${1}");
        self.leading_junk.replace(&tightened, "").trim().to_string()
    }

    pub fn normalize(&self, bytes: &[u8], label: &str) -> Result<String, EncodingError> {
        Ok(self.clean(&self.decode(bytes, label)?))
    }

    /// Prefixes the spoken chapter announcement, e.g. `Глава 3. Крым.`
    pub fn announce(&self, ordinal: usize, title: &str, body: &str) -> String {
        let cleaned_title = self.clean(title);
        let title = self.title_number.replace(&cleaned_title, "");
        let title = title.trim();

        let announcement = if title.is_empty() {
            format!("Глава {ordinal}.")
        } else if title.ends_with(['.', '!', '?']) {
            format!("Глава {ordinal}. {title}")
        } else {
            format!("Глава {ordinal}. {title}.")
        };

        if body.is_empty() {
            announcement
        } else {
            format!("{announcement} {body}")
        }
    }
}

/// Heading and paragraphs of every content region (all [`CONTENT_SELECTOR`]
/// blocks, else `<body>`), one per line. Continuation pages repeat the
/// heading, so only the first region contributes one. A region without
/// paragraphs is rendered whole.
fn extract_content(html: &str) -> String {
    let selector = |s: &str| Selector::parse(s).expect("static selector");
    let (content, body) = (selector(CONTENT_SELECTOR), selector("body"));
    let (heading, paragraph, link) = (selector("h1, h2, h3, h4"), selector("p"), selector("a"));

    let document = Html::parse_document(html);
    let mut regions: Vec<ElementRef> = document.select(&content).collect();
    if regions.is_empty() {
        regions.extend(document.select(&body));
    }

    let mut parts: Vec<String> = Vec::new();
    for (position, region) in regions.iter().enumerate() {
        let paragraphs: Vec<String> = region
            .select(&paragraph)
            .filter(|p| !is_navigation(p, &link))
            .map(|p| p.text().collect::<String>())
            .filter(|text| !text.trim().is_empty())
            .collect();

        if paragraphs.is_empty() {
            parts.push(html2text::from_read_with_decorator(
                region.html().as_bytes(),
                RENDER_WIDTH,
                TrivialDecorator::new(),
            ));
            continue;
        }
        if position == 0 {
            if let Some(h) = region.select(&heading).next() {
                parts.push(h.text().collect());
            }
        }
        parts.extend(paragraphs);
    }
    parts.join("\n\n")
}

/// A paragraph whose only text is link labels, like "Далее".
fn is_navigation(paragraph: &ElementRef, link: &Selector) -> bool {
    let squash = |s: String| s.split_whitespace().collect::<String>();
    let links = squash(paragraph.select(link).flat_map(|a| a.text()).collect());
    !links.is_empty() && links == squash(paragraph.text().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> TextNormalizer {
        TextNormalizer::new(&EncodingConfig::default())
    }

    #[test]
    fn strips_markdown_keeping_link_text() {
        assert_eq!(normalizer().clean("## Title\n**bold** [text](url)"), "Title bold text");
    }

    #[test]
    fn removes_images_rules_and_markers() {
        let input = "Start ![map](img/map.png) here[12].\n\n---\n\nNext{3} line [iv] *done*!";
        assert_eq!(normalizer().clean(input), "Start here. Next line done!");
    }

    #[test]
    fn keeps_sentence_punctuation_and_collapses_whitespace() {
        let input = "Он пришёл .  Кто там ?\n\n\tНикого !";
        assert_eq!(normalizer().clean(input), "Он пришёл. Кто там? Никого!");
    }

    #[test]
    fn normalises_quotes_and_dashes() {
        let cleaned = normalizer().clean("Он сказал «да» — и ушёл....");
        assert_eq!(cleaned, "Он сказал \"да\", и ушёл...");
    }

    #[test]
    fn renders_html_documents() {
        let html = "<html><body><h1>Глава</h1><p>Первый абзац.</p><p>Второй <b>абзац</b>.</p></body></html>";
        let cleaned = normalizer().clean(html);
        assert!(cleaned.contains("Первый абзац."), "{cleaned}");
        assert!(cleaned.contains("Второй абзац."), "{cleaned}");
        assert!(!cleaned.contains('<'));
        assert!(!cleaned.contains('#'));
    }

    #[test]
    fn keeps_only_the_content_region() {
        let html = r#"<html><head><title>Военная литература</title></head><body>
            <div class="nav"><a href="/">Военная литература</a> [Мемуары]</div>
            <div class="b">
              <h3>Глава первая</h3>
              <p>Текст главы.
              <p>Второй абзац[5].
              <p><a href="01a.html">Далее</a>
            </div>
            <div class="footer"><p>Библиотека</p><p>Адрес: militera.lib.ru</p></div>
            </body></html>"#;
        assert_eq!(normalizer().clean(html), "Глава первая Текст главы. Второй абзац.");
    }

    #[test]
    fn continuation_pages_do_not_repeat_the_heading() {
        let pages = [
            r#"<html><body><div class="b"><h3>Глава 2</h3><p>Начало.</p></div></body></html>"#,
            r#"<html><body><div class="b"><h3>Глава 2</h3><p>Продолжение.</p></div></body></html>"#,
        ]
        .join("\n");
        assert_eq!(normalizer().clean(&pages), "Глава 2 Начало. Продолжение.");
    }

    #[test]
    fn decodes_cp1251_and_rejects_wrong_guess() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode("Привет, мир.");
        let n = normalizer();
        assert_eq!(n.decode(&bytes, "windows-1251").unwrap(), "Привет, мир.");
        assert!(matches!(
            n.decode(&bytes, "utf-8"),
            Err(EncodingError::TooManyReplacements { .. })
        ));
        assert!(matches!(n.decode(&bytes, "no-such"), Err(EncodingError::UnknownLabel(_))));
    }

    #[test]
    fn falls_back_to_next_encoding() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode("Текст главы.");
        let fallbacks = vec!["windows-1251".to_string()];
        let (text, used) = normalizer().decode_with_fallbacks(&bytes, "utf-8", &fallbacks).unwrap();
        assert_eq!(text, "Текст главы.");
        assert_eq!(used, "windows-1251");
    }

    #[test]
    fn bom_overrides_declared_label() {
        let bytes = [&[0xEF, 0xBB, 0xBF][..], "Ёж".as_bytes()].concat();
        assert_eq!(normalizer().decode(&bytes, "windows-1251").unwrap(), "Ёж");
    }

    #[test]
    fn normalize_is_deterministic() {
        let (bytes, _, _) = encoding_rs::WINDOWS_1251.encode("# Заголовок\n\n*Текст* — здесь.");
        let n = normalizer();
        let first = n.normalize(&bytes, "windows-1251").unwrap();
        assert_eq!(first, n.normalize(&bytes, "windows-1251").unwrap());
        assert_eq!(first, "Заголовок Текст, здесь.");
    }

    #[test]
    fn announcement_drops_leading_number() {
        let n = normalizer();
        assert_eq!(n.announce(3, "3. Крым", "Текст."), "Глава 3. Крым. Текст.");
        assert_eq!(n.announce(1, "", "Текст."), "Глава 1. Текст.");
        assert_eq!(n.announce(2, "Что делать?", ""), "Глава 2. Что делать?");
    }
}
