//! Extraction collaborator: fetches a chapter's raw bytes and works out which
//! encoding they are in.
//!
//! Web chapters may be split over several pages. The content region of each
//! page is searched for a "next page" link in the same directory, and those
//! pages are appended to the chapter, up to [`MAX_PAGES`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use log::{debug, info, warn};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::book::ChapterRef;
use crate::config::Config;
use crate::error::ExtractionError;

/// Most pages followed for a single chapter.
pub const MAX_PAGES: usize = 50;

/// Pause between continuation page requests.
const PAGE_DELAY: Duration = Duration::from_millis(300);

/// Main text block on militera-style pages.
pub const CONTENT_SELECTOR: &str = "div.b";

#[derive(Debug, Clone)]
pub struct RawChapter {
    /// Every fetched page in order, separated by a newline.
    pub bytes: Vec<u8>,
    /// Declared or sniffed encoding label.
    pub encoding: String,
    pub title: String,
}

#[async_trait]
pub trait ChapterSource: Send + Sync {
    async fn fetch(&self, chapter: &ChapterRef) -> Result<RawChapter, ExtractionError>;
}

/// Fetches `http(s)://` sources over the network and reads anything else
/// from the local filesystem.
pub struct DefaultChapterSource {
    client: reqwest::Client,
    default_encoding: String,
    /// Chapter URLs from the manifest. A link to one of them starts another
    /// chapter and is never followed as a continuation.
    chapter_urls: HashSet<String>,
}

impl DefaultChapterSource {
    pub fn new(config: &Config) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeouts.fetch())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExtractionError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            default_encoding: config.encoding.default_encoding.clone(),
            chapter_urls: HashSet::new(),
        })
    }

    pub fn with_chapter_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.chapter_urls = urls.into_iter().map(|u| normalize_url(u.as_ref())).collect();
        self
    }

    async fn fetch_http(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ExtractionError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7")
            .send()
            .await
            .map_err(|e| classify_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let charset = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_from_content_type);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest(url, e))?;
        Ok((bytes.to_vec(), charset))
    }

    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>, ExtractionError> {
        let path = PathBuf::from(path.strip_prefix("file://").unwrap_or(path));
        tokio::fs::read(&path)
            .await
            .map_err(|source| ExtractionError::Io { path, source })
    }

    fn page_encoding(&self, bytes: &[u8], declared: Option<String>) -> String {
        declared
            .or_else(|| sniff_meta_charset(bytes))
            .unwrap_or_else(|| self.default_encoding.clone())
    }

    /// Fetches the chapter's first page and every continuation page after
    /// it. Pages already visited end the walk.
    async fn fetch_pages(&self, chapter: &ChapterRef) -> Result<(Vec<u8>, String), ExtractionError> {
        let mut body = Vec::new();
        let mut encoding = None;
        let mut visited = HashSet::new();
        let mut next = Some(normalize_url(&chapter.source));
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                warn!("Chapter {}: stopping after {} pages", chapter.ordinal, MAX_PAGES);
                break;
            }
            if !visited.insert(url.clone()) {
                debug!("Chapter {}: already visited {}", chapter.ordinal, url);
                break;
            }
            if pages > 0 {
                info!("Chapter {}: following continuation page {}: {}", chapter.ordinal, pages + 1, url);
                tokio::time::sleep(PAGE_DELAY).await;
            }

            let (bytes, declared) = self.fetch_http(&url).await?;
            let page_encoding = self.page_encoding(&bytes, declared);
            next = Url::parse(&url)
                .ok()
                .and_then(|page| continuation_link(&bytes, &page_encoding, &page, &self.chapter_urls))
                .map(String::from);

            if !body.is_empty() {
                body.push(b'\n');
            }
            body.extend_from_slice(&bytes);
            encoding.get_or_insert(page_encoding);
            pages += 1;
        }

        if pages > 1 {
            info!("Chapter {} spans {} pages", chapter.ordinal, pages);
        }
        let encoding = encoding.unwrap_or_else(|| self.default_encoding.clone());
        Ok((body, encoding))
    }
}

#[async_trait]
impl ChapterSource for DefaultChapterSource {
    async fn fetch(&self, chapter: &ChapterRef) -> Result<RawChapter, ExtractionError> {
        let is_http = chapter.source.starts_with("http://") || chapter.source.starts_with("https://");
        let (bytes, encoding) = if is_http {
            self.fetch_pages(chapter).await?
        } else {
            let bytes = self.fetch_file(&chapter.source).await?;
            let encoding = self.page_encoding(&bytes, None);
            (bytes, encoding)
        };
        let title = extract_title(&bytes, &encoding).unwrap_or_else(|| chapter.title.clone());

        debug!(
            "Fetched chapter {} from {} ({} bytes, {})",
            chapter.ordinal,
            chapter.source,
            bytes.len(),
            encoding
        );
        Ok(RawChapter {
            bytes,
            encoding,
            title,
        })
    }
}

fn normalize_url(url: &str) -> String {
    Url::parse(url).map(String::from).unwrap_or_else(|_| url.to_string())
}

fn continuation_link(bytes: &[u8], encoding: &str, page: &Url, chapter_urls: &HashSet<String>) -> Option<Url> {
    let encoding = Encoding::for_label(encoding.as_bytes()).unwrap_or(encoding_rs::WINDOWS_1251);
    let (html, _, _) = encoding.decode(bytes);
    next_page_link(&html, page, chapter_urls)
}

/// The page's content region: the first [`CONTENT_SELECTOR`] block, else
/// `<body>`.
fn content_region(document: &Html) -> Option<ElementRef<'_>> {
    let content = Selector::parse(CONTENT_SELECTOR).expect("static selector");
    let body = Selector::parse("body").expect("static selector");
    let region = document.select(&content).next();
    region.or_else(|| document.select(&body).next())
}

/// First link in the content region that reads like "next page" and points
/// to another page in the same directory. External, anchor, mail, image and
/// index links are ignored, as are links to other chapters.
pub fn next_page_link(html: &str, page: &Url, chapter_urls: &HashSet<String>) -> Option<Url> {
    let skip = Regex::new(r"(?i)^(?:index\.html$|app\.html$|#|mailto:|https?://)|\.(?:jpg|png|gif)$")
        .expect("static pattern");
    let label = Regex::new(r"(?i)дальше|далее|продолжение|след\.?|следующ|вперед|>>|→").expect("static pattern");
    let links = Selector::parse("a[href]").expect("static selector");

    let document = Html::parse_document(html);
    let region = content_region(&document)?;
    let next = region.select(&links).find_map(|link| {
        let href = link.value().attr("href")?.trim();
        if href.is_empty() || skip.is_match(href) {
            return None;
        }
        let target = page.join(href).ok()?;
        if target == *page || chapter_urls.contains(target.as_str()) {
            return None;
        }
        let text = link.text().collect::<String>().to_lowercase();
        (label.is_match(text.trim()) && same_directory(page, &target)).then_some(target)
    });
    next
}

fn same_directory(a: &Url, b: &Url) -> bool {
    let dir = |url: &Url| url.path().rsplit_once('/').map(|(dir, _)| dir.to_string());
    a.origin() == b.origin() && dir(a) == dir(b)
}

fn classify_reqwest(url: &str, error: reqwest::Error) -> ExtractionError {
    if error.is_timeout() {
        ExtractionError::Timeout { url: url.to_string() }
    } else if let Some(status) = error.status() {
        ExtractionError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        }
    } else {
        ExtractionError::Network {
            url: url.to_string(),
            message: error.to_string(),
        }
    }
}

pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| {
            let (key, value) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_string())
        })
        .filter(|label| !label.is_empty())
}

/// Reads `<meta charset=...>` or the `http-equiv` form from the first 4 KiB.
pub fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(4096)];
    let meta = BytesRegex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_\-:.]+)"#)
        .expect("static pattern");
    let caps = meta.captures(head)?;
    let label = String::from_utf8_lossy(caps.get(1)?.as_bytes()).to_string();
    Encoding::for_label(label.as_bytes()).map(|_| label)
}

/// Title from `<title>` or the first `<h1>`..`<h3>`, decoded with `encoding`.
pub fn extract_title(bytes: &[u8], encoding: &str) -> Option<String> {
    let encoding = Encoding::for_label(encoding.as_bytes())?;
    let (text, _, _) = encoding.decode(bytes);

    let patterns = [
        r"(?is)<h[1-3][^>]*>(.*?)</h[1-3]>",
        r"(?is)<title[^>]*>(.*?)</title>",
    ];
    let tags = Regex::new(r"<[^>]+>").expect("static pattern");
    let spaces = Regex::new(r"\s+").expect("static pattern");

    patterns.iter().find_map(|pattern| {
        let re = Regex::new(pattern).expect("static pattern");
        let inner = re.captures(&text)?.get(1)?.as_str();
        let plain = tags.replace_all(inner, " ");
        let title = spaces.replace_all(&plain, " ").trim().to_string();
        (!title.is_empty()).then_some(title)
    })
}
