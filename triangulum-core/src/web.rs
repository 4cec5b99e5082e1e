//! Web capabilities: search and fetch.
//!
//! The research pipeline consumes the [`SearchBackend`] and [`WebFetcher`]
//! traits. This module also ships lightweight concrete backends:
//! - `DuckDuckGoSearch`: DuckDuckGo instant answers (no API key required).
//! - `HttpFetcher`: fetch a URL and extract readable text content.
//! - `InMemorySearchBackend` / `InMemoryFetcher`: fixtures for offline runs.

use crate::error::{FetchError, SearchError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// One raw search backend result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

impl SearchHit {
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        snippet: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet: snippet.into(),
        }
    }
}

/// A fetched document reduced to readable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
}

/// A single external search call.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn query(&self, text: &str) -> Result<Vec<SearchHit>, SearchError>;

    fn name(&self) -> &str;
}

/// Per-document retrieval. Callers bound every call with a timeout.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

// ---------------------------------------------------------------------------
// URL helpers
// ---------------------------------------------------------------------------

/// Host of `url`, lowercased with a leading `www.` removed.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Normalise a bare domain or URL into a lookup key.
///
/// Accepts `https://www.Example.com/path`, `Example.com:443`, ` www.example.com `.
/// Returns an empty string when nothing usable remains.
pub fn normalize_domain(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        return domain_of(trimmed).unwrap_or_default();
    }
    let host = trimmed
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .trim_end_matches('.')
        .to_ascii_lowercase();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

// ---------------------------------------------------------------------------
// DuckDuckGoSearch
// ---------------------------------------------------------------------------

/// Search the web using the DuckDuckGo instant answers API.
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    max_results: usize,
}

impl DuckDuckGoSearch {
    pub fn new(timeout: Duration, max_results: usize) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Triangulum/0.3")
            .build()
            .map_err(|e| SearchError::Request {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            max_results,
        })
    }

    fn parse_body(&self, body: &serde_json::Value) -> Vec<SearchHit> {
        let mut hits = Vec::new();

        if let Some(abstract_text) = body.get("AbstractText").and_then(|v| v.as_str())
            && !abstract_text.is_empty()
        {
            let url = body
                .get("AbstractURL")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let title = body
                .get("Heading")
                .and_then(|v| v.as_str())
                .or_else(|| body.get("AbstractSource").and_then(|v| v.as_str()))
                .unwrap_or("");
            if !url.is_empty() {
                hits.push(SearchHit::new(title, url, abstract_text));
            }
        }

        let mut push_topic = |topic: &serde_json::Value, hits: &mut Vec<SearchHit>| {
            let text = topic.get("Text").and_then(|v| v.as_str()).unwrap_or("");
            let url = topic.get("FirstURL").and_then(|v| v.as_str()).unwrap_or("");
            if text.is_empty() || url.is_empty() {
                return;
            }
            let title = text.split(" - ").next().unwrap_or(text);
            hits.push(SearchHit::new(title, url, text));
        };

        for key in ["Results", "RelatedTopics"] {
            if let Some(items) = body.get(key).and_then(|v| v.as_array()) {
                for item in items {
                    // Related topics may nest one level ("Topics" groups).
                    if let Some(nested) = item.get("Topics").and_then(|v| v.as_array()) {
                        for topic in nested {
                            push_topic(topic, &mut hits);
                        }
                    } else {
                        push_topic(item, &mut hits);
                    }
                }
            }
        }

        hits.truncate(self.max_results);
        hits
    }
}

#[async_trait]
impl SearchBackend for DuckDuckGoSearch {
    async fn query(&self, text: &str) -> Result<Vec<SearchHit>, SearchError> {
        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
            urlencoding::encode(text)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SearchError::Request {
                message: format!("Search request failed: {e}"),
            })?;

        let body: serde_json::Value = response.json().await.map_err(|e| SearchError::Parse {
            message: format!("Failed to parse search response: {e}"),
        })?;

        let hits = self.parse_body(&body);
        debug!(query = text, hits = hits.len(), "duckduckgo search");
        Ok(hits)
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// Fetch a URL and extract readable text content.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_chars: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_chars: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Triangulum/0.3")
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client, max_chars })
    }
}

#[async_trait]
impl WebFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| FetchError::Request {
            url: url.to_string(),
            message: format!("Failed to read response body: {e}"),
        })?;

        let (title, text) =
            if content_type.contains("text/html") || content_type.contains("application/xhtml") {
                (extract_title(&body), extract_text_from_html(&body))
            } else {
                (None, body)
            };

        if text.trim().is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }

        Ok(FetchedPage {
            url: url.to_string(),
            title,
            text: truncate_chars(&text, self.max_chars),
        })
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Content of the first `<title>` element, whitespace-collapsed.
fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let open = lower.find("<title")?;
    let start = open + lower[open..].find('>')? + 1;
    let end = start + lower[start..].find("</title>")?;
    let title = decode_entities(&html[start..end]);
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Simple HTML-to-text extraction.
///
/// Strips tags, drops `<script>`/`<style>` bodies and breaks lines on
/// common block elements.
pub fn extract_text_from_html(html: &str) -> String {
    let mut text = String::new();
    let mut in_tag = false;
    let mut in_script = false;
    let mut in_style = false;
    let mut tag_name = String::new();
    let mut building_tag = false;

    for ch in html.chars() {
        if ch == '<' {
            in_tag = true;
            building_tag = true;
            tag_name.clear();
            continue;
        }
        if ch == '>' {
            in_tag = false;
            building_tag = false;

            let tag_lower = tag_name.to_lowercase();
            match tag_lower.as_str() {
                "script" => in_script = true,
                "/script" => in_script = false,
                "style" => in_style = true,
                "/style" => in_style = false,
                _ => {}
            }

            let block = ["p", "/p", "br", "div", "/div", "li", "tr", "/h"]
                .iter()
                .any(|b| tag_lower.starts_with(b))
                || (tag_lower.len() == 2
                    && tag_lower.starts_with('h')
                    && tag_lower[1..].chars().all(|c| c.is_ascii_digit()));
            if block {
                text.push('\n');
            }
            continue;
        }
        if in_tag {
            if building_tag && (ch.is_alphanumeric() || ch == '/') {
                tag_name.push(ch);
            } else {
                building_tag = false;
            }
            continue;
        }
        if in_script || in_style {
            continue;
        }
        text.push(ch);
    }

    let text = decode_entities(&text);

    let mut lines: Vec<&str> = text.lines().map(|l| l.trim()).collect();
    lines.dedup_by(|a, b| a.is_empty() && b.is_empty());
    lines
        .into_iter()
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

/// Search backend answering from a fixed table of query → hits.
#[derive(Default)]
pub struct InMemorySearchBackend {
    results: HashMap<String, Vec<SearchHit>>,
    fallback: Vec<SearchHit>,
    failing: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register hits for an exact query string.
    pub fn with_results(mut self, query: impl Into<String>, hits: Vec<SearchHit>) -> Self {
        self.results.insert(query.into(), hits);
        self
    }

    /// Hits returned for any query without an exact entry.
    pub fn with_fallback(mut self, hits: Vec<SearchHit>) -> Self {
        self.fallback = hits;
        self
    }

    /// Make an exact query string fail.
    pub fn failing_on(mut self, query: impl Into<String>) -> Self {
        self.failing.push(query.into());
        self
    }

    /// Queries received so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn query(&self, text: &str) -> Result<Vec<SearchHit>, SearchError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(text.to_string());
        }
        if self.failing.iter().any(|q| q == text) {
            return Err(SearchError::Request {
                message: format!("fixture failure for '{text}'"),
            });
        }
        Ok(self
            .results
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Fetcher answering from a fixed table of url → page.
#[derive(Default)]
pub struct InMemoryFetcher {
    pages: HashMap<String, FetchedPage>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(
        mut self,
        url: impl Into<String>,
        title: Option<&str>,
        text: impl Into<String>,
    ) -> Self {
        let url = url.into();
        self.pages.insert(
            url.clone(),
            FetchedPage {
                url,
                title: title.map(str::to_string),
                text: text.into(),
            },
        );
        self
    }

    /// Sleep before answering every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of fetches started.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebFetcher for InMemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.pages.get(url).cloned().ok_or_else(|| FetchError::Http {
            url: url.to_string(),
            status: 404,
        })
    }
}
