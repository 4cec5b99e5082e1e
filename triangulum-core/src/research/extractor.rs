//! Fetching candidates and extracting atomic facts and quotes.
//!
//! Fetches run concurrently up to a small worker bound but results keep
//! candidate order. Every per-document failure, including timeouts, is
//! recorded and contributes nothing.

use crate::brain::{ChatModel, json_span};
use crate::config::ExtractionConfig;
use crate::error::FetchError;
use crate::research::expander::SearchCandidate;
use crate::research::planner::query_terms;
use crate::types::Message;
use crate::web::{FetchedPage, WebFetcher, domain_of, truncate_chars};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum length of a quoted span worth keeping.
const MIN_QUOTE_CHARS: usize = 20;
/// Sentences outside this length range are not considered facts.
const MIN_FACT_CHARS: usize = 25;
const MAX_FACT_CHARS: usize = 400;

/// Facts and quotes pulled from a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub facts: Vec<String>,
    #[serde(default)]
    pub quotes: Vec<String>,
}

impl ExtractedDocument {
    pub fn domain(&self) -> Option<String> {
        domain_of(&self.url)
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.quotes.is_empty()
    }
}

/// Raw output of a fact extraction strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExtractedFacts {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub quotes: Vec<String>,
}

/// A strategy turning page text into facts and quotes.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract_facts(
        &self,
        query: &str,
        page: &FetchedPage,
        cancel: &CancellationToken,
    ) -> ExtractedFacts;
}

/// Sentence-ranking extractor with no model dependency.
#[derive(Debug, Clone)]
pub struct HeuristicFactExtractor {
    max_facts: usize,
    max_quotes: usize,
}

impl HeuristicFactExtractor {
    pub fn new(max_facts: usize, max_quotes: usize) -> Self {
        Self {
            max_facts,
            max_quotes,
        }
    }

    /// Rank sentences by query-term overlap, keep the best in document order.
    pub fn extract(&self, query: &str, text: &str) -> ExtractedFacts {
        let terms = query_terms(query, 3);
        let sentences = split_sentences(text);

        let mut ranked: Vec<(usize, usize)> = sentences
            .iter()
            .enumerate()
            .map(|(idx, s)| {
                let lower = s.to_lowercase();
                let words: Vec<&str> = lower
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .collect();
                let hits = terms.iter().filter(|t| words.contains(&t.as_str())).count();
                (idx, hits)
            })
            .filter(|(_, hits)| terms.is_empty() || *hits > 0)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.max_facts);
        ranked.sort_by_key(|(idx, _)| *idx);

        ExtractedFacts {
            facts: ranked.into_iter().map(|(idx, _)| sentences[idx].clone()).collect(),
            quotes: extract_quotes(text, self.max_quotes),
        }
    }
}

impl Default for HeuristicFactExtractor {
    fn default() -> Self {
        let config = ExtractionConfig::default();
        Self::new(config.max_facts, config.max_quotes)
    }
}

#[async_trait]
impl FactExtractor for HeuristicFactExtractor {
    async fn extract_facts(
        &self,
        query: &str,
        page: &FetchedPage,
        _cancel: &CancellationToken,
    ) -> ExtractedFacts {
        self.extract(query, &page.text)
    }
}

/// Model-driven extractor falling back to [`HeuristicFactExtractor`].
pub struct ModelFactExtractor {
    model: Arc<dyn ChatModel>,
    fallback: HeuristicFactExtractor,
    max_facts: usize,
    max_quotes: usize,
}

impl ModelFactExtractor {
    pub fn new(model: Arc<dyn ChatModel>, max_facts: usize, max_quotes: usize) -> Self {
        Self {
            model,
            fallback: HeuristicFactExtractor::new(max_facts, max_quotes),
            max_facts,
            max_quotes,
        }
    }

    fn prompt(&self, query: &str, page: &FetchedPage) -> [Message; 2] {
        [
            Message::system(format!(
                "Extract up to {} short, self-contained factual statements and up to {} verbatim \
                 quotes relevant to the question. Reply with JSON only: \
                 {{\"facts\": [string], \"quotes\": [string]}}",
                self.max_facts, self.max_quotes
            )),
            Message::user(format!(
                "Question: {query}\nSource: {}\n\n{}",
                page.url, page.text
            )),
        ]
    }
}

#[async_trait]
impl FactExtractor for ModelFactExtractor {
    async fn extract_facts(
        &self,
        query: &str,
        page: &FetchedPage,
        cancel: &CancellationToken,
    ) -> ExtractedFacts {
        let messages = self.prompt(query, page);
        let parsed = match self.model.invoke(&messages, cancel).await {
            Ok(reply) => json_span(&reply, '{', '}')
                .and_then(|span| serde_json::from_str::<ExtractedFacts>(span).ok()),
            Err(e) => {
                debug!(url = %page.url, error = %e, "model extraction failed");
                None
            }
        };
        match parsed {
            Some(facts) if !facts.facts.is_empty() || !facts.quotes.is_empty() => facts,
            _ => {
                debug!(url = %page.url, "falling back to heuristic extraction");
                self.fallback.extract(query, &page.text)
            }
        }
    }
}

/// A candidate that produced no document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub url: String,
    pub message: String,
}

/// Result of an extraction batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionBatch {
    /// Non-empty documents in candidate order.
    pub documents: Vec<ExtractedDocument>,
    pub failures: Vec<ExtractionFailure>,
    /// URLs of candidates that were attempted (successfully or not).
    pub attempted: Vec<String>,
    pub cancelled: bool,
}

enum DocOutcome {
    Document(ExtractedDocument),
    Empty,
    Failed(String),
    Skipped,
}

/// Fetches a bounded candidate subset and extracts facts from each.
pub struct ContentExtractor {
    fetcher: Arc<dyn WebFetcher>,
    facts: Arc<dyn FactExtractor>,
    config: ExtractionConfig,
}

impl ContentExtractor {
    pub fn new(
        fetcher: Arc<dyn WebFetcher>,
        facts: Arc<dyn FactExtractor>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            fetcher,
            facts,
            config,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract from at most `max_candidates` of `candidates`.
    ///
    /// Cancellation is checked before each fetch; documents already
    /// completed are returned.
    pub async fn extract(
        &self,
        candidates: &[SearchCandidate],
        query: &str,
        cancel: &CancellationToken,
    ) -> ExtractionBatch {
        // Owned items keep the per-candidate futures free of higher-ranked
        // borrows, so a run can be driven from `tokio::spawn`.
        let subset: Vec<SearchCandidate> = candidates
            .iter()
            .take(self.config.max_candidates)
            .cloned()
            .collect();
        let outcomes: Vec<(String, DocOutcome)> = stream::iter(subset)
            .map(|candidate| async move {
                let outcome = self.process(&candidate, query, cancel).await;
                (candidate.url, outcome)
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut batch = ExtractionBatch::default();
        for (url, outcome) in outcomes {
            match outcome {
                DocOutcome::Document(doc) => {
                    batch.attempted.push(url);
                    batch.documents.push(doc);
                }
                DocOutcome::Empty => {
                    debug!(url = %url, "document yielded nothing");
                    batch.attempted.push(url);
                }
                DocOutcome::Failed(message) => {
                    batch.attempted.push(url.clone());
                    batch.failures.push(ExtractionFailure { url, message });
                }
                DocOutcome::Skipped => batch.cancelled = true,
            }
        }
        batch
    }

    async fn process(
        &self,
        candidate: &SearchCandidate,
        query: &str,
        cancel: &CancellationToken,
    ) -> DocOutcome {
        if cancel.is_cancelled() {
            return DocOutcome::Skipped;
        }

        let timeout_secs = self.config.fetch_timeout_secs;
        let fetched = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.fetcher.fetch(&candidate.url),
        )
        .await
        .unwrap_or_else(|_| {
            Err(FetchError::Timeout {
                url: candidate.url.clone(),
                timeout_secs,
            })
        });

        let mut page = match fetched {
            Ok(page) => page,
            Err(e) => {
                warn!(url = %candidate.url, error = %e, "fetch failed");
                return DocOutcome::Failed(e.to_string());
            }
        };
        page.text = truncate_chars(&page.text, self.config.max_content_chars);

        let extracted = self.facts.extract_facts(query, &page, cancel).await;
        let facts = clean(extracted.facts, self.config.max_facts);
        let quotes = clean(extracted.quotes, self.config.max_quotes);

        let title = page
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| Some(candidate.title.clone()).filter(|t| !t.trim().is_empty()));

        let doc = ExtractedDocument {
            url: candidate.url.clone(),
            title,
            facts,
            quotes,
        };
        if doc.is_empty() {
            DocOutcome::Empty
        } else {
            DocOutcome::Document(doc)
        }
    }
}

/// Trim, drop blanks and cap.
fn clean(items: Vec<String>, max: usize) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(max)
        .collect()
}

/// Split text into candidate fact sentences.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(ch) = chars.next() {
            current.push(ch);
            let boundary = matches!(ch, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace());
            if boundary {
                push_sentence(&mut sentences, &current);
                current.clear();
            }
        }
        push_sentence(&mut sentences, &current);
    }
    sentences
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let sentence = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let len = sentence.chars().count();
    if (MIN_FACT_CHARS..=MAX_FACT_CHARS).contains(&len) {
        out.push(sentence);
    }
}

/// Quoted spans of at least [`MIN_QUOTE_CHARS`] characters.
fn extract_quotes(text: &str, max: usize) -> Vec<String> {
    let mut quotes = Vec::new();
    let mut current: Option<String> = None;
    for ch in text.chars() {
        match (ch, current.as_mut()) {
            ('"' | '\u{201C}', None) => current = Some(String::new()),
            ('"' | '\u{201D}', Some(buf)) => {
                let quote = buf.split_whitespace().collect::<Vec<_>>().join(" ");
                if quote.chars().count() >= MIN_QUOTE_CHARS && !quotes.contains(&quote) {
                    quotes.push(quote);
                }
                current = None;
                if quotes.len() >= max {
                    break;
                }
            }
            (_, Some(buf)) => buf.push(ch),
            _ => {}
        }
    }
    quotes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockChatModel;
    use crate::web::InMemoryFetcher;
    use pretty_assertions::assert_eq;

    const ARTICLE: &str = "Solar panels convert sunlight into electricity using photovoltaic cells. \
        The weather was nice yesterday in the small town. \
        Modern solar panel efficiency reaches about 22 percent in commercial modules. \
        As one researcher put it, \"efficiency gains now come mostly from better materials\".";

    fn candidate(url: &str) -> SearchCandidate {
        SearchCandidate {
            title: format!("Title of {url}"),
            url: url.to_string(),
            snippet: String::new(),
            score: 1.0,
            subquestion: "q".into(),
        }
    }

    fn heuristic_extractor(fetcher: InMemoryFetcher, config: ExtractionConfig) -> ContentExtractor {
        let facts = Arc::new(HeuristicFactExtractor::new(config.max_facts, config.max_quotes));
        ContentExtractor::new(Arc::new(fetcher), facts, config)
    }

    #[test]
    fn test_heuristic_ranks_by_query_terms() {
        let extractor = HeuristicFactExtractor::new(2, 3);
        let out = extractor.extract("solar panel efficiency", ARTICLE);
        assert_eq!(
            out.facts,
            vec![
                "Solar panels convert sunlight into electricity using photovoltaic cells.",
                "Modern solar panel efficiency reaches about 22 percent in commercial modules."
            ]
        );
        assert_eq!(
            out.quotes,
            vec!["efficiency gains now come mostly from better materials"]
        );
    }

    #[test]
    fn test_split_sentences_keeps_decimals() {
        let sentences = split_sentences("Growth was 2.5 percent in the last quarter. Short. ");
        assert_eq!(sentences, vec!["Growth was 2.5 percent in the last quarter."]);
    }

    #[tokio::test]
    async fn test_model_extractor_parses_json() {
        let model = MockChatModel::with_response(
            r#"{"facts": ["Fact one is here.", "Fact two is here."], "quotes": ["a quote"]}"#,
        );
        let extractor = ModelFactExtractor::new(Arc::new(model), 8, 3);
        let page = FetchedPage {
            url: "https://a.com".into(),
            title: None,
            text: ARTICLE.into(),
        };
        let out = extractor
            .extract_facts("solar", &page, &CancellationToken::new())
            .await;
        assert_eq!(out.facts.len(), 2);
        assert_eq!(out.quotes, vec!["a quote"]);
    }

    #[tokio::test]
    async fn test_model_extractor_falls_back() {
        let model = MockChatModel::with_response("not json at all");
        let extractor = ModelFactExtractor::new(Arc::new(model), 8, 3);
        let page = FetchedPage {
            url: "https://a.com".into(),
            title: None,
            text: ARTICLE.into(),
        };
        let out = extractor
            .extract_facts("solar panel efficiency", &page, &CancellationToken::new())
            .await;
        assert!(!out.facts.is_empty());
    }

    #[tokio::test]
    async fn test_extract_keeps_order_and_skips_failures() {
        let fetcher = InMemoryFetcher::new()
            .with_page("https://a.com", Some("A"), ARTICLE)
            .with_page("https://c.com", None, ARTICLE)
            .with_page("https://empty.com", None, "nothing relevant");
        let extractor = heuristic_extractor(fetcher, ExtractionConfig::default());
        let candidates = vec![
            candidate("https://a.com"),
            candidate("https://missing.com"),
            candidate("https://empty.com"),
            candidate("https://c.com"),
        ];
        let batch = extractor
            .extract(&candidates, "solar panel efficiency", &CancellationToken::new())
            .await;

        let urls: Vec<&str> = batch.documents.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.com", "https://c.com"]);
        assert_eq!(batch.documents[0].title.as_deref(), Some("A"));
        assert_eq!(batch.documents[1].title.as_deref(), Some("Title of https://c.com"));
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.attempted.len(), 4);
        assert!(!batch.cancelled);
    }

    #[tokio::test]
    async fn test_extract_caps_candidates_and_facts() {
        let mut fetcher = InMemoryFetcher::new();
        let mut candidates = Vec::new();
        for i in 0..15 {
            let url = format!("https://d{i}.com");
            fetcher = fetcher.with_page(&url, None, ARTICLE);
            candidates.push(candidate(&url));
        }
        let config = ExtractionConfig {
            max_facts: 1,
            ..ExtractionConfig::default()
        };
        let batch = heuristic_extractor(fetcher, config)
            .extract(&candidates, "solar panel efficiency", &CancellationToken::new())
            .await;
        assert_eq!(batch.documents.len(), 12);
        assert!(batch.documents.iter().all(|d| d.facts.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_a_failure() {
        let fetcher = InMemoryFetcher::new()
            .with_page("https://slow.com", None, ARTICLE)
            .with_delay(Duration::from_secs(60));
        let config = ExtractionConfig {
            fetch_timeout_secs: 1,
            ..ExtractionConfig::default()
        };
        let batch = heuristic_extractor(fetcher, config)
            .extract(&[candidate("https://slow.com")], "solar", &CancellationToken::new())
            .await;
        assert!(batch.documents.is_empty());
        assert!(batch.failures[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_batch_fetches_nothing() {
        let fetcher = Arc::new(InMemoryFetcher::new().with_page("https://a.com", None, ARTICLE));
        let extractor = ContentExtractor::new(
            fetcher.clone(),
            Arc::new(HeuristicFactExtractor::default()),
            ExtractionConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = extractor
            .extract(&[candidate("https://a.com")], "solar", &cancel)
            .await;
        assert!(batch.cancelled);
        assert!(batch.documents.is_empty());
        assert_eq!(fetcher.fetch_count(), 0);
    }
}
