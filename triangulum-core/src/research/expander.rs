//! Search fan-out over subquestions with domain-diversity capping.

use crate::config::SearchConfig;
use crate::research::planner::query_terms;
use crate::web::{SearchBackend, SearchHit, domain_of};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A ranked search result, unique per URL within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCandidate {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub score: f64,
    /// Subquestion whose search produced this candidate.
    pub subquestion: String,
}

/// A search call that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFailure {
    pub subquestion: String,
    pub message: String,
}

/// Result of one expansion pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchExpansion {
    pub candidates: Vec<SearchCandidate>,
    pub failures: Vec<SearchFailure>,
    /// Subquestions actually sent to the backend.
    pub searched: Vec<String>,
    pub cancelled: bool,
}

/// Selection bookkeeping shared by every expansion pass of a run.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    seen_urls: HashSet<String>,
    domain_counts: HashMap<String, usize>,
    total: usize,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn domain_count(&self, domain: &str) -> usize {
        self.domain_counts.get(domain).copied().unwrap_or(0)
    }
}

/// Issues one search per subquestion and keeps a capped, diverse selection.
pub struct SearchExpander {
    backend: Arc<dyn SearchBackend>,
    config: SearchConfig,
}

impl SearchExpander {
    pub fn new(backend: Arc<dyn SearchBackend>, config: SearchConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Expand `subquestions` from a fresh selection state.
    pub async fn expand(
        &self,
        subquestions: &[String],
        cancel: &CancellationToken,
    ) -> SearchExpansion {
        let mut state = SelectionState::new();
        self.expand_with(subquestions, &mut state, cancel).await
    }

    /// Expand `subquestions`, honouring caps already consumed in `state`.
    ///
    /// Subquestions are processed sequentially, in order; the output keeps
    /// that order and score order within each subquestion.
    pub async fn expand_with(
        &self,
        subquestions: &[String],
        state: &mut SelectionState,
        cancel: &CancellationToken,
    ) -> SearchExpansion {
        let mut out = SearchExpansion::default();

        for subquestion in subquestions {
            if state.total >= self.config.max_total {
                debug!(max_total = self.config.max_total, "search total reached");
                break;
            }
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }

            out.searched.push(subquestion.clone());
            let hits = match self.backend.query(subquestion).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(
                        subquestion = %subquestion,
                        backend = self.backend.name(),
                        error = %e,
                        "search failed"
                    );
                    out.failures.push(SearchFailure {
                        subquestion: subquestion.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let selected = self.select(subquestion, hits, state);
            debug!(subquestion = %subquestion, selected = selected.len(), "search expanded");
            out.candidates.extend(selected);
        }

        out
    }

    /// Pick hits one at a time by overlap plus a diversity bonus that shrinks
    /// as each domain gains selections, re-ranking after every pick.
    fn select(
        &self,
        subquestion: &str,
        hits: Vec<SearchHit>,
        state: &mut SelectionState,
    ) -> Vec<SearchCandidate> {
        let terms = query_terms(subquestion, self.config.min_term_len);

        let mut pool: Vec<(SearchHit, String, f64)> = hits
            .into_iter()
            .filter_map(|hit| {
                let domain = domain_of(&hit.url)?;
                let overlap = overlap_score(&terms, &hit);
                Some((hit, domain, overlap))
            })
            .collect();

        let mut picked = Vec::new();
        while picked.len() < self.config.max_per_subquestion
            && state.total < self.config.max_total
        {
            pool.retain(|(hit, domain, _)| {
                !state.seen_urls.contains(&hit.url)
                    && state.domain_count(domain) < self.config.max_per_domain
            });

            // Earliest hit wins ties.
            let mut best: Option<(usize, f64)> = None;
            for (idx, (_, domain, overlap)) in pool.iter().enumerate() {
                let score = overlap
                    + self.config.diversity_bonus / (1.0 + state.domain_count(domain) as f64);
                if best.is_none_or(|(_, top)| score > top) {
                    best = Some((idx, score));
                }
            }
            let Some((idx, score)) = best else {
                break;
            };

            let (hit, domain, _) = pool.remove(idx);
            state.seen_urls.insert(hit.url.clone());
            *state.domain_counts.entry(domain).or_insert(0) += 1;
            state.total += 1;
            picked.push(SearchCandidate {
                title: hit.title,
                url: hit.url,
                snippet: hit.snippet,
                score,
                subquestion: subquestion.to_string(),
            });
        }
        picked
    }
}

/// Number of `terms` present as whole words in the hit's title and snippet.
fn overlap_score(terms: &[String], hit: &SearchHit) -> f64 {
    let text = format!("{} {}", hit.title, hit.snippet).to_lowercase();
    let words: HashSet<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    terms.iter().filter(|t| words.contains(t.as_str())).count() as f64
}
