//! Query reformulation and decomposition into subquestions.
//!
//! The chat model is asked first; every model failure falls back to the
//! structural heuristics in [`heuristic_subquestions`].

use crate::brain::{ChatModel, json_span};
use crate::config::PlannerConfig;
use crate::types::{Message, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "thanks", "thank you", "good morning", "good evening", "yo",
];

/// A research angle covered by quality mode before it may terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Angle {
    Definition,
    Comparison,
    Recency,
    Critique,
}

impl Angle {
    pub fn all() -> [Angle; 4] {
        [
            Angle::Definition,
            Angle::Comparison,
            Angle::Recency,
            Angle::Critique,
        ]
    }
}

impl std::fmt::Display for Angle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Angle::Definition => write!(f, "definition"),
            Angle::Comparison => write!(f, "comparison"),
            Angle::Recency => write!(f, "recency"),
            Angle::Critique => write!(f, "critique"),
        }
    }
}

/// Subquestion phrasing for an angle.
pub fn angle_query(query: &str, angle: Angle) -> String {
    let query = query.trim().trim_end_matches('?');
    match angle {
        Angle::Definition => format!("What is {query}? Key definitions and background"),
        Angle::Comparison => format!("How does {query} compare to alternatives?"),
        Angle::Recency => format!("What are the latest developments on {query}?"),
        Angle::Critique => format!("What are the main criticisms and limitations of {query}?"),
    }
}

/// Wider queries used when the first search round came back thin.
pub fn broaden_queries(query: &str) -> Vec<String> {
    let query = query.trim().trim_end_matches('?');
    vec![
        query.to_string(),
        format!("{query} overview evidence analysis"),
    ]
}

/// Lowercase alphanumeric terms of at least `min_len` characters, deduplicated in order.
pub fn query_terms(text: &str, min_len: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= min_len)
        .filter(|w| seen.insert(w.to_string()))
        .map(String::from)
        .collect()
}

/// Queries too small to be worth researching: greetings or fewer than two content terms.
pub fn is_trivial_query(query: &str) -> bool {
    let lower = query.trim().to_lowercase();
    let bare = lower.trim_end_matches(['!', '.', '?']).trim();
    if GREETINGS.contains(&bare) {
        return true;
    }
    query_terms(query, 3).len() < 2
}

/// Structural decomposition used when no model output is available.
///
/// Always yields the query itself first, then comparative parts, then a
/// practical-steps subquestion for "how" questions.
pub fn heuristic_subquestions(query: &str, max: usize) -> Vec<String> {
    let query = query.trim();
    let mut out = vec![query.to_string()];

    let parts = split_comparative(query);
    if parts.len() > 1 {
        out.extend(parts);
    }

    if query.to_lowercase().starts_with("how") {
        out.push(format!("What are the practical steps for: {query}"));
    }

    finalize(out, query, max)
}

/// Split a comparative question into its constituent parts.
fn split_comparative(question: &str) -> Vec<String> {
    let separators = [" vs ", " vs. ", " versus ", " compared to ", " or "];
    for sep in &separators {
        if question.contains(sep) {
            return question
                .split(sep)
                .map(|s| s.trim().trim_end_matches('?').to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    // Fallback: split on " and " only if it looks like enumeration
    if question.contains(" and ") {
        let parts: Vec<String> = question
            .split(" and ")
            .map(|s| s.trim().trim_end_matches('?').to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() <= 3 {
            return parts;
        }
    }
    vec![question.to_string()]
}

/// Trim, drop blanks, dedupe case-insensitively, cap, never empty.
fn finalize(candidates: Vec<String>, query: &str, max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out: Vec<String> = candidates
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .take(max.max(1))
        .collect();
    if out.is_empty() {
        out.push(query.trim().to_string());
    }
    out
}

/// Model-assisted planner.
pub struct QueryPlanner {
    model: Arc<dyn ChatModel>,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(model: Arc<dyn ChatModel>, config: PlannerConfig) -> Self {
        Self { model, config }
    }

    /// Rewrite a follow-up into a standalone query using the chat history.
    ///
    /// Without history, or on any model failure, the raw query is kept.
    pub async fn reformulate(
        &self,
        query: &str,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> String {
        let query = query.trim();
        if history.is_empty() || cancel.is_cancelled() {
            return query.to_string();
        }

        let transcript: String = history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        let messages = [
            Message::system(
                "Rewrite the user's latest question as a standalone search query. \
                 Reply with the rewritten query only.",
            ),
            Message::user(format!(
                "Conversation:\n{transcript}\nLatest question: {query}"
            )),
        ];

        match self.model.invoke(&messages, cancel).await {
            Ok(reply) => {
                let rewritten = reply.trim().trim_matches('"').trim();
                if rewritten.is_empty() || rewritten.lines().count() > 1 {
                    query.to_string()
                } else {
                    debug!(original = query, rewritten, "query reformulated");
                    rewritten.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "query reformulation failed, keeping raw query");
                query.to_string()
            }
        }
    }

    /// Break the query into at most `max_subquestions` subquestions.
    pub async fn decompose(&self, query: &str, cancel: &CancellationToken) -> Vec<String> {
        let max = self.config.max_subquestions.max(1);
        if !self.config.use_model || cancel.is_cancelled() || is_trivial_query(query) {
            return heuristic_subquestions(query, max);
        }

        let messages = [
            Message::system(format!(
                "Break the research question into at most {max} focused subquestions. \
                 Reply with a JSON array of strings only."
            )),
            Message::user(query.trim()),
        ];

        match self.model.invoke(&messages, cancel).await {
            Ok(reply) => match parse_subquestions(&reply) {
                Some(list) if !list.is_empty() => finalize(list, query, max),
                _ => {
                    debug!("unparsable decomposition reply, using heuristics");
                    heuristic_subquestions(query, max)
                }
            },
            Err(e) => {
                warn!(error = %e, "decomposition failed, using heuristics");
                heuristic_subquestions(query, max)
            }
        }
    }
}

fn parse_subquestions(reply: &str) -> Option<Vec<String>> {
    let span = json_span(reply, '[', ']')?;
    serde_json::from_str::<Vec<String>>(span).ok()
}
