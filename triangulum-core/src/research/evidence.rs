//! Claim-level evidence aggregation.
//!
//! Facts whose normalised text collides merge into a single
//! [`EvidenceItem`] carrying every contributing source.

use crate::research::extractor::ExtractedDocument;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

/// Maximum examples (quotes) attached to one item.
pub const MAX_EXAMPLES: usize = 3;

/// A document a claim was seen in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSource {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A deduplicated, multi-source claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Claim text as first seen.
    pub claim: String,
    /// Normalised merge key.
    pub key: String,
    /// Unique by URL, in first-seen order.
    pub sources: Vec<EvidenceSource>,
    pub examples: Vec<String>,
    /// Number of facts merged into this item.
    pub support_count: usize,
}

impl EvidenceItem {
    pub fn has_source(&self, url: &str) -> bool {
        self.sources.iter().any(|s| s.url == url)
    }
}

/// Merge key: NFKC, lowercase, punctuation stripped, whitespace collapsed.
pub fn normalize_claim(text: &str) -> String {
    let stripped: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Merge extracted facts into evidence items.
///
/// Output is ordered by descending support, ties by first-seen order.
/// Facts that normalise to nothing are ignored.
pub fn aggregate(docs: &[ExtractedDocument]) -> Vec<EvidenceItem> {
    let mut items: Vec<EvidenceItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let mut last_item = None;
        for fact in &doc.facts {
            let key = normalize_claim(fact);
            if key.is_empty() {
                continue;
            }
            let slot = match index.get(&key).copied() {
                Some(slot) => {
                    let item = &mut items[slot];
                    item.support_count += 1;
                    if !item.has_source(&doc.url) {
                        item.sources.push(EvidenceSource {
                            url: doc.url.clone(),
                            title: doc.title.clone(),
                        });
                    }
                    slot
                }
                None => {
                    items.push(EvidenceItem {
                        claim: fact.trim().to_string(),
                        key: key.clone(),
                        sources: vec![EvidenceSource {
                            url: doc.url.clone(),
                            title: doc.title.clone(),
                        }],
                        examples: Vec::new(),
                        support_count: 1,
                    });
                    index.insert(key, items.len() - 1);
                    items.len() - 1
                }
            };
            last_item = Some(slot);
        }

        // One quote per document, on the document's last fact.
        if let (Some(slot), Some(quote)) = (last_item, doc.quotes.first()) {
            let item = &mut items[slot];
            let quote = quote.trim();
            if !quote.is_empty()
                && item.examples.len() < MAX_EXAMPLES
                && !item.examples.iter().any(|e| e == quote)
            {
                item.examples.push(quote.to_string());
            }
        }
    }

    items.sort_by(|a, b| b.support_count.cmp(&a.support_count));
    items
}
