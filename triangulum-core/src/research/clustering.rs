//! Vector-based document clustering with subquestion coverage scoring.
//!
//! Seeding is greedy farthest-point starting at document 0; documents are
//! then assigned to their most similar center. Ties always resolve to the
//! lowest index, so identical inputs and embeddings give identical clusters.

use crate::config::ClusteringConfig;
use crate::embeddings::{EmbeddingModel, cosine_similarity, mean_vector};
use crate::research::extractor::ExtractedDocument;
use crate::web::truncate_chars;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A thematic group of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub label: String,
    pub doc_urls: Vec<String>,
    pub summary: String,
    /// Unique source domains per document, at most 1.
    pub novelty_score: f64,
    pub subquestion_scores: BTreeMap<String, f64>,
    pub coverage_by_subquestion: BTreeMap<String, f64>,
    /// Mean of `coverage_by_subquestion`.
    pub coverage_score: f64,
}

impl Cluster {
    pub fn subquestion_score(&self, subquestion: &str) -> f64 {
        self.subquestion_scores
            .get(subquestion)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn coverage_for(&self, subquestion: &str) -> f64 {
        self.coverage_by_subquestion
            .get(subquestion)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Bounded embedding input for a document: title, facts, then quotes.
pub fn document_excerpt(doc: &ExtractedDocument, max_chars: usize) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(title) = &doc.title {
        parts.push(title);
    }
    parts.extend(doc.facts.iter().map(String::as_str));
    parts.extend(doc.quotes.iter().map(String::as_str));
    truncate_chars(&parts.join("\n"), max_chars)
}

/// Greedy farthest-point seeding. Returns center indices, first is always 0.
pub fn farthest_point_seeds(vectors: &[Vec<f32>], target: usize) -> Vec<usize> {
    if vectors.is_empty() || target == 0 {
        return Vec::new();
    }
    let mut centers = vec![0usize];
    while centers.len() < target.min(vectors.len()) {
        let mut best: Option<(usize, f64)> = None;
        for (idx, vector) in vectors.iter().enumerate() {
            if centers.contains(&idx) {
                continue;
            }
            let nearest = centers
                .iter()
                .map(|&c| cosine_similarity(vector, &vectors[c]))
                .fold(f64::NEG_INFINITY, f64::max);
            if best.is_none_or(|(_, sim)| nearest < sim) {
                best = Some((idx, nearest));
            }
        }
        match best {
            Some((idx, _)) => centers.push(idx),
            None => break,
        }
    }
    centers
}

/// Index of the most similar center for each vector.
pub fn assign_to_centers(vectors: &[Vec<f32>], centers: &[usize]) -> Vec<usize> {
    vectors
        .iter()
        .map(|vector| {
            let mut best = 0usize;
            let mut best_sim = f64::NEG_INFINITY;
            for (slot, &center) in centers.iter().enumerate() {
                let sim = cosine_similarity(vector, &vectors[center]);
                if sim > best_sim {
                    best = slot;
                    best_sim = sim;
                }
            }
            best
        })
        .collect()
}

/// Partition vectors into at most `target` groups of member indices.
///
/// Every index appears in exactly one group; empty groups are dropped.
pub fn partition(vectors: &[Vec<f32>], target: usize) -> Vec<Vec<usize>> {
    let centers = farthest_point_seeds(vectors, target);
    if centers.is_empty() {
        return Vec::new();
    }
    let assignment = assign_to_centers(vectors, &centers);
    let mut groups = vec![Vec::new(); centers.len()];
    for (idx, slot) in assignment.into_iter().enumerate() {
        groups[slot].push(idx);
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// Embeds documents and groups them into scored clusters.
pub struct DocumentClusterer {
    embedder: Arc<dyn EmbeddingModel>,
    config: ClusteringConfig,
}

impl DocumentClusterer {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, config: ClusteringConfig) -> Self {
        Self { embedder, config }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Cluster with the default target, `min(max_clusters, ceil(n / docs_per_cluster))`.
    pub async fn cluster_auto(
        &self,
        docs: &[ExtractedDocument],
        subquestions: &[String],
    ) -> Vec<Cluster> {
        let target = self.config.target_clusters(docs.len());
        self.cluster(docs, subquestions, target).await
    }

    /// Cluster `docs` into at most `target_clusters` groups.
    ///
    /// Document URLs are expected to be unique.
    pub async fn cluster(
        &self,
        docs: &[ExtractedDocument],
        subquestions: &[String],
        target_clusters: usize,
    ) -> Vec<Cluster> {
        if docs.is_empty() || target_clusters == 0 {
            return Vec::new();
        }

        let excerpts: Vec<String> = docs
            .iter()
            .map(|d| document_excerpt(d, self.config.excerpt_chars))
            .collect();
        let doc_vectors = self.embed_all(&excerpts).await;
        let sq_vectors: Vec<Option<Vec<f32>>> = if subquestions.is_empty() {
            Vec::new()
        } else {
            match self.embedder.embed_batch(subquestions).await {
                Ok(vectors) if vectors.len() == subquestions.len() => {
                    vectors.into_iter().map(Some).collect()
                }
                Ok(_) | Err(_) => {
                    warn!("subquestion embedding failed, coverage will be zero");
                    vec![None; subquestions.len()]
                }
            }
        };

        let groups = partition(&doc_vectors, target_clusters);
        debug!(
            documents = docs.len(),
            target = target_clusters,
            clusters = groups.len(),
            "documents clustered"
        );

        groups
            .into_iter()
            .map(|members| {
                self.score_cluster(&members, docs, &doc_vectors, subquestions, &sq_vectors)
            })
            .collect()
    }

    async fn embed_all(&self, excerpts: &[String]) -> Vec<Vec<f32>> {
        match self.embedder.embed_batch(excerpts).await {
            Ok(vectors) if vectors.len() == excerpts.len() => vectors,
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "batch embedding failed, embedding documents one by one");
                }
                let mut vectors = Vec::with_capacity(excerpts.len());
                for excerpt in excerpts {
                    match self.embedder.embed(excerpt).await {
                        Ok(v) => vectors.push(v),
                        Err(e) => {
                            warn!(error = %e, "document embedding failed");
                            vectors.push(Vec::new());
                        }
                    }
                }
                vectors
            }
        }
    }

    fn score_cluster(
        &self,
        members: &[usize],
        docs: &[ExtractedDocument],
        doc_vectors: &[Vec<f32>],
        subquestions: &[String],
        sq_vectors: &[Option<Vec<f32>>],
    ) -> Cluster {
        let member_docs: Vec<&ExtractedDocument> = members.iter().map(|&i| &docs[i]).collect();
        let center = member_docs[0];

        let domains: HashSet<String> = member_docs
            .iter()
            .map(|d| d.domain().unwrap_or_else(|| d.url.clone()))
            .collect();
        let novelty_score = (domains.len() as f64 / member_docs.len() as f64).min(1.0);

        let label = center
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| center.domain())
            .unwrap_or_else(|| center.url.clone());

        let member_vectors: Vec<&[f32]> =
            members.iter().map(|&i| doc_vectors[i].as_slice()).collect();
        let centroid = mean_vector(&member_vectors);

        let mut subquestion_scores = BTreeMap::new();
        let mut coverage_by_subquestion = BTreeMap::new();
        for (sq, sq_vector) in subquestions.iter().zip(sq_vectors.iter()) {
            let (score, coverage) = match sq_vector {
                Some(sq_vector) => {
                    let covered = member_vectors
                        .iter()
                        .filter(|v| {
                            cosine_similarity(v, sq_vector) > self.config.coverage_threshold
                        })
                        .count();
                    (
                        cosine_similarity(&centroid, sq_vector),
                        covered as f64 / member_vectors.len() as f64,
                    )
                }
                None => (0.0, 0.0),
            };
            subquestion_scores.insert(sq.clone(), score);
            coverage_by_subquestion.insert(sq.clone(), coverage);
        }
        let coverage_score = if coverage_by_subquestion.is_empty() {
            0.0
        } else {
            coverage_by_subquestion.values().sum::<f64>() / coverage_by_subquestion.len() as f64
        };

        Cluster {
            label,
            doc_urls: member_docs.iter().map(|d| d.url.clone()).collect(),
            summary: summarize(&member_docs).unwrap_or_else(|| label_summary(center)),
            novelty_score,
            subquestion_scores,
            coverage_by_subquestion,
            coverage_score,
        }
    }
}

/// First fact of each of the first two members, topped up to two facts.
fn summarize(members: &[&ExtractedDocument]) -> Option<String> {
    let leading = &members[..members.len().min(2)];
    let mut facts: Vec<&str> = leading
        .iter()
        .filter_map(|d| d.facts.first().map(String::as_str))
        .collect();
    if facts.len() < 2 {
        for doc in leading {
            for fact in doc.facts.iter().skip(1) {
                if facts.len() >= 2 {
                    break;
                }
                facts.push(fact);
            }
        }
    }
    (!facts.is_empty()).then(|| facts.join(" • "))
}

fn label_summary(doc: &ExtractedDocument) -> String {
    doc.quotes
        .first()
        .cloned()
        .or_else(|| doc.title.clone())
        .unwrap_or_else(|| doc.url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::error::EmbeddingError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn doc(url: &str, title: &str, facts: &[&str]) -> ExtractedDocument {
        ExtractedDocument {
            url: url.to_string(),
            title: Some(title.to_string()),
            facts: facts.iter().map(|s| s.to_string()).collect(),
            quotes: Vec::new(),
        }
    }

    fn clusterer() -> DocumentClusterer {
        DocumentClusterer::new(Arc::new(LocalEmbedder::new(128)), ClusteringConfig::default())
    }

    #[test]
    fn test_seeding_picks_farthest() {
        let vectors = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        assert_eq!(farthest_point_seeds(&vectors, 2), vec![0, 2]);
        assert_eq!(partition(&vectors, 2), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_seeding_ties_to_lowest_index() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0]];
        assert_eq!(farthest_point_seeds(&vectors, 3), vec![0, 1, 2]);
        // Duplicate center 2 loses every tie to center 1 and is dropped.
        assert_eq!(partition(&vectors, 3), vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_partition_target_larger_than_input() {
        let vectors = vec![vec![1.0, 0.0]];
        assert_eq!(partition(&vectors, 3), vec![vec![0]]);
        assert!(partition(&[], 3).is_empty());
    }

    #[test]
    fn test_excerpt_is_bounded() {
        let d = doc("https://a.com", "Title", &["x".repeat(3000).as_str()]);
        assert_eq!(document_excerpt(&d, 2000).chars().count(), 2000);
    }

    #[tokio::test]
    async fn test_single_cluster_of_three_domains() {
        let docs = vec![
            doc("https://a.com/1", "A", &["Solar output grew.", "Panels got cheaper."]),
            doc("https://b.org/2", "B", &["Wind output grew.", "Turbines got larger."]),
            doc("https://c.net/3", "C", &["Hydro output fell.", "Dams aged."]),
        ];
        let subs = vec!["renewable output".to_string()];
        let clusters = clusterer().cluster(&docs, &subs, 1).await;
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_eq!(c.doc_urls, vec!["https://a.com/1", "https://b.org/2", "https://c.net/3"]);
        assert_eq!(c.novelty_score, 1.0);
        assert_eq!(c.label, "A");
        assert_eq!(c.summary, "Solar output grew. • Wind output grew.");
        assert!(c.subquestion_scores.contains_key("renewable output"));
        assert!((0.0..=1.0).contains(&c.coverage_score));
    }

    #[tokio::test]
    async fn test_novelty_counts_domains() {
        let docs = vec![
            doc("https://a.com/1", "A1", &["Fact one about topic."]),
            doc("https://www.a.com/2", "A2", &["Fact two about topic."]),
        ];
        let clusters = clusterer().cluster(&docs, &[], 1).await;
        assert_eq!(clusters[0].novelty_score, 0.5);
        assert_eq!(clusters[0].coverage_score, 0.0);
    }

    #[test]
    fn test_summary_tops_up_from_single_doc() {
        let d = doc("https://a.com", "A", &["One.", "Two.", "Three."]);
        assert_eq!(summarize(&[&d]).as_deref(), Some("One. • Two."));
    }

    #[tokio::test]
    async fn test_clustering_is_deterministic() {
        let docs: Vec<ExtractedDocument> = (0..9)
            .map(|i| {
                let topic = ["solar", "wind", "nuclear"][i % 3];
                doc(
                    &format!("https://site{i}.com"),
                    topic,
                    &[format!("{topic} energy fact number {i}").as_str()],
                )
            })
            .collect();
        let subs = vec!["solar energy".to_string(), "nuclear energy".to_string()];
        let first = clusterer().cluster_auto(&docs, &subs).await;
        let second = clusterer().cluster_auto(&docs, &subs).await;
        assert_eq!(first, second);
        let total: usize = first.iter().map(|c| c.doc_urls.len()).sum();
        assert_eq!(total, 9);
    }

    struct FlakyEmbedder;

    #[async_trait]
    impl EmbeddingModel for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.contains("broken") {
                Err(EmbeddingError::Request {
                    message: "nope".into(),
                })
            } else {
                Ok(LocalEmbedder::new(32).embed_text(text))
            }
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Request {
                message: "batch down".into(),
            })
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_embedding_failures_degrade() {
        let docs = vec![
            doc("https://a.com", "A", &["working document text"]),
            doc("https://b.com", "broken", &["this one fails"]),
        ];
        let clusterer =
            DocumentClusterer::new(Arc::new(FlakyEmbedder), ClusteringConfig::default());
        let clusters = clusterer.cluster(&docs, &["query".to_string()], 2).await;
        let total: usize = clusters.iter().map(|c| c.doc_urls.len()).sum();
        assert_eq!(total, 2);
        assert!(clusters.iter().all(|c| c.coverage_score == 0.0));
    }
}
