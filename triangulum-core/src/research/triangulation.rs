//! Cross-source claim triangulation.
//!
//! Groups semantically equivalent claims from many sources, tags every
//! member with its source's political lane, and flags groups whose members
//! disagree using keyword overlap plus negation and numeric checks.

use crate::config::TriangulationConfig;
use crate::embeddings::{EmbeddingModel, cosine_similarity};
use crate::research::credibility::{CredibilityScorer, Lane};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "neither", "without", "lack", "doesn't", "don't", "isn't", "aren't",
    "wasn't", "weren't", "won't", "cannot", "can't",
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
    "could", "of", "in", "to", "for", "with", "on", "at", "from", "by", "about", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "this", "that", "these",
    "those", "it", "its", "and", "but", "or",
];

/// A claim attributed to one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcedClaim {
    pub source_id: String,
    pub source_url: String,
    pub text: String,
}

impl SourcedClaim {
    pub fn new(
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_url: source_url.into(),
            text: text.into(),
        }
    }
}

/// A cluster member with its source's lane and credibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportingClaim {
    pub source_id: String,
    pub source_url: String,
    pub text: String,
    pub lane: Lane,
    pub credibility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimClusterKind {
    /// Members from different sources disagree.
    Conflicting,
    /// Two or more sources agree.
    Shared,
    /// A single source.
    Unique,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCluster {
    pub cluster_id: usize,
    /// Text of the claim that opened the cluster.
    pub representative_text: String,
    pub lanes_covered: BTreeSet<Lane>,
    pub supporting_claims: Vec<SupportingClaim>,
    pub kind: ClaimClusterKind,
    pub mean_credibility: f64,
}

impl ClaimCluster {
    pub fn source_count(&self) -> usize {
        self.supporting_claims
            .iter()
            .map(|c| c.source_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriangulationReport {
    pub clusters: Vec<ClaimCluster>,
    /// Distinct sources per lane.
    pub lane_distribution: BTreeMap<Lane, usize>,
}

impl TriangulationReport {
    pub fn clusters_of(&self, kind: ClaimClusterKind) -> impl Iterator<Item = &ClaimCluster> {
        self.clusters.iter().filter(move |c| c.kind == kind)
    }
}

/// Lowercase keywords longer than two characters, stop words removed.
pub fn claim_keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Jaccard similarity of two keyword sets.
pub fn keyword_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn has_negation(text: &str) -> bool {
    text.to_lowercase()
        .replace('\u{2019}', "'")
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|w| NEGATION_WORDS.contains(&w))
}

fn numbers(text: &str) -> Vec<f64> {
    text.split(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .filter_map(|s| s.parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .collect()
}

/// Whether two claims about the same topic disagree.
///
/// A negation present in only one claim, or any pair of numbers further
/// apart than `numeric_tolerance`, counts once the keyword overlap shows a
/// shared topic.
pub fn claims_disagree(a: &str, b: &str, config: &TriangulationConfig) -> bool {
    let overlap = keyword_overlap(&claim_keywords(a), &claim_keywords(b));

    if has_negation(a) != has_negation(b) && overlap > config.negation_overlap {
        return true;
    }

    let nums_a = numbers(a);
    let nums_b = numbers(b);
    if nums_a.is_empty() || nums_b.is_empty() || overlap <= config.numeric_overlap {
        return false;
    }
    nums_a.iter().any(|na| {
        nums_b
            .iter()
            .any(|nb| (na - nb).abs() / na.abs().max(1.0) > config.numeric_tolerance)
    })
}

/// Groups claims by embedding similarity and tags them by lane.
pub struct TriangulationGrouper {
    embedder: Arc<dyn EmbeddingModel>,
    scorer: Arc<CredibilityScorer>,
    config: TriangulationConfig,
}

impl TriangulationGrouper {
    pub fn new(
        embedder: Arc<dyn EmbeddingModel>,
        scorer: Arc<CredibilityScorer>,
        config: TriangulationConfig,
    ) -> Self {
        Self {
            embedder,
            scorer,
            config,
        }
    }

    /// Group `claims` greedily in input order.
    ///
    /// A claim joins the first cluster whose representative is at least
    /// `similarity_threshold` similar, otherwise it opens a new cluster.
    pub async fn group(&self, claims: &[SourcedClaim]) -> TriangulationReport {
        let claims: Vec<&SourcedClaim> = claims
            .iter()
            .filter(|c| !c.text.trim().is_empty())
            .collect();
        if claims.is_empty() {
            return TriangulationReport::default();
        }

        let texts: Vec<String> = claims.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_all(&texts).await;

        // (representative index, member indices)
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
        for (idx, vector) in vectors.iter().enumerate() {
            let home = groups.iter_mut().find(|(rep, _)| {
                cosine_similarity(&vectors[*rep], vector) >= self.config.similarity_threshold
            });
            match home {
                Some((_, members)) => members.push(idx),
                None => groups.push((idx, vec![idx])),
            }
        }

        let mut lane_sources: BTreeMap<Lane, HashSet<&str>> = BTreeMap::new();
        let clusters: Vec<ClaimCluster> = groups
            .into_iter()
            .enumerate()
            .map(|(cluster_id, (rep, members))| {
                let supporting: Vec<SupportingClaim> = members
                    .iter()
                    .map(|&i| {
                        let claim = claims[i];
                        let credibility = self.scorer.score_domain(&claim.source_url);
                        lane_sources
                            .entry(credibility.lane)
                            .or_default()
                            .insert(claim.source_id.as_str());
                        SupportingClaim {
                            source_id: claim.source_id.clone(),
                            source_url: claim.source_url.clone(),
                            text: claim.text.clone(),
                            lane: credibility.lane,
                            credibility: credibility.overall_score,
                        }
                    })
                    .collect();
                build_cluster(cluster_id, claims[rep].text.clone(), supporting, &self.config)
            })
            .collect();

        let lane_distribution = lane_sources
            .into_iter()
            .map(|(lane, sources)| (lane, sources.len()))
            .collect();

        debug!(
            claims = claims.len(),
            clusters = clusters.len(),
            "claims triangulated"
        );
        TriangulationReport {
            clusters,
            lane_distribution,
        }
    }

    async fn embed_all(&self, texts: &[String]) -> Vec<Vec<f32>> {
        match self.embedder.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "batch claim embedding failed, embedding one by one");
                }
                let mut vectors = Vec::with_capacity(texts.len());
                for text in texts {
                    match self.embedder.embed(text).await {
                        Ok(v) => vectors.push(v),
                        Err(e) => {
                            warn!(error = %e, "claim embedding failed");
                            vectors.push(Vec::new());
                        }
                    }
                }
                vectors
            }
        }
    }
}

fn build_cluster(
    cluster_id: usize,
    representative_text: String,
    supporting_claims: Vec<SupportingClaim>,
    config: &TriangulationConfig,
) -> ClaimCluster {
    let lanes_covered = supporting_claims.iter().map(|c| c.lane).collect();
    let mean_credibility = if supporting_claims.is_empty() {
        0.0
    } else {
        supporting_claims.iter().map(|c| c.credibility).sum::<f64>()
            / supporting_claims.len() as f64
    };

    let conflicting = supporting_claims.iter().enumerate().any(|(i, a)| {
        supporting_claims[i + 1..]
            .iter()
            .any(|b| a.source_id != b.source_id && claims_disagree(&a.text, &b.text, config))
    });
    let sources: HashSet<&str> = supporting_claims
        .iter()
        .map(|c| c.source_id.as_str())
        .collect();
    let kind = if conflicting {
        ClaimClusterKind::Conflicting
    } else if sources.len() >= 2 {
        ClaimClusterKind::Shared
    } else {
        ClaimClusterKind::Unique
    };

    ClaimCluster {
        cluster_id,
        representative_text,
        lanes_covered,
        supporting_claims,
        kind,
        mean_credibility,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::research::credibility::CredibilityTable;
    use pretty_assertions::assert_eq;

    fn grouper() -> TriangulationGrouper {
        grouper_with(TriangulationConfig::default())
    }

    fn grouper_with(config: TriangulationConfig) -> TriangulationGrouper {
        let table = CredibilityTable::from_json_str(
            r#"[
                {"domain": "apnews.com", "bias": "least biased", "factual_reporting": "very high", "credibility": "high", "press_freedom": "rank 45/180"},
                {"domain": "foxnews.com", "bias": "right", "factual_reporting": "mixed", "credibility": "medium", "press_freedom": "rank 45/180"},
                {"domain": "msnbc.com", "bias": "left", "factual_reporting": "mixed", "credibility": "medium", "press_freedom": "rank 45/180"}
            ]"#,
        )
        .unwrap();
        TriangulationGrouper::new(
            Arc::new(LocalEmbedder::new(4096)),
            Arc::new(CredibilityScorer::new(table)),
            config,
        )
    }

    #[test]
    fn test_negation_disagreement() {
        let config = TriangulationConfig::default();
        assert!(claims_disagree(
            "Prompt caching significantly reduces latency in LLM applications",
            "Prompt caching does not significantly reduce latency in LLM applications",
            &config,
        ));
        assert!(!claims_disagree("The sky is blue", "Python is not a snake", &config));
    }

    #[test]
    fn test_numeric_disagreement() {
        let config = TriangulationConfig::default();
        assert!(claims_disagree(
            "Unemployment rose to 5 percent in March",
            "Unemployment rose to 9 percent in March",
            &config,
        ));
        assert!(!claims_disagree(
            "Unemployment rose to 5 percent in March",
            "Unemployment rose to 5 percent in March",
            &config,
        ));
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let a = "Unemployment rose to 5 percent in March";
        let b = "Unemployment rose to 5.4 percent in March";
        assert!(!claims_disagree(a, b, &TriangulationConfig::default()));
        let strict = TriangulationConfig {
            numeric_tolerance: 0.05,
            ..TriangulationConfig::default()
        };
        assert!(claims_disagree(a, b, &strict));

        // Keyword overlap here is 2/6: below the default negation bar.
        let plain = "Unemployment rose sharply in March";
        let negated = "Unemployment did not rise in March";
        assert!(!claims_disagree(plain, negated, &TriangulationConfig::default()));
        let loose = TriangulationConfig {
            negation_overlap: 0.2,
            ..TriangulationConfig::default()
        };
        assert!(claims_disagree(plain, negated, &loose));
    }

    #[tokio::test]
    async fn test_numeric_tolerance_changes_classification() {
        let claims = vec![
            SourcedClaim::new(
                "ap",
                "https://apnews.com/a",
                "Unemployment rose to 5 percent in March",
            ),
            SourcedClaim::new(
                "fox",
                "https://foxnews.com/b",
                "Unemployment rose to 5.4 percent in March",
            ),
        ];
        let default_report = grouper().group(&claims).await;
        assert_eq!(default_report.clusters.len(), 1);
        assert_eq!(default_report.clusters[0].kind, ClaimClusterKind::Shared);

        let strict = grouper_with(TriangulationConfig {
            numeric_tolerance: 0.05,
            ..TriangulationConfig::default()
        });
        let strict_report = strict.group(&claims).await;
        assert_eq!(strict_report.clusters.len(), 1);
        assert_eq!(strict_report.clusters[0].kind, ClaimClusterKind::Conflicting);
    }

    #[test]
    fn test_keyword_overlap_empty() {
        assert_eq!(keyword_overlap(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[tokio::test]
    async fn test_shared_unique_and_lanes() {
        let claims = vec![
            SourcedClaim::new(
                "ap",
                "https://apnews.com/a",
                "Heat pumps work well in cold climates",
            ),
            SourcedClaim::new(
                "fox",
                "https://www.foxnews.com/b",
                "Heat pumps work well in cold climates",
            ),
            SourcedClaim::new(
                "msnbc",
                "https://msnbc.com/c",
                "The central bank raised interest rates again",
            ),
        ];
        let report = grouper().group(&claims).await;

        assert_eq!(report.clusters.len(), 2);
        let shared = &report.clusters[0];
        assert_eq!(shared.kind, ClaimClusterKind::Shared);
        assert_eq!(shared.source_count(), 2);
        assert_eq!(
            shared.lanes_covered,
            BTreeSet::from([Lane::Right, Lane::Center])
        );
        assert_eq!(report.clusters[1].kind, ClaimClusterKind::Unique);
        assert_eq!(report.lane_distribution.get(&Lane::Left), Some(&1));
        assert_eq!(report.lane_distribution.get(&Lane::Center), Some(&1));
        assert_eq!(report.lane_distribution.get(&Lane::Right), Some(&1));
    }

    #[tokio::test]
    async fn test_conflicting_cluster() {
        let claims = vec![
            SourcedClaim::new(
                "ap",
                "https://apnews.com/a",
                "Unemployment rose to 5 percent in March",
            ),
            SourcedClaim::new(
                "fox",
                "https://foxnews.com/b",
                "Unemployment rose to 9 percent in March",
            ),
        ];
        let report = grouper().group(&claims).await;
        assert_eq!(report.clusters.len(), 1);
        assert_eq!(report.clusters[0].kind, ClaimClusterKind::Conflicting);
        assert_eq!(report.clusters_of(ClaimClusterKind::Conflicting).count(), 1);
    }

    #[tokio::test]
    async fn test_same_source_never_conflicts() {
        let claims = vec![
            SourcedClaim::new(
                "ap",
                "https://apnews.com/a",
                "Unemployment rose to 5 percent in March",
            ),
            SourcedClaim::new(
                "ap",
                "https://apnews.com/b",
                "Unemployment rose to 9 percent in March",
            ),
        ];
        let report = grouper().group(&claims).await;
        assert_eq!(report.clusters[0].kind, ClaimClusterKind::Unique);
    }

    #[tokio::test]
    async fn test_unknown_domains_and_empty_input() {
        let g = grouper();
        assert_eq!(g.group(&[]).await, TriangulationReport::default());

        let report = g
            .group(&[SourcedClaim::new(
                "x",
                "https://obscure-blog.example",
                "A lone claim about tides",
            )])
            .await;
        let member = &report.clusters[0].supporting_claims[0];
        assert_eq!(member.lane, Lane::Unknown);
        assert!((report.clusters[0].mean_credibility - 0.55).abs() < 1e-9);
    }
}
