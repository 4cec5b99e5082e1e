//! Cited, confidence-annotated outline synthesis.
//!
//! The outline always has the same shape: an executive summary, one section
//! per subquestion in input order, and a limitations section. Sections with
//! nothing to say carry placeholder text instead of disappearing.

use crate::config::SynthesisConfig;
use crate::research::clustering::Cluster;
use crate::research::evidence::EvidenceItem;
use crate::web::domain_of;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

pub const EXECUTIVE_SUMMARY: &str = "Executive Summary";
pub const LIMITATIONS: &str = "Limitations";

const MAX_MARKERS: usize = 3;
const RECENCY_CAVEAT: &str = "Sources reflect what was retrievable at research time; \
     verify recent developments and primary sources before relying on these findings.";

/// One titled block of cited bullets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineSection {
    pub title: String,
    pub bullets: Vec<String>,
}

/// Terminal artifact of a research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub sections: Vec<OutlineSection>,
    pub confidence_by_section: BTreeMap<String, f64>,
}

impl Outline {
    pub fn section(&self, title: &str) -> Option<&OutlineSection> {
        self.sections.iter().find(|s| s.title == title)
    }

    pub fn confidence(&self, title: &str) -> Option<f64> {
        self.confidence_by_section.get(title).copied()
    }
}

/// Inline citation marker for a URL.
///
/// `[title/domain]` when a title is known, `[domain]` otherwise, and
/// `[source]` for URLs without a parsable host.
pub fn citation_marker(url: &str, title: Option<&str>) -> String {
    match (domain_of(url), title.map(str::trim).filter(|t| !t.is_empty())) {
        (Some(domain), Some(title)) => format!("[{title}/{domain}]"),
        (Some(domain), None) => format!("[{domain}]"),
        (None, _) => "[source]".to_string(),
    }
}

/// Assembles an [`Outline`] from clusters and evidence.
pub struct OutlineSynthesizer {
    config: SynthesisConfig,
}

impl OutlineSynthesizer {
    pub fn new(config: SynthesisConfig) -> Self {
        Self { config }
    }

    pub fn synthesize(
        &self,
        query: &str,
        subquestions: &[String],
        clusters: &[Cluster],
        evidence: &[EvidenceItem],
    ) -> Outline {
        let titles = title_index(evidence);
        let mut sections = Vec::with_capacity(subquestions.len() + 2);
        let mut confidence = BTreeMap::new();

        let (summary, summary_confidence) = self.executive_summary(query, clusters, &titles);
        confidence.insert(EXECUTIVE_SUMMARY.to_string(), summary_confidence);
        sections.push(summary);

        for subquestion in subquestions {
            let (section, section_confidence) =
                self.subquestion_section(subquestion, clusters, evidence, &titles);
            confidence.insert(subquestion.clone(), section_confidence);
            sections.push(section);
        }

        sections.push(self.limitations(subquestions, clusters));

        debug!(
            sections = sections.len(),
            clusters = clusters.len(),
            evidence = evidence.len(),
            "outline synthesized"
        );
        Outline {
            sections,
            confidence_by_section: confidence,
        }
    }

    fn executive_summary(
        &self,
        query: &str,
        clusters: &[Cluster],
        titles: &HashMap<&str, &str>,
    ) -> (OutlineSection, f64) {
        let mut ranked: Vec<&Cluster> = clusters.iter().collect();
        let weight = self.config.summary_novelty_weight;
        ranked.sort_by(|a, b| {
            let sa = a.coverage_score + weight * a.novelty_score;
            let sb = b.coverage_score + weight * b.novelty_score;
            sb.total_cmp(&sa)
        });

        let mut bullets: Vec<String> = ranked
            .iter()
            .take(self.config.summary_clusters)
            .map(|cluster| {
                let urls: Vec<&str> = cluster
                    .doc_urls
                    .iter()
                    .take(self.config.urls_per_cluster)
                    .map(String::as_str)
                    .collect();
                with_markers(&cluster.summary, &urls, titles)
            })
            .collect();
        if bullets.is_empty() {
            bullets.push(format!(
                "No evidence clusters could be formed for \"{}\".",
                query.trim()
            ));
        }

        let domains = unique_domains(
            clusters
                .iter()
                .flat_map(|c| c.doc_urls.iter().map(String::as_str)),
        );
        let confidence = (0.4 + 0.6 * (domains as f64 / self.config.summary_domain_norm).min(1.0))
            .clamp(0.0, 1.0);

        (
            OutlineSection {
                title: EXECUTIVE_SUMMARY.to_string(),
                bullets,
            },
            confidence,
        )
    }

    fn subquestion_section(
        &self,
        subquestion: &str,
        clusters: &[Cluster],
        evidence: &[EvidenceItem],
        titles: &HashMap<&str, &str>,
    ) -> (OutlineSection, f64) {
        let mut ranked: Vec<&Cluster> = clusters.iter().collect();
        let score = |c: &Cluster| {
            c.subquestion_score(subquestion)
                + self.config.section_coverage_weight * c.coverage_score
                + self.config.section_novelty_weight * c.novelty_score
        };
        ranked.sort_by(|a, b| score(b).total_cmp(&score(a)));

        let mut pool: Vec<&str> = Vec::new();
        for cluster in ranked.iter().take(self.config.section_clusters) {
            for url in cluster.doc_urls.iter().take(self.config.urls_per_cluster) {
                if !pool.contains(&url.as_str()) {
                    pool.push(url);
                }
            }
        }

        let selected: Vec<&EvidenceItem> = evidence
            .iter()
            .filter(|item| item.sources.iter().any(|s| pool.contains(&s.url.as_str())))
            .take(self.config.max_section_evidence)
            .collect();

        let mut bullets: Vec<String> = selected
            .iter()
            .map(|item| {
                // Pool sources are cited first.
                let mut urls: Vec<&str> = item
                    .sources
                    .iter()
                    .map(|s| s.url.as_str())
                    .filter(|u| pool.contains(u))
                    .collect();
                urls.extend(
                    item.sources
                        .iter()
                        .map(|s| s.url.as_str())
                        .filter(|u| !pool.contains(u)),
                );
                with_markers(&item.claim, &urls, titles)
            })
            .collect();
        if bullets.is_empty() {
            if pool.is_empty() {
                bullets.push("No sources addressed this question.".to_string());
            } else {
                bullets.push(with_markers("Evidence gathered from", &pool, titles));
            }
        }

        let best_coverage = best_coverage(subquestion, clusters);
        let domains = unique_domains(
            pool.iter()
                .copied()
                .chain(selected.iter().flat_map(|i| i.sources.iter().map(|s| s.url.as_str()))),
        );
        let confidence = (0.5 * best_coverage
            + 0.5 * (domains as f64 / self.config.section_domain_norm).min(1.0))
        .clamp(0.15, 1.0);

        (
            OutlineSection {
                title: subquestion.to_string(),
                bullets,
            },
            confidence,
        )
    }

    fn limitations(&self, subquestions: &[String], clusters: &[Cluster]) -> OutlineSection {
        let mut bullets: Vec<String> = subquestions
            .iter()
            .filter_map(|sq| {
                let coverage = best_coverage(sq, clusters);
                (coverage < self.config.limitation_threshold).then(|| {
                    format!(
                        "Limited coverage for \"{sq}\" (best cluster coverage {:.0}%).",
                        coverage * 100.0
                    )
                })
            })
            .collect();
        bullets.push(RECENCY_CAVEAT.to_string());
        OutlineSection {
            title: LIMITATIONS.to_string(),
            bullets,
        }
    }
}

impl Default for OutlineSynthesizer {
    fn default() -> Self {
        Self::new(SynthesisConfig::default())
    }
}

/// Highest coverage any cluster reaches for `subquestion`.
fn best_coverage(subquestion: &str, clusters: &[Cluster]) -> f64 {
    clusters
        .iter()
        .map(|c| c.coverage_for(subquestion))
        .fold(0.0, f64::max)
}

/// Known document titles by URL, first seen wins.
fn title_index(evidence: &[EvidenceItem]) -> HashMap<&str, &str> {
    let mut titles = HashMap::new();
    for source in evidence.iter().flat_map(|e| e.sources.iter()) {
        if let Some(title) = &source.title {
            titles.entry(source.url.as_str()).or_insert(title.as_str());
        }
    }
    titles
}

fn with_markers(text: &str, urls: &[&str], titles: &HashMap<&str, &str>) -> String {
    let markers: Vec<String> = urls
        .iter()
        .take(MAX_MARKERS)
        .map(|url| citation_marker(url, titles.get(url).copied()))
        .collect();
    if markers.is_empty() {
        text.to_string()
    } else {
        format!("{} {}", text.trim(), markers.join(" "))
    }
}

fn unique_domains<'a>(urls: impl Iterator<Item = &'a str>) -> usize {
    urls.filter_map(domain_of).collect::<HashSet<_>>().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::evidence::EvidenceSource;
    use pretty_assertions::assert_eq;

    fn cluster(
        label: &str,
        urls: &[&str],
        coverage: f64,
        novelty: f64,
        sq: &[(&str, f64, f64)],
    ) -> Cluster {
        Cluster {
            label: label.to_string(),
            doc_urls: urls.iter().map(|s| s.to_string()).collect(),
            summary: format!("{label} summary"),
            novelty_score: novelty,
            subquestion_scores: sq.iter().map(|(q, s, _)| (q.to_string(), *s)).collect(),
            coverage_by_subquestion: sq.iter().map(|(q, _, c)| (q.to_string(), *c)).collect(),
            coverage_score: coverage,
        }
    }

    fn item(claim: &str, urls: &[(&str, Option<&str>)]) -> EvidenceItem {
        EvidenceItem {
            claim: claim.to_string(),
            key: claim.to_lowercase(),
            sources: urls
                .iter()
                .map(|(u, t)| EvidenceSource {
                    url: u.to_string(),
                    title: t.map(str::to_string),
                })
                .collect(),
            examples: Vec::new(),
            support_count: urls.len(),
        }
    }

    #[test]
    fn test_citation_marker() {
        assert_eq!(citation_marker("https://www.bbc.com/x", Some("BBC")), "[BBC/bbc.com]");
        assert_eq!(citation_marker("https://bbc.com/x", None), "[bbc.com]");
        assert_eq!(citation_marker("not a url", Some("T")), "[source]");
    }

    #[test]
    fn test_outline_shape_with_no_data() {
        let subs = vec!["q1".to_string(), "q2".to_string()];
        let outline = OutlineSynthesizer::default().synthesize("query", &subs, &[], &[]);
        let titles: Vec<&str> = outline.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec![EXECUTIVE_SUMMARY, "q1", "q2", LIMITATIONS]);
        assert!(outline.sections.iter().all(|s| !s.bullets.is_empty()));
        assert_eq!(outline.confidence(EXECUTIVE_SUMMARY), Some(0.4));
        assert_eq!(outline.confidence("q1"), Some(0.15));
        assert_eq!(outline.confidence(LIMITATIONS), None);
        // both subquestions flagged plus the caveat
        assert_eq!(outline.section(LIMITATIONS).unwrap().bullets.len(), 3);
    }

    #[test]
    fn test_summary_ranks_and_cites() {
        let clusters = vec![
            cluster("low", &["https://low.com/1"], 0.1, 0.0, &[]),
            cluster(
                "high",
                &["https://a.com/1", "https://b.com/1", "https://c.com/1"],
                0.9,
                1.0,
                &[],
            ),
            cluster("mid", &["https://m.com/1"], 0.5, 1.0, &[]),
        ];
        let evidence = vec![item("claim", &[("https://a.com/1", Some("Alpha"))])];
        let outline = OutlineSynthesizer::default().synthesize("q", &[], &clusters, &evidence);
        let summary = outline.section(EXECUTIVE_SUMMARY).unwrap();
        assert_eq!(
            summary.bullets,
            vec![
                "high summary [Alpha/a.com] [b.com]".to_string(),
                "mid summary [m.com]".to_string()
            ]
        );
        // 5 unique domains across all clusters
        let expected = 0.4 + 0.6 * (5.0 / 6.0);
        assert!((outline.confidence(EXECUTIVE_SUMMARY).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_section_selects_pool_evidence() {
        let clusters = vec![
            cluster(
                "solar",
                &["https://a.com/1", "https://b.com/1"],
                0.5,
                1.0,
                &[("sq", 0.9, 0.8)],
            ),
            cluster("other", &["https://z.com/1"], 0.5, 1.0, &[("sq", 0.1, 0.0)]),
        ];
        let evidence = vec![
            item("Off-topic claim", &[("https://nowhere.com", None)]),
            item(
                "Solar is cheap",
                &[("https://nowhere.com", None), ("https://a.com/1", Some("A"))],
            ),
        ];
        let outline = OutlineSynthesizer::default().synthesize(
            "q",
            &["sq".to_string()],
            &clusters,
            &evidence,
        );
        let section = outline.section("sq").unwrap();
        assert_eq!(
            section.bullets,
            vec!["Solar is cheap [A/a.com] [nowhere.com]".to_string()]
        );

        // pool a, b, z plus nowhere.com => 4 domains
        let expected = 0.5 * 0.8 + 0.5 * (4.0 / 8.0);
        assert!((outline.confidence("sq").unwrap() - expected).abs() < 1e-9);
        // 0.8 coverage is not a limitation
        assert_eq!(outline.section(LIMITATIONS).unwrap().bullets.len(), 1);
    }

    #[test]
    fn test_section_falls_back_to_bare_sources() {
        let clusters = vec![cluster("c", &["https://a.com/1"], 0.2, 1.0, &[("sq", 0.5, 0.2)])];
        let outline =
            OutlineSynthesizer::default().synthesize("q", &["sq".to_string()], &clusters, &[]);
        assert_eq!(
            outline.section("sq").unwrap().bullets,
            vec!["Evidence gathered from [a.com]".to_string()]
        );
        let limitations = &outline.section(LIMITATIONS).unwrap().bullets;
        assert_eq!(
            limitations[0],
            "Limited coverage for \"sq\" (best cluster coverage 20%)."
        );
    }
}
