//! Markdown rendering of research artifacts.
//!
//! The core library hands back plain data; everything a reader sees is
//! formatted here.

use std::fmt::Write;
use triangulum_core::research::credibility::SourceCredibility;
use triangulum_core::research::triangulation::{ClaimClusterKind, TriangulationReport};
use triangulum_core::research::{ActionFailure, Outline};

/// Render an outline with per-section confidence.
pub fn outline_markdown(query: &str, outline: &Outline) -> String {
    let mut out = format!("# {}\n", query.trim());
    for section in &outline.sections {
        out.push('\n');
        match outline.confidence(&section.title) {
            Some(confidence) => {
                let _ = writeln!(
                    out,
                    "## {} _(confidence {:.0}%)_",
                    section.title,
                    confidence * 100.0
                );
            }
            None => {
                let _ = writeln!(out, "## {}", section.title);
            }
        }
        out.push('\n');
        for bullet in &section.bullets {
            let _ = writeln!(out, "- {bullet}");
        }
    }
    out
}

/// Footnote listing recovered failures, empty when there were none.
pub fn failures_markdown(failures: &[ActionFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let mut out = format!("\n---\n{} recovered failure(s):\n", failures.len());
    for failure in failures {
        let _ = writeln!(
            out,
            "- {} `{}`: {}",
            failure.kind, failure.target, failure.message
        );
    }
    out
}

pub fn credibility_table(rows: &[(String, SourceCredibility)]) -> String {
    let mut out = String::from(
        "| Domain | Lane | Factual | Credibility | Press freedom | Overall | Resolved by |\n\
         |---|---|---|---|---|---|---|\n",
    );
    for (domain, score) in rows {
        let _ = writeln!(
            out,
            "| {domain} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {} |",
            score.lane,
            score.factual_reporting,
            score.credibility_rating,
            score.press_freedom,
            score.overall_score,
            score.resolution
        );
    }
    out
}

pub fn triangulation_markdown(report: &TriangulationReport) -> String {
    let mut out = String::from("# Triangulation\n\n## Lane distribution\n\n");
    if report.lane_distribution.is_empty() {
        out.push_str("- no sources\n");
    }
    for (lane, sources) in &report.lane_distribution {
        let _ = writeln!(out, "- {lane}: {sources} source(s)");
    }

    for (kind, heading) in [
        (ClaimClusterKind::Conflicting, "Conflicting claims"),
        (ClaimClusterKind::Shared, "Shared claims"),
        (ClaimClusterKind::Unique, "Unique claims"),
    ] {
        let clusters: Vec<_> = report.clusters_of(kind).collect();
        if clusters.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n## {heading}\n");
        for cluster in clusters {
            let lanes: Vec<String> = cluster.lanes_covered.iter().map(|l| l.to_string()).collect();
            let _ = writeln!(
                out,
                "- {} _({}; mean credibility {:.2})_",
                cluster.representative_text,
                lanes.join(", "),
                cluster.mean_credibility
            );
            for claim in &cluster.supporting_claims {
                let _ = writeln!(out, "  - [{}] {} ({})", claim.lane, claim.text, claim.source_url);
            }
        }
    }
    out
}
