//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use triangulum_core::embeddings::{LocalEmbedder, cosine_similarity};
use triangulum_core::research::clustering::partition;
use triangulum_core::research::credibility::{
    CredibilityScorer, CredibilityTable, press_freedom_score,
};
use triangulum_core::research::evidence::{aggregate, normalize_claim};
use triangulum_core::research::extractor::ExtractedDocument;
use triangulum_core::research::planner::heuristic_subquestions;

const FACTS: &[&str] = &[
    "Heat pumps work in cold climates.",
    "heat pumps work in cold climates",
    "Heat   pumps work, in cold climates!",
    "Gas furnaces are cheaper to install.",
    "gas furnaces are CHEAPER to install",
    "Insulation matters more than equipment.",
    "...",
];

fn documents() -> impl Strategy<Value = Vec<ExtractedDocument>> {
    prop::collection::vec(
        (
            0usize..5,
            prop::collection::vec(prop::sample::select(FACTS), 0..6),
        ),
        0..8,
    )
    .prop_map(|docs| {
        docs.into_iter()
            .enumerate()
            .map(|(i, (domain, facts))| ExtractedDocument {
                url: format!("https://site{domain}.example/{i}"),
                title: None,
                facts: facts.into_iter().map(String::from).collect(),
                quotes: Vec::new(),
            })
            .collect()
    })
}

fn vectors() -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 4), 0..20)
}

// --- Evidence aggregation properties ---

proptest! {
    #[test]
    fn support_count_matches_fact_occurrences(docs in documents()) {
        let items = aggregate(&docs);
        let all_facts: Vec<&String> = docs.iter().flat_map(|d| d.facts.iter()).collect();
        for item in &items {
            let expected = all_facts
                .iter()
                .filter(|f| normalize_claim(f) == item.key)
                .count();
            prop_assert_eq!(item.support_count, expected);
            prop_assert!(!item.sources.is_empty());
            prop_assert!(item.examples.len() <= 3);
        }
        for pair in items.windows(2) {
            prop_assert!(pair[0].support_count >= pair[1].support_count);
        }
    }

    #[test]
    fn evidence_sources_are_unique(docs in documents()) {
        for item in aggregate(&docs) {
            let mut urls: Vec<&str> = item.sources.iter().map(|s| s.url.as_str()).collect();
            let before = urls.len();
            urls.sort_unstable();
            urls.dedup();
            prop_assert_eq!(before, urls.len());
        }
    }
}

// --- Clustering properties ---

proptest! {
    #[test]
    fn partition_covers_every_index_once(vectors in vectors(), target in 0usize..6) {
        let groups = partition(&vectors, target);
        let mut seen: Vec<usize> = groups.iter().flatten().copied().collect();
        seen.sort_unstable();
        if target == 0 || vectors.is_empty() {
            prop_assert!(groups.is_empty());
        } else {
            prop_assert_eq!(seen, (0..vectors.len()).collect::<Vec<_>>());
            prop_assert!(groups.len() <= target);
            prop_assert!(groups.iter().all(|g| !g.is_empty()));
        }
    }

    #[test]
    fn partition_is_deterministic(vectors in vectors(), target in 1usize..6) {
        prop_assert_eq!(partition(&vectors, target), partition(&vectors, target));
    }

    #[test]
    fn local_embeddings_are_deterministic(text in "[a-z ]{0,80}") {
        let embedder = LocalEmbedder::new(128);
        let a = embedder.embed_text(&text);
        let b = embedder.embed_text(&text);
        prop_assert_eq!(&a, &b);
        let similarity = cosine_similarity(&a, &b);
        prop_assert!((-1.0..=1.0 + 1e-9).contains(&similarity));
    }
}

// --- Credibility properties ---

proptest! {
    #[test]
    fn credibility_scorer_is_total(input in "\\PC{0,40}") {
        let scorer = CredibilityScorer::new(CredibilityTable::empty());
        let score = scorer.score_domain(&input);
        prop_assert!((0.0..=1.0).contains(&score.overall_score));
        prop_assert!((0.0..=1.0).contains(&score.factual_reporting));
        prop_assert!((0.0..=1.0).contains(&score.credibility_rating));
        prop_assert!((0.0..=1.0).contains(&score.press_freedom));
    }

    #[test]
    fn press_freedom_rank_scales_linearly(rank in 1u32..180) {
        let score = press_freedom_score(&format!("Problematic Situation (Rank ~{rank})"));
        prop_assert!((score - (1.0 - f64::from(rank) / 180.0)).abs() < 1e-9);
    }
}

// --- Planning properties ---

proptest! {
    #[test]
    fn subquestions_never_empty_and_capped(
        query in "[a-z]{3,8}( (vs|and|or) [a-z]{3,8}){0,3}",
        max in 1usize..6,
    ) {
        let subquestions = heuristic_subquestions(&query, max);
        prop_assert!(!subquestions.is_empty());
        prop_assert!(subquestions.len() <= max);
        prop_assert_eq!(&subquestions[0], &query);
    }
}
