//! Configuration system for Triangulum.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/triangulum/config.toml` and/or
//! `.triangulum/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for a research run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Mode used when the caller does not pick one.
    #[serde(default)]
    pub mode: ResearchMode,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub sufficiency: SufficiencyConfig,
    #[serde(default)]
    pub credibility: CredibilityConfig,
    #[serde(default)]
    pub triangulation: TriangulationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

/// Operating mode of the iteration controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchMode {
    /// Small action cap, no mandatory reasoning, stop as soon as evidence suffices.
    Speed,
    /// Alternating reasoning and action, hard cap of six actions.
    #[default]
    Balanced,
    /// Reason-act loop over several research angles, cap of ten actions.
    Quality,
}

impl ResearchMode {
    /// Whether a reasoning action must precede each work action.
    pub fn requires_reasoning(self) -> bool {
        !matches!(self, ResearchMode::Speed)
    }

    pub fn all() -> [ResearchMode; 3] {
        [
            ResearchMode::Speed,
            ResearchMode::Balanced,
            ResearchMode::Quality,
        ]
    }
}

impl std::fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchMode::Speed => write!(f, "speed"),
            ResearchMode::Balanced => write!(f, "balanced"),
            ResearchMode::Quality => write!(f, "quality"),
        }
    }
}

impl std::str::FromStr for ResearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "speed" | "fast" => Ok(ResearchMode::Speed),
            "balanced" | "default" => Ok(ResearchMode::Balanced),
            "quality" | "deep" => Ok(ResearchMode::Quality),
            other => Err(format!(
                "unknown research mode '{other}' (expected speed, balanced or quality)"
            )),
        }
    }
}

/// Action caps per mode. The terminal action counts toward the cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub speed: usize,
    pub balanced: usize,
    pub quality: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            speed: 5,
            balanced: 6,
            quality: 10,
        }
    }
}

impl BudgetConfig {
    pub fn cap_for(&self, mode: ResearchMode) -> usize {
        match mode {
            ResearchMode::Speed => self.speed,
            ResearchMode::Balanced => self.balanced,
            ResearchMode::Quality => self.quality,
        }
    }
}

/// Query reformulation and decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub max_subquestions: usize,
    /// Ask the chat model for subquestions before falling back to heuristics.
    pub use_model: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_subquestions: 4,
            use_model: true,
        }
    }
}

/// Search fan-out limits and ranking knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub max_per_subquestion: usize,
    pub max_total: usize,
    pub max_per_domain: usize,
    /// Minimum query term length considered for overlap scoring.
    pub min_term_len: usize,
    /// Bonus granted to a result whose domain has not been selected yet.
    pub diversity_bonus: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_per_subquestion: 8,
            max_total: 30,
            max_per_domain: 3,
            min_term_len: 3,
            diversity_bonus: 0.5,
        }
    }
}

/// Fetch and fact-extraction limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub max_candidates: usize,
    pub max_facts: usize,
    pub max_quotes: usize,
    pub fetch_timeout_secs: u64,
    /// Number of documents fetched concurrently.
    pub concurrency: usize,
    /// Page text handed to the extractor is truncated to this many characters.
    pub max_content_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_candidates: 12,
            max_facts: 8,
            max_quotes: 3,
            fetch_timeout_secs: 15,
            concurrency: 4,
            max_content_chars: 12_000,
        }
    }
}

/// Document clustering knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub max_clusters: usize,
    /// One cluster per this many documents, up to `max_clusters`.
    pub docs_per_cluster: usize,
    /// Member-to-subquestion similarity above which a member counts as covering it.
    pub coverage_threshold: f64,
    pub excerpt_chars: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_clusters: 3,
            docs_per_cluster: 4,
            coverage_threshold: 0.45,
            excerpt_chars: 2_000,
        }
    }
}

impl ClusteringConfig {
    /// `min(max_clusters, ceil(n / docs_per_cluster))`, at least one for non-empty input.
    pub fn target_clusters(&self, documents: usize) -> usize {
        if documents == 0 {
            return 0;
        }
        let per = self.docs_per_cluster.max(1);
        documents.div_ceil(per).min(self.max_clusters.max(1)).max(1)
    }
}

/// Outline ranking weights and confidence normalisers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub summary_novelty_weight: f64,
    pub section_coverage_weight: f64,
    pub section_novelty_weight: f64,
    /// Subquestions whose best coverage falls below this are listed as limitations.
    pub limitation_threshold: f64,
    pub summary_domain_norm: f64,
    pub section_domain_norm: f64,
    pub summary_clusters: usize,
    pub section_clusters: usize,
    pub urls_per_cluster: usize,
    pub max_section_evidence: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            summary_novelty_weight: 0.15,
            section_coverage_weight: 0.2,
            section_novelty_weight: 0.1,
            limitation_threshold: 0.4,
            summary_domain_norm: 6.0,
            section_domain_norm: 8.0,
            summary_clusters: 2,
            section_clusters: 2,
            urls_per_cluster: 2,
            max_section_evidence: 4,
        }
    }
}

/// When the controller may consider evidence sufficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SufficiencyConfig {
    pub min_documents: usize,
}

impl Default for SufficiencyConfig {
    fn default() -> Self {
        Self { min_documents: 3 }
    }
}

/// Credibility reference table and unknown-domain log locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredibilityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_log_path: Option<PathBuf>,
}

/// Claim grouping and disagreement thresholds for triangulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    pub similarity_threshold: f64,
    /// Keyword overlap above which a one-sided negation marks disagreement.
    pub negation_overlap: f64,
    /// Keyword overlap above which differing numbers mark disagreement.
    pub numeric_overlap: f64,
    /// Relative difference at which two numbers stop agreeing.
    pub numeric_tolerance: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            negation_overlap: 0.4,
            numeric_overlap: 0.3,
            numeric_tolerance: 0.1,
        }
    }
}

/// OpenAI-compatible endpoint used by the bundled providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `TRIANGULUM_`)
/// 3. Workspace-local config (`.triangulum/config.toml`)
/// 4. User config (`~/.config/triangulum/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ResearchConfig>,
) -> Result<ResearchConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ResearchConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "triangulum", "triangulum") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".triangulum").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRIANGULUM_SEARCH__MAX_TOTAL, TRIANGULUM_MODE, ...
    figment = figment.merge(Env::prefixed("TRIANGULUM_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ResearchConfig::default();
        assert_eq!(config.mode, ResearchMode::Balanced);
        assert_eq!(config.budgets.balanced, 6);
        assert_eq!(config.budgets.quality, 10);
        assert_eq!(config.search.max_per_subquestion, 8);
        assert_eq!(config.search.max_total, 30);
        assert_eq!(config.search.max_per_domain, 3);
        assert_eq!(config.extraction.max_candidates, 12);
        assert!((config.clustering.coverage_threshold - 0.45).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mode_parse_and_display() {
        for mode in ResearchMode::all() {
            let parsed: ResearchMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
        assert!("turbo".parse::<ResearchMode>().is_err());
        assert!(!ResearchMode::Speed.requires_reasoning());
        assert!(ResearchMode::Quality.requires_reasoning());
    }

    #[test]
    fn test_target_clusters() {
        let c = ClusteringConfig::default();
        assert_eq!(c.target_clusters(0), 0);
        assert_eq!(c.target_clusters(1), 1);
        assert_eq!(c.target_clusters(3), 1);
        assert_eq!(c.target_clusters(5), 2);
        assert_eq!(c.target_clusters(40), 3);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = ResearchConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ResearchConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.mode, config.mode);
        assert_eq!(
            deserialized.search.max_per_domain,
            config.search.max_per_domain
        );
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = ResearchConfig::default();
        overrides.mode = ResearchMode::Quality;
        overrides.search.max_total = 12;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.mode, ResearchMode::Quality);
        assert_eq!(config.search.max_total, 12);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_dir = dir.path().join(".triangulum");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
mode = "speed"

[search]
max_per_subquestion = 5
max_total = 20
max_per_domain = 2
min_term_len = 3
diversity_bonus = 0.25

[clustering]
max_clusters = 4
docs_per_cluster = 3
coverage_threshold = 0.5
excerpt_chars = 1500
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.mode, ResearchMode::Speed);
        assert_eq!(config.search.max_per_domain, 2);
        assert_eq!(config.clustering.max_clusters, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.extraction.max_facts, 8);
    }
}
