//! Source credibility and political-lane scoring.
//!
//! Maps a domain to a [`Lane`] and a composite credibility score. Lookups go
//! through an explicitly injected [`CredibilityTable`], then parent-domain
//! matching, then institutional heuristics, and finally a fixed default.
//! Scoring is total: every input yields a [`SourceCredibility`].

use crate::error::{ConfigError, ResearchError};
use crate::web::normalize_domain;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};
use tracing::{debug, info, warn};

const FACTUAL_WEIGHT: f64 = 0.4;
const CREDIBILITY_WEIGHT: f64 = 0.35;
const PRESS_FREEDOM_WEIGHT: f64 = 0.25;

/// Countries ranked by press-freedom indices when only "Rank ~N" is given.
const PRESS_FREEDOM_COUNTRIES: f64 = 180.0;

const EXCLUDED_BIAS: &[&str] = &[
    "conspiracy-pseudoscience",
    "conspiracy",
    "pseudoscience",
    "unrated",
];

const INSTITUTIONS: &[&str] = &[
    "who.int",
    "un.org",
    "worldbank.org",
    "imf.org",
    "oecd.org",
    "europa.eu",
    "nato.int",
    "wto.org",
];

static RANK_OF_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rank\s*~?\s*(\d+)\s*/\s*(\d+)").expect("valid regex"));
static RANK_APPROX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rank\s*~\s*(\d+)").expect("valid regex"));

/// Coarse political orientation of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lane {
    Left,
    Right,
    Center,
    Unknown,
}

impl Lane {
    /// Map a free-text bias category onto a lane.
    pub fn from_bias(bias: &str) -> Self {
        match bias.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "left" | "left-center" | "left-centre" | "left-bias" | "left-center-bias" => Lane::Left,
            "right" | "right-center" | "right-centre" | "right-bias" | "right-center-bias" => {
                Lane::Right
            }
            "least-biased" | "center" | "centre" | "pro-science" => Lane::Center,
            _ => Lane::Unknown,
        }
    }

    pub fn all() -> [Lane; 4] {
        [Lane::Left, Lane::Center, Lane::Right, Lane::Unknown]
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Left => write!(f, "LEFT"),
            Lane::Right => write!(f, "RIGHT"),
            Lane::Center => write!(f, "CENTER"),
            Lane::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Which lookup step produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Table,
    ParentDomain,
    Institutional,
    Default,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Table => write!(f, "table"),
            Resolution::ParentDomain => write!(f, "parent domain"),
            Resolution::Institutional => write!(f, "institutional"),
            Resolution::Default => write!(f, "default"),
        }
    }
}

/// Credibility profile of one domain. All scores are in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCredibility {
    pub lane: Lane,
    pub factual_reporting: f64,
    pub credibility_rating: f64,
    pub press_freedom: f64,
    pub overall_score: f64,
    pub resolution: Resolution,
}

impl SourceCredibility {
    pub fn new(
        lane: Lane,
        factual_reporting: f64,
        credibility_rating: f64,
        press_freedom: f64,
        resolution: Resolution,
    ) -> Self {
        let factual_reporting = factual_reporting.clamp(0.0, 1.0);
        let credibility_rating = credibility_rating.clamp(0.0, 1.0);
        let press_freedom = press_freedom.clamp(0.0, 1.0);
        let overall_score = (FACTUAL_WEIGHT * factual_reporting
            + CREDIBILITY_WEIGHT * credibility_rating
            + PRESS_FREEDOM_WEIGHT * press_freedom)
            .clamp(0.0, 1.0);
        Self {
            lane,
            factual_reporting,
            credibility_rating,
            press_freedom,
            overall_score,
            resolution,
        }
    }

    /// Fixed rating for government, academic and intergovernmental sources.
    pub fn institutional() -> Self {
        Self::new(Lane::Center, 0.9, 0.9, 0.82, Resolution::Institutional)
    }

    /// Rating for a domain nothing is known about.
    pub fn unknown() -> Self {
        Self::new(Lane::Unknown, 0.5, 0.5, 0.7, Resolution::Default)
    }
}

/// Raw row of the credibility reference table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredibilityRow {
    pub domain: String,
    #[serde(default)]
    pub bias: String,
    #[serde(default)]
    pub factual_reporting: String,
    #[serde(default)]
    pub credibility: String,
    #[serde(default)]
    pub press_freedom: String,
    #[serde(default)]
    pub exclude: bool,
}

impl CredibilityRow {
    fn is_excluded(&self) -> bool {
        let bias = self.bias.trim().to_lowercase().replace(['_', ' '], "-");
        self.exclude || EXCLUDED_BIAS.contains(&bias.as_str())
    }

    fn score(&self) -> SourceCredibility {
        SourceCredibility::new(
            Lane::from_bias(&self.bias),
            factual_score(&self.factual_reporting),
            credibility_score(&self.credibility),
            press_freedom_score(&self.press_freedom),
            Resolution::Table,
        )
    }
}

/// Factual-reporting category → score.
pub fn factual_score(text: &str) -> f64 {
    match text.trim().to_lowercase().replace(['-', '_'], " ").as_str() {
        "very high" => 1.0,
        "high" => 0.85,
        "mostly factual" => 0.7,
        "mixed" => 0.5,
        "low" => 0.25,
        "very low" => 0.1,
        _ => 0.5,
    }
}

/// Credibility-rating category → score.
pub fn credibility_score(text: &str) -> f64 {
    let text = text.trim().to_lowercase();
    let text = text.trim_end_matches(" credibility");
    match text {
        "high" => 0.9,
        "medium" => 0.6,
        "low" => 0.3,
        _ => 0.5,
    }
}

/// Press-freedom free text → score.
///
/// Understands "rank N/total" and "Rank ~N" (out of 180 countries), then falls
/// back to the categorical wording.
pub fn press_freedom_score(text: &str) -> f64 {
    if let Some(caps) = RANK_OF_TOTAL.captures(text)
        && let (Ok(rank), Ok(total)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>())
        && total > 0.0
    {
        return (1.0 - rank / total).clamp(0.0, 1.0);
    }
    if let Some(caps) = RANK_APPROX.captures(text)
        && let Ok(rank) = caps[1].parse::<f64>()
    {
        return (1.0 - rank / PRESS_FREEDOM_COUNTRIES).clamp(0.0, 1.0);
    }

    let lower = text.to_lowercase();
    if lower.contains("very serious") {
        0.15
    } else if lower.contains("difficult") {
        0.3
    } else if lower.contains("problematic") {
        0.45
    } else if lower.contains("satisfactory") {
        0.75
    } else if lower.contains("good") {
        0.9
    } else {
        0.7
    }
}

/// Immutable domain → credibility lookup table.
#[derive(Debug, Clone, Default)]
pub struct CredibilityTable {
    entries: HashMap<String, SourceCredibility>,
}

impl CredibilityTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from raw rows, dropping excluded rows and blank domains.
    pub fn from_rows(rows: impl IntoIterator<Item = CredibilityRow>) -> Self {
        let mut entries = HashMap::new();
        let mut dropped = 0usize;
        for row in rows {
            let domain = normalize_domain(&row.domain);
            if domain.is_empty() || row.is_excluded() {
                dropped += 1;
                continue;
            }
            entries.entry(domain).or_insert_with(|| row.score());
        }
        debug!(kept = entries.len(), dropped, "credibility table built");
        Self { entries }
    }

    /// Parse a JSON array of [`CredibilityRow`]s.
    pub fn from_json_str(json: &str) -> Result<Self, ResearchError> {
        let rows: Vec<CredibilityRow> = serde_json::from_str(json)?;
        Ok(Self::from_rows(rows))
    }

    pub fn load(path: &Path) -> Result<Self, ResearchError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn get(&self, domain: &str) -> Option<&SourceCredibility> {
        self.entries.get(domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Append-only destination for domains resolved only by the default rating.
///
/// Recording a domain the sink has already seen is a no-op.
pub trait UnknownDomainSink: Send + Sync {
    fn record(&self, domain: &str) -> std::io::Result<()>;
}

/// `(log file, domain)` pairs appended by this process, shared by every
/// [`FileUnknownDomainLog`] so each domain reaches a file at most once.
static FILE_LOG_ENTRIES: LazyLock<Mutex<HashSet<(PathBuf, String)>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Unknown-domain log appended to a file, one `domain<TAB>timestamp` per line.
pub struct FileUnknownDomainLog {
    path: PathBuf,
}

impl FileUnknownDomainLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UnknownDomainSink for FileUnknownDomainLog {
    fn record(&self, domain: &str) -> std::io::Result<()> {
        let mut written = FILE_LOG_ENTRIES
            .lock()
            .map_err(|_| std::io::Error::other("unknown-domain log lock poisoned"))?;
        let key = (self.path.clone(), domain.to_string());
        if written.contains(&key) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{domain}\t{}", chrono::Utc::now().to_rfc3339())?;
        written.insert(key);
        Ok(())
    }
}

/// In-memory unknown-domain log.
#[derive(Default)]
pub struct MemoryUnknownDomainLog {
    entries: Mutex<Vec<String>>,
}

impl MemoryUnknownDomainLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl UnknownDomainSink for MemoryUnknownDomainLog {
    fn record(&self, domain: &str) -> std::io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("unknown-domain log lock poisoned"))?;
        if !entries.iter().any(|d| d == domain) {
            entries.push(domain.to_string());
        }
        Ok(())
    }
}

/// Domain → [`SourceCredibility`] scorer.
///
/// The table is either handed in ready-made or loaded from disk on first use
/// and memoised. A failed load degrades to an empty table.
pub struct CredibilityScorer {
    table: OnceLock<CredibilityTable>,
    table_path: Option<PathBuf>,
    unknown_log: Option<Arc<dyn UnknownDomainSink>>,
}

impl CredibilityScorer {
    pub fn new(table: CredibilityTable) -> Self {
        Self {
            table: OnceLock::from(table),
            table_path: None,
            unknown_log: None,
        }
    }

    /// Load the table from `path` the first time a domain is scored.
    pub fn lazy(path: impl Into<PathBuf>) -> Self {
        Self {
            table: OnceLock::new(),
            table_path: Some(path.into()),
            unknown_log: None,
        }
    }

    pub fn with_unknown_log(mut self, sink: Arc<dyn UnknownDomainSink>) -> Self {
        self.unknown_log = Some(sink);
        self
    }

    pub fn table(&self) -> &CredibilityTable {
        self.table.get_or_init(|| match &self.table_path {
            Some(path) => match CredibilityTable::load(path) {
                Ok(table) => {
                    info!(
                        path = %path.display(),
                        entries = table.len(),
                        "credibility table loaded"
                    );
                    table
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "credibility table unavailable, using heuristics only"
                    );
                    CredibilityTable::empty()
                }
            },
            None => CredibilityTable::empty(),
        })
    }

    /// Score a bare domain or URL. Never fails.
    pub fn score_domain(&self, input: &str) -> SourceCredibility {
        let domain = normalize_domain(input);
        if domain.is_empty() {
            return SourceCredibility::unknown();
        }

        let table = self.table();
        if let Some(hit) = table.get(&domain) {
            return hit.clone();
        }

        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() > 2 {
            let parent = labels[labels.len() - 2..].join(".");
            if let Some(hit) = table.get(&parent) {
                return SourceCredibility {
                    resolution: Resolution::ParentDomain,
                    ..hit.clone()
                };
            }
        }

        if is_institutional(&domain) {
            return SourceCredibility::institutional();
        }

        self.note_unknown(&domain);
        SourceCredibility::unknown()
    }

    fn note_unknown(&self, domain: &str) {
        debug!(domain, "unknown credibility domain");
        if let Some(sink) = &self.unknown_log
            && let Err(e) = sink.record(domain)
        {
            debug!(domain, error = %e, "failed to record unknown domain");
        }
    }
}

/// Government, military, academic or allow-listed intergovernmental host.
fn is_institutional(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    let Some(tld) = labels.last() else {
        return false;
    };
    if matches!(*tld, "gov" | "edu" | "mil") {
        return true;
    }
    // gov.uk, ox.ac.uk, health.gov.au
    let country_code = tld.len() == 2 && tld.bytes().all(|b| b.is_ascii_lowercase());
    if country_code && labels.len() >= 2 && matches!(labels[labels.len() - 2], "gov" | "ac") {
        return true;
    }
    INSTITUTIONS
        .iter()
        .any(|inst| domain == *inst || domain.ends_with(&format!(".{inst}")))
}
