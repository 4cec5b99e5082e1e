//! CLI subcommand handlers.

use crate::render;
use crate::{Commands, ConfigAction};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use triangulum_core::config::{ResearchConfig, load_config};
use triangulum_core::providers::{OpenAiChatModel, OpenAiEmbedder};
use triangulum_core::research::credibility::{
    CredibilityScorer, CredibilityTable, FileUnknownDomainLog,
};
use triangulum_core::research::triangulation::{SourcedClaim, TriangulationGrouper};
use triangulum_core::research::{
    ResearchController, ResearchEvent, ResearchOutcome, ResearchRequest,
};
use triangulum_core::web::{DuckDuckGoSearch, HttpFetcher};
use triangulum_core::{ChatModel, EmbeddingModel, LocalEmbedder, MockChatModel, ResearchMode};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Research {
            query,
            mode,
            budget,
            json,
            offline,
        } => handle_research(workspace, query, mode, budget, json, offline).await,
        Commands::Credibility { domains, json } => handle_credibility(workspace, &domains, json),
        Commands::Triangulate {
            claims,
            offline,
            json,
        } => handle_triangulate(workspace, &claims, offline, json).await,
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<ResearchConfig> {
    load_config(Some(workspace), None).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn embedder(config: &ResearchConfig, offline: bool) -> anyhow::Result<Arc<dyn EmbeddingModel>> {
    if offline {
        return Ok(Arc::new(LocalEmbedder::default()));
    }
    Ok(Arc::new(OpenAiEmbedder::new(&config.llm)?))
}

fn chat_model(config: &ResearchConfig, offline: bool) -> anyhow::Result<Arc<dyn ChatModel>> {
    if offline {
        // An empty reply sends every model-backed step to its heuristic fallback.
        return Ok(Arc::new(MockChatModel::new()));
    }
    Ok(Arc::new(OpenAiChatModel::new(&config.llm)?))
}

fn credibility_scorer(config: &ResearchConfig) -> CredibilityScorer {
    let scorer = match &config.credibility.table_path {
        Some(path) => CredibilityScorer::lazy(path),
        None => CredibilityScorer::new(CredibilityTable::empty()),
    };
    match &config.credibility.unknown_log_path {
        Some(path) => scorer.with_unknown_log(Arc::new(FileUnknownDomainLog::new(path))),
        None => scorer,
    }
}

async fn handle_research(
    workspace: &Path,
    query: String,
    mode: Option<ResearchMode>,
    budget: Option<usize>,
    json: bool,
    offline: bool,
) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let fetch_timeout = Duration::from_secs(config.extraction.fetch_timeout_secs);

    let controller = ResearchController::builder()
        .chat_model(chat_model(&config, offline)?)
        .embedder(embedder(&config, offline)?)
        .search_backend(Arc::new(DuckDuckGoSearch::new(
            fetch_timeout,
            config.search.max_per_subquestion,
        )?))
        .fetcher(Arc::new(HttpFetcher::new(
            fetch_timeout,
            config.extraction.max_content_chars,
        )?))
        .config(config)
        .build();

    let mut request = ResearchRequest::new(query);
    request.mode = mode;
    request.budget = budget;

    let (mut events, cancel) = controller.spawn_stream(request);
    let mut outcome: Option<ResearchOutcome> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                warn!("interrupted, finishing with what has been gathered");
                cancel.cancel();
            }
            event = events.next() => match event {
                Some(ResearchEvent::Started { run_id, mode, budget, .. }) => {
                    info!(%run_id, %mode, budget, "research started");
                }
                Some(ResearchEvent::Planned { query, subquestions }) => {
                    info!(query = %query, subquestions = ?subquestions, "query planned");
                }
                Some(ResearchEvent::ActionStarted { .. }) => {}
                Some(ResearchEvent::ActionFinished { record }) => {
                    info!(
                        index = record.index,
                        action = %record.kind,
                        detail = %record.detail,
                        "action finished"
                    );
                }
                Some(ResearchEvent::Completed { outcome: done }) => outcome = Some(*done),
                Some(ResearchEvent::Failed { message }) => {
                    anyhow::bail!("Research failed: {message}")
                }
                None => break,
            },
        }
    }

    let outcome = outcome.context("research ended without a result")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", render::outline_markdown(&outcome.query, &outcome.outline));
        print!("{}", render::failures_markdown(&outcome.failures));
    }
    Ok(())
}

fn handle_credibility(workspace: &Path, domains: &[String], json: bool) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let scorer = credibility_scorer(&config);
    let rows: Vec<(String, _)> = domains
        .iter()
        .map(|d| (d.clone(), scorer.score_domain(d)))
        .collect();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = rows
            .iter()
            .map(|(d, s)| Ok((d.clone(), serde_json::to_value(s)?)))
            .collect::<Result<_, serde_json::Error>>()?;
        println!("{}", serde_json::to_string_pretty(&map)?);
    } else {
        print!("{}", render::credibility_table(&rows));
    }
    Ok(())
}

async fn handle_triangulate(
    workspace: &Path,
    claims_path: &Path,
    offline: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let raw = std::fs::read_to_string(claims_path)
        .with_context(|| format!("Failed to read {}", claims_path.display()))?;
    let claims: Vec<SourcedClaim> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse claims in {}", claims_path.display()))?;

    let grouper = TriangulationGrouper::new(
        embedder(&config, offline)?,
        Arc::new(credibility_scorer(&config)),
        config.triangulation.clone(),
    );
    let report = grouper.group(&claims).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render::triangulation_markdown(&report));
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".triangulum");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&ResearchConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!("Created default configuration at: {}", config_path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
