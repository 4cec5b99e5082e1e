//! Triangulum CLI: budgeted web research from the terminal.
//!
//! Runs the research pipeline, scores sources and triangulates claims.

mod commands;
mod render;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use triangulum_core::ResearchMode;

/// Triangulum: cited research outlines from the open web
#[derive(Parser, Debug)]
#[command(name = "triangulum", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Research a question and print a cited outline
    Research {
        /// The question to research
        query: String,
        /// Research mode: speed, balanced, quality
        #[arg(short, long)]
        mode: Option<ResearchMode>,
        /// Action budget (capped by the mode)
        #[arg(short, long)]
        budget: Option<usize>,
        /// Print the full outcome as JSON instead of markdown
        #[arg(long)]
        json: bool,
        /// Use local heuristics and embeddings instead of a model endpoint
        #[arg(long)]
        offline: bool,
    },
    /// Score one or more domains or URLs
    Credibility {
        /// Domains or URLs
        #[arg(required = true)]
        domains: Vec<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Group claims from a JSON file into shared, conflicting and unique clusters
    Triangulate {
        /// JSON array of {source_id, source_url, text}
        claims: PathBuf,
        /// Use local embeddings instead of a model endpoint
        #[arg(long)]
        offline: bool,
        /// Print JSON instead of markdown
        #[arg(long)]
        json: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "triangulum", "triangulum")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    // Without a usable log directory only the stderr layer is installed.
    let (json_layer, _guard, file_log_error) = match file_log_writer(&log_dir) {
        Ok((writer, guard)) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    if let Some(e) = file_log_error {
        tracing::warn!(
            path = %log_dir.display(),
            error = %e,
            "file logging disabled"
        );
    }

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace).await
}

/// Creates `log_dir` and opens a daily-rotated JSON log inside it.
fn file_log_writer(log_dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("triangulum.log")
        .build(log_dir)?;
    Ok(tracing_appender::non_blocking(appender))
}
