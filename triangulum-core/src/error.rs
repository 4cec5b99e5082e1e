//! Error types for the Triangulum research core.
//!
//! Uses `thiserror` for public API error types. Only configuration failures
//! escape a research run; every other variant is recovered locally by the
//! component that observed it and recorded on the run outcome.

use std::path::PathBuf;

/// Top-level error type for the Triangulum core library.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from chat model invocations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Model invocation was cancelled")]
    Cancelled,
}

/// Errors from embedding model invocations.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {message}")]
    Request { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding was cancelled")]
    Cancelled,
}

/// Errors from a search backend call.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search request failed: {message}")]
    Request { message: String },

    #[error("Search response parse error: {message}")]
    Parse { message: String },

    #[error("Search was cancelled")]
    Cancelled,
}

/// Errors from fetching a single document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },

    #[error("Fetch failed for {url}: {message}")]
    Request { url: String, message: String },

    #[error("Fetch of {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("Fetch was cancelled")]
    Cancelled,

    #[error("Empty body for {url}")]
    EmptyBody { url: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required capability not configured: {capability}")]
    MissingCapability { capability: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `ResearchError`.
pub type Result<T> = std::result::Result<T, ResearchError>;
