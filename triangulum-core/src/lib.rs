//! # Triangulum Core
//!
//! Core library for the Triangulum research assistant.
//! Provides the budgeted research controller, query planning, search
//! fan-out, fact extraction, evidence aggregation, document clustering,
//! outline synthesis, source credibility scoring and claim triangulation,
//! along with the model and web capability traits they run against.

pub mod brain;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod providers;
pub mod research;
pub mod types;
pub mod web;

// Re-export commonly used types at the crate root.
pub use brain::{ChatModel, MockChatModel};
pub use config::{ResearchConfig, ResearchMode, load_config};
pub use embeddings::{EmbeddingModel, LocalEmbedder};
pub use error::{Result, ResearchError};
pub use research::{
    ResearchController, ResearchEvent, ResearchOutcome, ResearchRequest, ResearchRun,
};
pub use research::synthesis::Outline;
pub use types::{Message, Role};
pub use web::{FetchedPage, SearchBackend, SearchHit, WebFetcher};
