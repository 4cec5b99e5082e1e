//! Concrete model providers.
//!
//! The research pipeline only sees [`ChatModel`](crate::brain::ChatModel) and
//! [`EmbeddingModel`](crate::embeddings::EmbeddingModel); this module holds the
//! adapters that talk to real endpoints.

pub mod openai_compat;

pub use openai_compat::{OpenAiChatModel, OpenAiEmbedder};
