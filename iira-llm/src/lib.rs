//! Ollama client for IIRA.
//!
//! Pure HTTP client: text generation for planning and parameter extraction,
//! embeddings for retrieval. Every call goes through a bounded retry policy.

mod client;
mod error;
mod json;
mod retry;
mod types;

pub use client::OllamaClient;
pub use error::{LlmError, Result};
pub use json::{extract_json_object, parse_json_object};
pub use retry::RetryPolicy;
pub use types::{EmbeddingRequest, EmbeddingResponse, GenerateRequest, GenerateResponse};
