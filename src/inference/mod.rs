//! Inference client: the model handle driven by the analysis pipeline.
//!
//! This module handles:
//! - Non-streaming chat completions against an OpenAI-compatible endpoint
//! - Native JSON tool call parsing
//!
//! The pipeline only sees the `ChatModel` trait, so tests drive it with
//! scripted models and the endpoint stays a config change.

pub mod client;
pub mod errors;
pub mod parse;
pub mod types;

use async_trait::async_trait;

// Re-exports for convenience
pub use client::InferenceClient;
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelTurn, Role, ToolCall, ToolDefinition};

/// Something that can take one conversational turn.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelTurn, InferenceError>;
}
