//! Pipeline error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// The call that broke a phase.
#[derive(Debug, Error)]
pub enum PhaseFailure {
    #[error("model call failed: {0}")]
    Model(#[from] InferenceError),

    #[error("tool call failed: {0}")]
    Tool(#[from] McpError),
}

/// Errors that end an analysis run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A phase's model or tool call failed. Later phases never ran.
    #[error("phase {phase_index} ('{phase}') aborted after {steps_used} steps: {source}")]
    Aborted {
        phase_index: usize,
        phase: String,
        steps_used: u32,
        source: PhaseFailure,
    },

    /// The phase list cannot be run.
    #[error("invalid pipeline: {reason}")]
    InvalidPhases { reason: String },
}

impl PipelineError {
    /// Index of the failing phase, if a phase failed.
    pub fn phase_index(&self) -> Option<usize> {
        match self {
            PipelineError::Aborted { phase_index, .. } => Some(*phase_index),
            PipelineError::InvalidPhases { .. } => None,
        }
    }
}
