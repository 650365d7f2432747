//! Sequential analysis pipeline: phased, tool-calling business-rule extraction.
//!
//! This module handles:
//! - Phase definitions and prompt threading between phases (`phases`)
//! - The per-phase tool-calling loop and fail-fast abort (`runner`)
//! - Accumulated phase results for one run (`context`)
//! - Run telemetry, flushed between phases (`telemetry`)

pub mod context;
pub mod errors;
pub mod phases;
pub mod runner;
pub mod telemetry;

// Re-exports for convenience
pub use context::{PhaseResult, PipelineContext};
pub use errors::{PhaseFailure, PipelineError};
pub use phases::{default_phases, seed_prompt, with_step_override, PhaseSpec};
pub use runner::{SequentialAnalysisPipeline, ToolDispatcher};
pub use telemetry::{BufferedTelemetry, NoopTelemetry, Telemetry, TelemetryError, TelemetryKind};
