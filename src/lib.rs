//! rulescout: extract business rules from a source tree by driving a
//! tool-calling model over MCP servers.
//!
//! The flow of one run: the `ConnectionSupervisor` connects the configured
//! servers, the `ToolAggregator` merges their tools, and the
//! `SequentialAnalysisPipeline` runs its phases against them. The supervisor
//! and telemetry are torn down whatever the outcome.

pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use config::{AnalysisConfig, ConfigError};
use inference::{ChatModel, InferenceClient, InferenceError};
use mcp_client::{ConnectionSupervisor, McpError, StdioConnector, ToolAggregator};
use pipeline::{
    default_phases, seed_prompt, with_step_override, BufferedTelemetry, PhaseResult,
    PipelineError, SequentialAnalysisPipeline, Telemetry,
};

/// Log file written under the directory passed to [`init_tracing`].
pub const LOG_FILE_NAME: &str = "analysis.log";

/// Rotated log files kept next to the current one.
const LOG_FILES_KEPT: u32 = 3;

/// What to analyze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub target_dir: PathBuf,
    /// Free-form notes folded into the seed prompt.
    pub context: Option<String>,
    /// Replaces every phase's step budget; falls back to `pipeline.max_steps`.
    pub max_steps: Option<u32>,
}

impl AnalysisRequest {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            context: None,
            max_steps: None,
        }
    }
}

/// Errors that end a run before or during analysis.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Every configured server failed or was disabled.
    #[error("no MCP server available ({})", format_failures(.failures))]
    NoServersAvailable { failures: Vec<(String, McpError)> },
}

fn format_failures(failures: &[(String, McpError)]) -> String {
    if failures.is_empty() {
        return "none enabled".to_string();
    }
    failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run one analysis end to end and return the final phase's result.
pub async fn run_analysis(
    config: &AnalysisConfig,
    request: &AnalysisRequest,
) -> Result<PhaseResult, RunError> {
    config.validate()?;
    let model = InferenceClient::from_settings(&config.llm)?;

    let connector = Arc::new(StdioConnector::new(config.connection.client_timeouts()));
    let mut supervisor = ConnectionSupervisor::new(
        config.effective_servers(&request.target_dir),
        connector,
        config.connection.retry_policy(),
    );

    let max_steps = request.max_steps.or(config.pipeline.max_steps);
    let pipeline = SequentialAnalysisPipeline::new(with_step_override(default_phases(), max_steps))?;
    let telemetry = BufferedTelemetry::start();

    tracing::info!(
        target_dir = %request.target_dir.display(),
        model = %model.model(),
        run_id = %telemetry.run_id(),
        "analysis starting"
    );

    analyze(&mut supervisor, &pipeline, request, &model, &telemetry).await
}

/// Connect, run the pipeline, and always tear down afterwards.
async fn analyze(
    supervisor: &mut ConnectionSupervisor,
    pipeline: &SequentialAnalysisPipeline,
    request: &AnalysisRequest,
    model: &dyn ChatModel,
    telemetry: &dyn Telemetry,
) -> Result<PhaseResult, RunError> {
    let report = supervisor.initialize().await;

    let result = if report.connected.is_empty() {
        Err(RunError::NoServersAvailable {
            failures: report.failed,
        })
    } else {
        // Servers that connected without a catalog get one more fetch.
        for (server, e) in supervisor.health_check().await {
            tracing::warn!(server = %server, error = %e, "server lost before analysis");
        }
        let seed = seed_prompt(&request.target_dir, request.context.as_deref());
        let tools = ToolAggregator::new(supervisor);
        pipeline
            .run(&seed, &tools, model, telemetry)
            .await
            .map_err(RunError::from)
    };

    telemetry.shutdown().await;
    for (server, e) in supervisor.shutdown().await {
        tracing::warn!(server = %server, error = %e, "error while closing server");
    }

    match &result {
        Ok(final_result) => tracing::info!(
            steps_used = final_result.steps_used,
            text_len = final_result.text.len(),
            "analysis finished"
        ),
        Err(e) => tracing::error!(error = %e, "analysis failed"),
    }
    result
}

/// Install the global tracing subscriber.
///
/// With a log directory, rotates `analysis.log` (keeping the last 3) and
/// writes through a line-flushing writer; without one, logs go to stderr.
/// `RUST_LOG` overrides the default filter. Calling it again is a no-op.
pub fn init_tracing(log_dir: Option<&Path>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rulescout=info,warn"));

    let log_file = log_dir.and_then(|dir| open_log_file(dir).ok());
    let installed = match log_file {
        Some(file) => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(FlushingWriter::new(file))
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .is_ok(),
        None => fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_dir = ?log_dir,
            pid = std::process::id(),
            "=== rulescout starting ==="
        );
    }
}

fn open_log_file(dir: &Path) -> std::io::Result<std::fs::File> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&path, LOG_FILES_KEPT);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
}

/// Rotate log files: `analysis.log` → `analysis.log.1` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A `std::fs::File` writer that flushes after every write, so each log
/// line is on disk even if the process dies mid-run.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
