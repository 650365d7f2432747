//! Run telemetry.
//!
//! An explicitly owned sink, started once per run and torn down by the
//! caller. `BufferedTelemetry` holds events until `flush`, which exports
//! them as structured `tracing` events on the `telemetry` target.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry export failed: {reason}")]
    Export { reason: String },
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryKind {
    PhaseStarted {
        phase_index: usize,
        phase: String,
    },
    PhaseFinished {
        phase_index: usize,
        phase: String,
        steps_used: u32,
        /// `false` when the step budget ran out first.
        stopped: bool,
    },
    ModelTurn {
        phase_index: usize,
        step: u32,
        tool_calls: usize,
    },
    ToolCall {
        phase_index: usize,
        tool: String,
        server: String,
        is_error: bool,
        execution_time_ms: u64,
    },
}

/// One exported record: the kind's fields flattened next to the run id and
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TelemetryKind,
}

/// Telemetry sink handed to the pipeline.
#[async_trait]
pub trait Telemetry: Send + Sync {
    fn record(&self, kind: TelemetryKind);

    /// Export everything recorded so far.
    async fn flush(&self) -> Result<(), TelemetryError>;

    /// Final flush, then stop accepting events. Idempotent.
    async fn shutdown(&self);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

#[async_trait]
impl Telemetry for NoopTelemetry {
    fn record(&self, _kind: TelemetryKind) {}

    async fn flush(&self) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// Buffers events in memory and exports them through `tracing`.
#[derive(Debug)]
pub struct BufferedTelemetry {
    run_id: Uuid,
    buffer: StdMutex<Vec<TelemetryEvent>>,
    exported: AtomicU64,
    closed: AtomicBool,
}

impl BufferedTelemetry {
    /// Start telemetry for a new run.
    pub fn start() -> Self {
        let run_id = Uuid::new_v4();
        tracing::info!(target: "telemetry", %run_id, "telemetry started");
        Self {
            run_id,
            buffer: StdMutex::new(Vec::new()),
            exported: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Events recorded but not yet flushed.
    pub fn pending(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Events exported so far.
    pub fn exported(&self) -> u64 {
        self.exported.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Telemetry for BufferedTelemetry {
    fn record(&self, kind: TelemetryKind) {
        if self.is_shut_down() {
            return;
        }
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push(TelemetryEvent {
                run_id: self.run_id,
                timestamp: Utc::now(),
                kind,
            });
        }
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        if self.is_shut_down() {
            return Ok(());
        }
        let events = {
            let mut buffer = self.buffer.lock().map_err(|_| TelemetryError::Export {
                reason: "event buffer poisoned".into(),
            })?;
            std::mem::take(&mut *buffer)
        };

        for event in &events {
            let payload = serde_json::to_string(event).map_err(|e| TelemetryError::Export {
                reason: e.to_string(),
            })?;
            tracing::info!(target: "telemetry", event = %payload, "telemetry event");
        }
        self.exported.fetch_add(events.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.is_shut_down() {
            return;
        }
        if let Err(e) = self.flush().await {
            tracing::warn!(target: "telemetry", error = %e, "final telemetry flush failed");
        }
        self.closed.store(true, Ordering::SeqCst);
        tracing::info!(
            target: "telemetry",
            run_id = %self.run_id,
            exported = self.exported(),
            "telemetry shut down"
        );
    }
}
