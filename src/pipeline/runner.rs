//! Sequential analysis pipeline.
//!
//! Runs phases strictly in order. Each phase is a tool-calling loop: the
//! model proposes tool calls, they are dispatched one at a time, and the
//! results go back into the same conversation until the model emits the
//! phase's stop sequence or the step budget runs out. Any model or tool
//! failure aborts the whole run; nothing is retried here.

use async_trait::async_trait;

use super::context::{PhaseResult, PipelineContext};
use super::errors::{PhaseFailure, PipelineError};
use super::phases::{default_phases, PhaseSpec};
use super::telemetry::{Telemetry, TelemetryKind};
use crate::inference::{ChatMessage, ChatModel, ToolDefinition};
use crate::mcp_client::{McpError, ToolCallOutcome};

/// Tool output longer than this is truncated before it reaches the model.
const MAX_TOOL_OUTPUT_BYTES: usize = 32 * 1024;

/// The tool namespace as the pipeline sees it.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Current tool set; re-read before every model turn.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError>;
}

pub struct SequentialAnalysisPipeline {
    phases: Vec<PhaseSpec>,
}

impl SequentialAnalysisPipeline {
    /// Build a pipeline. Rejects an empty phase list, zero budgets and
    /// blank stop sequences.
    pub fn new(phases: Vec<PhaseSpec>) -> Result<Self, PipelineError> {
        if phases.is_empty() {
            return Err(PipelineError::InvalidPhases {
                reason: "no phases".into(),
            });
        }
        for phase in &phases {
            if phase.max_steps == 0 {
                return Err(PipelineError::InvalidPhases {
                    reason: format!("phase '{}' has a zero step budget", phase.name),
                });
            }
            if phase.stop_sequence.trim().is_empty() {
                return Err(PipelineError::InvalidPhases {
                    reason: format!("phase '{}' has an empty stop sequence", phase.name),
                });
            }
        }
        Ok(Self { phases })
    }

    pub fn with_default_phases() -> Self {
        Self {
            phases: default_phases(),
        }
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Run every phase and return the last phase's result.
    pub async fn run(
        &self,
        seed: &str,
        tools: &dyn ToolDispatcher,
        model: &dyn ChatModel,
        telemetry: &dyn Telemetry,
    ) -> Result<PhaseResult, PipelineError> {
        let context = self.run_collecting(seed, tools, model, telemetry).await?;
        context.into_final().ok_or(PipelineError::InvalidPhases {
            reason: "no phases".into(),
        })
    }

    /// Run every phase, keeping each phase's result.
    pub async fn run_collecting(
        &self,
        seed: &str,
        tools: &dyn ToolDispatcher,
        model: &dyn ChatModel,
        telemetry: &dyn Telemetry,
    ) -> Result<PipelineContext, PipelineError> {
        let mut context = PipelineContext::new();

        for (index, phase) in self.phases.iter().enumerate() {
            let prompt = if index == 0 {
                seed.to_string()
            } else {
                phase.render_prompt(context.previous_text())
            };

            tracing::info!(
                phase_index = index,
                phase = %phase.name,
                max_steps = phase.max_steps,
                "phase started"
            );
            telemetry.record(TelemetryKind::PhaseStarted {
                phase_index: index,
                phase: phase.name.clone(),
            });

            let run = PhaseRun {
                index,
                phase,
                tools,
                model,
                telemetry,
            };
            let (result, stopped) = match run.execute(prompt).await {
                Ok(done) => done,
                Err((steps_used, source)) => {
                    tracing::error!(
                        phase_index = index,
                        phase = %phase.name,
                        steps_used,
                        error = %source,
                        "phase aborted"
                    );
                    return Err(PipelineError::Aborted {
                        phase_index: index,
                        phase: phase.name.clone(),
                        steps_used,
                        source,
                    });
                }
            };

            tracing::info!(
                phase_index = index,
                phase = %phase.name,
                steps_used = result.steps_used,
                stopped,
                text_len = result.text.len(),
                "phase finished"
            );
            telemetry.record(TelemetryKind::PhaseFinished {
                phase_index: index,
                phase: phase.name.clone(),
                steps_used: result.steps_used,
                stopped,
            });
            if let Err(e) = telemetry.flush().await {
                tracing::warn!(phase_index = index, error = %e, "telemetry flush failed");
            }

            context.push(result);
        }

        Ok(context)
    }
}

/// One phase's tool-calling loop.
struct PhaseRun<'r> {
    index: usize,
    phase: &'r PhaseSpec,
    tools: &'r dyn ToolDispatcher,
    model: &'r dyn ChatModel,
    telemetry: &'r dyn Telemetry,
}

impl PhaseRun<'_> {
    /// Returns the result and whether the stop sequence was seen, or the
    /// steps completed before the failure.
    async fn execute(&self, prompt: String) -> Result<(PhaseResult, bool), (u32, PhaseFailure)> {
        let stop = self.phase.stop_sequence.as_str();
        let mut messages = vec![
            ChatMessage::system(self.phase.system_message()),
            ChatMessage::user(prompt),
        ];
        let mut texts: Vec<String> = Vec::new();
        let mut steps: u32 = 0;
        let mut stopped = false;

        while steps < self.phase.max_steps {
            let definitions = self.tools.tool_definitions();
            let turn = self
                .model
                .complete(&messages, &definitions)
                .await
                .map_err(|e| (steps, PhaseFailure::Model(e)))?;
            steps += 1;

            tracing::debug!(
                phase_index = self.index,
                step = steps,
                tool_calls = turn.tool_calls.len(),
                "model turn"
            );
            self.telemetry.record(TelemetryKind::ModelTurn {
                phase_index: self.index,
                step: steps,
                tool_calls: turn.tool_calls.len(),
            });

            let text = turn.text.unwrap_or_default();
            if let Some(pos) = text.find(stop) {
                push_text(&mut texts, &text[..pos]);
                stopped = true;
                break;
            }
            push_text(&mut texts, &text);

            if turn.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(Some(text), &[]));
                messages.push(ChatMessage::user(self.phase.continuation_nudge()));
                continue;
            }

            let content = (!text.trim().is_empty()).then_some(text);
            messages.push(ChatMessage::assistant(content, &turn.tool_calls));
            for call in &turn.tool_calls {
                let outcome = self
                    .tools
                    .dispatch(&call.name, call.arguments.clone())
                    .await
                    .map_err(|e| (steps, PhaseFailure::Tool(e)))?;

                tracing::debug!(
                    phase_index = self.index,
                    step = steps,
                    tool = %call.name,
                    server = %outcome.server,
                    is_error = outcome.is_error,
                    execution_time_ms = outcome.execution_time_ms,
                    "tool call finished"
                );
                self.telemetry.record(TelemetryKind::ToolCall {
                    phase_index: self.index,
                    tool: call.name.clone(),
                    server: outcome.server.clone(),
                    is_error: outcome.is_error,
                    execution_time_ms: outcome.execution_time_ms,
                });
                messages.push(ChatMessage::tool(&call.id, render_outcome(&outcome)));
            }
        }

        if !stopped {
            tracing::info!(
                phase_index = self.index,
                phase = %self.phase.name,
                steps,
                "step budget exhausted, keeping partial text"
            );
        }

        let result = PhaseResult {
            text: texts.join("\n").trim().to_string(),
            steps_used: steps,
        };
        Ok((result, stopped))
    }
}

fn push_text(texts: &mut Vec<String>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        texts.push(text.to_string());
    }
}

/// Tool outcome as fed back to the model.
fn render_outcome(outcome: &ToolCallOutcome) -> String {
    let content = if outcome.content.len() > MAX_TOOL_OUTPUT_BYTES {
        format!(
            "{}\n... (truncated, {} bytes total)",
            truncate_utf8(&outcome.content, MAX_TOOL_OUTPUT_BYTES),
            outcome.content.len()
        )
    } else {
        outcome.content.clone()
    };
    if outcome.is_error {
        format!("Error: {content}")
    } else {
        content
    }
}

/// Longest prefix of `s` within `max_bytes` that ends on a char boundary.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
