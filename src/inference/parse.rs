//! Chat completion response parsing.
//!
//! Only the native OpenAI JSON tool-call format is understood: calls arrive
//! in `choices[0].message.tool_calls` with JSON-encoded argument strings.

use serde::Deserialize;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{ModelTurn, ToolCall};

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    /// Reasoning models put chain-of-thought here; ignored.
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse a non-streaming chat completion body into a `ModelTurn`.
pub fn parse_completion_response(body: &str) -> Result<ModelTurn, InferenceError> {
    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseParse {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseParse {
            reason: "empty choices array".into(),
        })?;

    let text = choice.message.content.filter(|c| !c.is_empty());

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            parse_tool_call(
                tc.id.as_deref(),
                &tc.function.name,
                tc.function.arguments.as_deref().unwrap_or_default(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ModelTurn {
        text,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

/// Build a `ToolCall` from wire fields.
///
/// A missing id becomes `call_<uuid>`; blank arguments mean `{}`.
pub fn parse_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    if name.trim().is_empty() {
        return Err(InferenceError::ToolCallParse {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(arguments_json).map_err(|e| InferenceError::ToolCallParse {
            raw_response: arguments_json.to_string(),
            reason: format!("invalid JSON arguments for '{name}': {e}"),
        })?
    };

    let id = id
        .filter(|id| !id.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    Ok(ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
