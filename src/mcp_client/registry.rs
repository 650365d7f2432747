//! Tool aggregation: one flat namespace over every connected server.
//!
//! The aggregator owns nothing. Each `get_tools` call reads the supervisor's
//! current `Connected` catalogs, so the namespace always reflects live
//! connection state. Name collisions resolve to the server that connected
//! last; that overwrite is intentional and only logged at debug level.

use std::collections::HashMap;

use async_trait::async_trait;

use super::errors::McpError;
use super::lifecycle::ConnectionSupervisor;
use super::types::{ToolCallOutcome, ToolDescriptor};
use crate::inference::types::{FunctionDefinition, ToolDefinition};
use crate::pipeline::ToolDispatcher;

/// Suggestions offered when a tool name does not resolve.
const MAX_SUGGESTIONS: usize = 3;

/// Minimum similarity for a name to be suggested.
const SUGGESTION_FLOOR: f64 = 0.4;

pub struct ToolAggregator<'a> {
    supervisor: &'a ConnectionSupervisor,
}

impl<'a> ToolAggregator<'a> {
    pub fn new(supervisor: &'a ConnectionSupervisor) -> Self {
        Self { supervisor }
    }

    /// Qualified name → descriptor across all `Connected` servers.
    pub fn get_tools(&self) -> HashMap<String, ToolDescriptor> {
        let mut tools: HashMap<String, ToolDescriptor> = HashMap::new();
        for (server, catalog) in self.supervisor.connected_catalogs() {
            for tool in catalog {
                if let Some(previous) = tools.insert(tool.qualified_name.clone(), tool.clone()) {
                    tracing::debug!(
                        tool = %tool.qualified_name,
                        from = %previous.owner_server,
                        to = %server,
                        "tool name collision, later connection wins"
                    );
                }
            }
        }
        tools
    }

    /// Tools in OpenAI function-calling form, sorted by name.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDescriptor> = self.get_tools().into_values().collect();
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools.into_iter().map(to_tool_definition).collect()
    }

    /// Resolve `name` and invoke it on its owning server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError> {
        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        let owner = {
            let tools = self.get_tools();
            validate_tool_call(&tools, name, &arguments)?.owner_server.clone()
        };

        let client = self
            .supervisor
            .client(&owner)
            .ok_or(McpError::NotConnected { name: owner.clone() })?;

        tracing::debug!(tool = name, server = %owner, "dispatching tool call");
        client.call_tool(name, arguments).await
    }
}

#[async_trait]
impl<'a> ToolDispatcher for ToolAggregator<'a> {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        ToolAggregator::tool_definitions(self)
    }

    /// Argument problems go back to the model as error-flagged outcomes so
    /// it can correct itself; everything else propagates.
    async fn dispatch(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallOutcome, McpError> {
        match self.call_tool(name, arguments).await {
            Err(McpError::InvalidArguments { tool, reason }) => Ok(ToolCallOutcome {
                tool_name: tool,
                server: String::new(),
                content: format!("invalid arguments: {reason}"),
                is_error: true,
                execution_time_ms: 0,
            }),
            other => other,
        }
    }
}

fn to_tool_definition(tool: ToolDescriptor) -> ToolDefinition {
    ToolDefinition {
        r#type: "function".to_string(),
        function: FunctionDefinition {
            name: tool.qualified_name,
            description: tool.description.unwrap_or_default(),
            parameters: tool.input_schema,
        },
    }
}

/// Check the tool exists and its required top-level fields are present.
///
/// Full JSON Schema validation is left to the server.
pub fn validate_tool_call<'t>(
    tools: &'t HashMap<String, ToolDescriptor>,
    name: &str,
    arguments: &serde_json::Value,
) -> Result<&'t ToolDescriptor, McpError> {
    let Some(tool) = tools.get(name) else {
        return Err(McpError::ToolNotFound {
            name: name.to_string(),
            suggestions: find_similar(tools.keys(), name, MAX_SUGGESTIONS),
        });
    };

    let required = tool
        .input_schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let provided = arguments.as_object();
    for field in required.iter().filter_map(|f| f.as_str()) {
        if !provided.is_some_and(|obj| obj.contains_key(field)) {
            return Err(McpError::InvalidArguments {
                tool: name.to_string(),
                reason: format!("missing required field: '{field}'"),
            });
        }
    }

    Ok(tool)
}

/// Up to `max_results` known names closest to `name`, best first.
pub fn find_similar<'n>(
    known: impl Iterator<Item = &'n String>,
    name: &str,
    max_results: usize,
) -> Vec<String> {
    let mut scored: Vec<(String, f64)> = known
        .map(|candidate| (candidate.clone(), similarity(name, candidate)))
        .filter(|(_, score)| *score >= SUGGESTION_FLOOR)
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(max_results);
    scored.into_iter().map(|(name, _)| name).collect()
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein distance over chars, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// 1.0 for identical strings, 0.0 for nothing in common.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
