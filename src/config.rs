//! Analysis configuration loading and validation.
//!
//! Reads `rulescout.yaml`, resolving `${VAR}` / `${VAR:-default}` references
//! before parsing. Every section is optional; missing values fall back to
//! the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::mcp_client::{ClientTimeouts, RetryPolicy, ServerSpec};

// ─── Constants ───────────────────────────────────────────────────────────────

pub const CONFIG_FILE_NAME: &str = "rulescout.yaml";

/// Points directly at a config file, bypassing the upward search.
pub const CONFIG_PATH_ENV: &str = "RULESCOUT_CONFIG";

/// Fallback source for `llm.api_key`.
pub const API_KEY_ENV: &str = "RULESCOUT_API_KEY";

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "openai/gpt-4.1";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find rulescout.yaml above {}", .start.display())]
    NotFound { start: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level contents of `rulescout.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub llm: LlmSettings,
    /// Tool servers in declaration order. Empty means "filesystem server
    /// rooted at the target directory".
    pub servers: Vec<ServerSpec>,
    pub connection: ConnectionSettings,
    pub pipeline: PipelineSettings,
}

/// Model endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.5,
            max_tokens: 4096,
            request_timeout_secs: 120,
        }
    }
}

impl LlmSettings {
    /// The configured key, else `RULESCOUT_API_KEY`. Blank keys count as absent.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// Connection retry and timeout settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub call_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            call_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
        }
    }
}

impl ConnectionSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    pub fn client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            call: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Replaces every phase's step budget when set.
    pub max_steps: Option<u32>,
}

impl AnalysisConfig {
    /// Reject configs that cannot drive a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(invalid("server with empty name"));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(invalid(format!("duplicate server name '{}'", server.name)));
            }
            if server.command.trim().is_empty() {
                return Err(invalid(format!("server '{}' has an empty command", server.name)));
            }
        }
        if self.connection.max_attempts == 0 {
            return Err(invalid("connection.max_attempts must be at least 1"));
        }
        if self.pipeline.max_steps == Some(0) {
            return Err(invalid("pipeline.max_steps must be at least 1"));
        }
        if self.llm.base_url.trim().is_empty() {
            return Err(invalid("llm.base_url is empty"));
        }
        Ok(())
    }

    /// Configured servers, or the default filesystem server for `target_dir`.
    pub fn effective_servers(&self, target_dir: &Path) -> Vec<ServerSpec> {
        if self.servers.is_empty() {
            vec![default_filesystem_server(target_dir)]
        } else {
            self.servers.clone()
        }
    }
}

/// `npx -y @modelcontextprotocol/server-filesystem <target_dir>`.
pub fn default_filesystem_server(target_dir: &Path) -> ServerSpec {
    let dir = target_dir.display().to_string();
    ServerSpec::new(
        "filesystem",
        "npx",
        &["-y", "@modelcontextprotocol/server-filesystem", dir.as_str()],
    )
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `rulescout.yaml`.
///
/// Search order:
/// 1. `RULESCOUT_CONFIG` env var
/// 2. Walk upward from `start` looking for `rulescout.yaml`
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_PATH_ENV} does not name a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound {
        start: start.to_path_buf(),
    })
}

/// Read, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<AnalysisConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&raw)?;
    tracing::debug!(
        path = %path.display(),
        servers = config.servers.len(),
        model = %config.llm.model,
        "config loaded"
    );
    Ok(config)
}

/// Parse config text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<AnalysisConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: AnalysisConfig = if interpolated.trim().is_empty() {
        AnalysisConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.llm.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.llm.model, "openai/gpt-4.1");
        assert_eq!(config.llm.temperature, 0.5);
        assert_eq!(config.connection.max_attempts, 3);
        assert!(config.servers.is_empty());
        assert!(config.pipeline.max_steps.is_none());
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
llm:
  model: anthropic/claude-sonnet-4
  temperature: 0.2
servers:
  - name: filesystem
    command: npx
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/srv/app"]
  - name: git
    command: uvx
    args: ["mcp-server-git"]
    env: {GIT_DIR: /srv/app/.git}
    enabled: false
connection:
  max_attempts: 5
  base_delay_ms: 250
pipeline:
  max_steps: 12
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.llm.model, "anthropic/claude-sonnet-4");
        assert_eq!(config.llm.max_tokens, 4096);
        assert_eq!(config.servers.len(), 2);
        assert!(!config.servers[1].enabled);
        assert_eq!(config.servers[1].env["GIT_DIR"], "/srv/app/.git");
        assert_eq!(
            config.connection.retry_policy(),
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(250),
            }
        );
        assert_eq!(config.connection.client_timeouts().call, Duration::from_secs(30));
        assert_eq!(config.pipeline.max_steps, Some(12));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        let result = interpolate_env_vars("key: ${RULESCOUT_TEST_SURELY_UNSET:-fallback}");
        assert_eq!(result, "key: fallback");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("RULESCOUT_TEST_INTERP", "sk-123");
        let result = interpolate_env_vars("api_key: ${RULESCOUT_TEST_INTERP}");
        assert_eq!(result, "api_key: sk-123");
        std::env::remove_var("RULESCOUT_TEST_INTERP");
    }

    #[test]
    fn test_interpolate_no_vars() {
        assert_eq!(interpolate_env_vars("plain: $HOME text"), "plain: $HOME text");
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/projects");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/projects"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let yaml = "servers:\n  - {name: fs, command: a}\n  - {name: fs, command: b}\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate server name 'fs'"));
    }

    #[test]
    fn test_zero_budgets_rejected() {
        assert!(parse_config("connection:\n  max_attempts: 0\n").is_err());
        assert!(parse_config("pipeline:\n  max_steps: 0\n").is_err());
        assert!(parse_config("servers:\n  - {name: fs, command: ''}\n").is_err());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_config("llm: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_default_server_targets_directory() {
        let config = AnalysisConfig::default();
        let servers = config.effective_servers(Path::new("/srv/app"));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "filesystem");
        assert_eq!(servers[0].command, "npx");
        assert_eq!(servers[0].args.last().map(String::as_str), Some("/srv/app"));
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let settings = LlmSettings {
            api_key: Some("sk-explicit".into()),
            ..LlmSettings::default()
        };
        assert_eq!(settings.resolved_api_key().as_deref(), Some("sk-explicit"));
    }

    #[test]
    fn test_find_and_load_walks_upward() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            root.path().join(CONFIG_FILE_NAME),
            "llm:\n  model: test/model\n",
        )
        .unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, root.path().join(CONFIG_FILE_NAME));
        let config = load_config(&found).unwrap();
        assert_eq!(config.llm.model, "test/model");
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
