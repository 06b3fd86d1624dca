//! Worker configuration loading.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level worker configuration (`molly.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Connection and concurrency settings.
    #[serde(default)]
    pub agent: AgentSection,

    /// Scan engine settings for the built-in `aiinfra_scan` handler.
    #[serde(default)]
    pub scanner: ScannerSection,

    /// External analysis pipelines, one per task kind.
    #[serde(default)]
    pub external: Vec<ExternalSection>,
}

/// Connection and concurrency settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Control plane WebSocket URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Concurrent tasks this worker accepts.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,

    /// Optional fixed agent id; generated from the hostname otherwise.
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            max_concurrent_tasks: default_max_concurrent(),
            agent_id: None,
        }
    }
}

/// Scan engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSection {
    /// Directory holding `fingerprints/` and `advisories/`.
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry budget for transient probe failures.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Concurrent fingerprint workers per scan.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Optional outbound proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for ScannerSection {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            concurrency: default_concurrency(),
            proxy: None,
        }
    }
}

/// One external analysis pipeline.
///
/// The command is spawned per task; `{content}` in an argument is replaced
/// with the task's content. The tool must print its result as a final JSON
/// line on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalSection {
    /// Task kind the pipeline serves (e.g. `mcp_scan`).
    pub kind: String,

    /// Executable to spawn.
    pub command: String,

    /// Arguments; `{content}` is substituted.
    #[serde(default)]
    pub args: Vec<String>,

    /// Kill the pipeline after this many seconds.
    #[serde(default = "default_external_timeout")]
    pub timeout_secs: u64,
}

impl WorkerConfig {
    /// Load configuration from a TOML file, defaults when it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", path.display())
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8787/ws/agent".to_owned()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    10
}

fn default_external_timeout() -> u64 {
    1800
}
