//! Configuration loading and validation.
//!
//! The control plane reads `armitage.toml`; every knob has a default so an
//! empty file (or no file) boots a usable local instance. Secrets and
//! deployment-specific URLs come from the environment, loaded via `dotenvy`
//! in the binary.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Task admission limits.
    #[serde(default)]
    pub tasks: TaskLimitsConfig,

    /// Scan engine defaults used by the `scan` subcommand and rule checks.
    #[serde(default)]
    pub scanner: ScannerConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind address for the REST/SSE/WebSocket server.
    #[serde(default = "default_bind_addr")]
    pub addr: String,

    /// Username assumed when the auth proxy header is absent.
    #[serde(default = "default_anonymous_user")]
    pub default_user: String,

    /// Header carrying the authenticated username, set by an upstream proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: default_bind_addr(),
            default_user: default_anonymous_user(),
            user_header: default_user_header(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory for uploaded attachments.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            uploads_dir: default_uploads_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Task admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskLimitsConfig {
    /// Maximum live (non-terminal) sessions per user.
    #[serde(default = "default_max_live_sessions")]
    pub max_live_sessions_per_user: u32,

    /// Seconds an agent has to emit `end` after a cancel frame.
    #[serde(default = "default_cancel_deadline_secs")]
    pub cancel_deadline_secs: u64,
}

impl Default for TaskLimitsConfig {
    fn default() -> Self {
        Self {
            max_live_sessions_per_user: default_max_live_sessions(),
            cancel_deadline_secs: default_cancel_deadline_secs(),
        }
    }
}

/// Scan engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Directory holding `fingerprints/` and `advisories/` rule files.
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,

    /// Per-request timeout in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry budget for transient probe failures.
    #[serde(default = "default_probe_retries")]
    pub retries: u32,

    /// Concurrent fingerprint workers per scan.
    #[serde(default = "default_scan_concurrency")]
    pub concurrency: usize,

    /// Optional outbound proxy URL (http, https, or socks5).
    #[serde(default)]
    pub proxy: Option<String>,

    /// Accept invalid TLS certificates on probed targets. Scan targets are
    /// frequently self-signed lab deployments, so this defaults on.
    #[serde(default = "default_true")]
    pub insecure_skip_verify: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            timeout_secs: default_probe_timeout_secs(),
            retries: default_probe_retries(),
            concurrency: default_scan_concurrency(),
            proxy: None,
            insecure_skip_verify: default_true(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {e}", path.display())
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load from a file when it exists, defaults otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_anonymous_user() -> String {
    "local".to_owned()
}

fn default_user_header() -> String {
    "x-user".to_owned()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("armitage.db")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_upload_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_max_live_sessions() -> u32 {
    8
}

fn default_cancel_deadline_secs() -> u64 {
    30
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_probe_retries() -> u32 {
    3
}

fn default_scan_concurrency() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ServerConfig = toml::from_str("").expect("should parse");
        assert_eq!(config.listen.addr, "127.0.0.1:8787");
        assert_eq!(config.tasks.cancel_deadline_secs, 30);
        assert_eq!(config.scanner.concurrency, 10);
        assert!(config.scanner.insecure_skip_verify);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listen]
            addr = "0.0.0.0:9000"

            [scanner]
            retries = 1
            proxy = "socks5://127.0.0.1:1080"
            "#,
        )
        .expect("should parse");
        assert_eq!(config.listen.addr, "0.0.0.0:9000");
        assert_eq!(config.scanner.retries, 1);
        assert_eq!(
            config.scanner.proxy.as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert_eq!(config.storage.db_path, PathBuf::from("armitage.db"));
    }
}
