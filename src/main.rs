//! Armitage CLI: control plane server, one-shot scans, and rule linting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use armitage::config::ServerConfig;
use armitage::logging::LogSink;
use armitage::scan::http::HttpOptions;
use armitage::scan::rules::RuleCorpus;
use armitage::scan::{ScanEngine, ScanOptions};
use armitage::server::store::Store;
use armitage::server::AppState;

#[derive(Parser)]
#[command(name = "armitage", version, about = "AI infrastructure red-team platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the task control plane.
    Serve {
        /// Config file path.
        #[arg(long, default_value = "armitage.toml")]
        config: PathBuf,
        /// Logs directory for rotated JSON logs.
        #[arg(long, default_value = "logs")]
        logs_dir: PathBuf,
    },
    /// Scan a target locally, without the control plane.
    Scan {
        /// Target base URL (scheme optional).
        #[arg(long)]
        target: String,
        /// Rule corpus directory.
        #[arg(long, default_value = "rules")]
        rules: PathBuf,
        /// Per-request timeout in seconds.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Concurrent fingerprint workers.
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
        /// Outbound proxy URL.
        #[arg(long)]
        proxy: Option<String>,
        /// Emit the full report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Rule corpus maintenance.
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
}

#[derive(Subcommand)]
enum RulesCommand {
    /// Parse every rule file and report failures.
    Check {
        /// Rule corpus directory.
        #[arg(long, default_value = "rules")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, logs_dir } => {
            let _guard = armitage::logging::init(LogSink::Daemon {
                dir: &logs_dir,
                service: "armitage",
            })?;
            serve(&config).await
        }
        Command::Scan {
            target,
            rules,
            timeout,
            concurrency,
            proxy,
            json,
        } => {
            let _guard = armitage::logging::init(LogSink::Console)?;
            scan(&target, &rules, timeout, concurrency, proxy, json).await
        }
        Command::Rules {
            command: RulesCommand::Check { dir },
        } => {
            let _guard = armitage::logging::init(LogSink::Console)?;
            rules_check(&dir)
        }
    }
}

async fn serve(config_path: &PathBuf) -> Result<()> {
    let config = ServerConfig::load_or_default(config_path)?;
    info!(config = %config_path.display(), "armitage control plane starting");

    let store = Store::open(&config.storage.db_path)
        .await
        .context("failed to open database")?;
    let state = AppState::new(config, store);
    armitage::server::run(state).await
}

async fn scan(
    target: &str,
    rules_dir: &PathBuf,
    timeout: u64,
    concurrency: usize,
    proxy: Option<String>,
    json: bool,
) -> Result<()> {
    let corpus = RuleCorpus::load_dir(rules_dir)
        .with_context(|| format!("failed to load rules from {}", rules_dir.display()))?;
    if corpus.is_empty() {
        warn!(dir = %rules_dir.display(), "no rules loaded");
    }
    info!(
        fingerprints = corpus.fingerprints.len(),
        advisories = corpus.advisories.len(),
        "rule corpus loaded"
    );

    let options = ScanOptions {
        http: HttpOptions {
            timeout: Duration::from_secs(timeout),
            proxy,
            ..HttpOptions::default()
        },
        concurrency,
    };
    let engine = ScanEngine::new(Arc::new(corpus), options);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = engine.scan(target, &cancel_rx).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("target: {}", report.target);
        println!(
            "components: {}  vulnerabilities: {}  score: {:.0}",
            report.total, report.vulnerabilities, report.score
        );
        for finding in &report.results {
            let version = if finding.version.is_empty() {
                "unknown version"
            } else {
                &finding.version
            };
            println!("  {} ({version})", finding.component);
            for advisory in &finding.advisories {
                println!(
                    "    [{}] {} {}",
                    advisory.severity.as_str(),
                    advisory.cve.as_deref().unwrap_or("-"),
                    advisory.summary
                );
            }
        }
    }

    if report.vulnerabilities > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn rules_check(dir: &PathBuf) -> Result<()> {
    let corpus = RuleCorpus::load_dir(dir)
        .with_context(|| format!("failed to read rule directory {}", dir.display()))?;
    println!(
        "loaded {} fingerprints, {} advisories",
        corpus.fingerprints.len(),
        corpus.advisories.len()
    );
    if corpus.load_errors.is_empty() {
        println!("all rule files parsed cleanly");
        Ok(())
    } else {
        for error in &corpus.load_errors {
            eprintln!("error: {error}");
        }
        anyhow::bail!("{} rule file(s) failed to parse", corpus.load_errors.len());
    }
}
