//! Molly worker daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use armitage::scan::http::HttpOptions;
use armitage::scan::rules::CorpusHandle;
use armitage::scan::ScanOptions;
use molly::config::WorkerConfig;
use molly::handlers::external::ExternalHandler;
use molly::handlers::infra_scan::InfraScanHandler;
use molly::handlers::HandlerRegistry;

#[derive(Parser)]
#[command(name = "molly", version, about = "Armitage worker agent")]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "molly.toml")]
    config: PathBuf,

    /// Logs directory for rotated JSON logs.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = armitage::logging::init(armitage::logging::LogSink::Daemon {
        dir: &cli.logs_dir,
        service: "molly",
    })?;

    let config = WorkerConfig::load_or_default(&cli.config)?;

    let corpus = Arc::new(
        CorpusHandle::load(&config.scanner.rules_dir).context("failed to load rule corpus")?,
    );
    if corpus.current().fingerprints.is_empty() {
        tracing::warn!(
            dir = %config.scanner.rules_dir.display(),
            "no fingerprint rules loaded; aiinfra_scan will report no_rules_loaded"
        );
    }
    spawn_reload_on_sighup(Arc::clone(&corpus));

    let scan_options = ScanOptions {
        http: HttpOptions {
            timeout: Duration::from_secs(config.scanner.timeout_secs),
            retries: config.scanner.retries,
            proxy: config.scanner.proxy.clone(),
            ..HttpOptions::default()
        },
        concurrency: config.scanner.concurrency,
    };

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(InfraScanHandler::new(corpus, scan_options)));
    for section in &config.external {
        match ExternalHandler::from_config(section) {
            Ok(handler) => handlers.register(Arc::new(handler)),
            Err(err) => tracing::warn!(kind = %section.kind, error = %err, "skipping external pipeline"),
        }
    }

    molly::connection::run(config, Arc::new(handlers)).await
}

/// Reload the rule corpus on SIGHUP without restarting the worker.
fn spawn_reload_on_sighup(corpus: Arc<CorpusHandle>) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hangup.recv().await.is_some() {
            match corpus.reload() {
                Ok((fingerprints, advisories)) => {
                    tracing::info!(fingerprints, advisories, "rule corpus reloaded");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rule corpus reload failed, keeping old corpus");
                }
            }
        }
    });
    #[cfg(not(unix))]
    drop(corpus);
}
