//! End-to-end engine tests against a local HTTP target.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use armitage::scan::rules::RuleCorpus;
use armitage::scan::{ScanEngine, ScanError, ScanOptions};

/// Serve a router on an ephemeral port.
async fn spawn_target(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind target listener");
    let addr = listener.local_addr().expect("should read local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Corpus with an mlflow fingerprint (version from `/version`) and two
/// advisories gated below 2.2.1 / 2.3.1.
fn mlflow_corpus() -> Arc<RuleCorpus> {
    let tmp = tempfile::tempdir().expect("should create tempdir");
    let fingerprints = tmp.path().join("fingerprints");
    let advisories = tmp.path().join("advisories");
    std::fs::create_dir_all(&fingerprints).expect("mkdir");
    std::fs::create_dir_all(&advisories).expect("mkdir");

    std::fs::write(
        fingerprints.join("mlflow.yaml"),
        r#"
info:
  name: mlflow
  severity: medium
http:
  - path: /
    matchers:
      - body="Mlflow"
version:
  - path: /version
    extractor:
      part: body
      group: 1
      regex: "([0-9]+(?:\\.[0-9]+)+)"
"#,
    )
    .expect("write fingerprint");
    // Second rule matching the same component without any version probe;
    // exercises dedupe.
    std::fs::write(
        fingerprints.join("mlflow-title.yaml"),
        r#"
info:
  name: mlflow
  severity: medium
http:
  - path: /
    matchers:
      - body~="<title>\s*MLflow"
"#,
    )
    .expect("write fingerprint");
    std::fs::write(
        advisories.join("cve-2023-2780.yaml"),
        r#"
info:
  name: mlflow
  cve: CVE-2023-2780
  severity: high
  summary: path traversal
rule: 'version > "0" && version < "2.3.1"'
"#,
    )
    .expect("write advisory");

    Arc::new(RuleCorpus::load_dir(tmp.path()).expect("should load corpus"))
}

fn engine(corpus: Arc<RuleCorpus>) -> ScanEngine {
    // No preloads: these tests exercise the YAML path deterministically.
    ScanEngine::new(corpus, ScanOptions::default()).with_preloads(Vec::new())
}

fn mlflow_router(version: &'static str) -> Router {
    Router::new()
        .route(
            "/",
            get(|| async { "<html><title> MLflow </title><body>Mlflow tracking</body></html>" }),
        )
        .route("/version", get(move || async move { version }))
}

#[tokio::test]
async fn vulnerable_version_matches_advisory() {
    let addr = spawn_target(mlflow_router("2.2.0")).await;
    let (_tx, cancel) = watch::channel(false);

    let report = engine(mlflow_corpus())
        .scan(&format!("http://{addr}/"), &cancel)
        .await
        .expect("scan should succeed");

    assert_eq!(report.total, 1, "dedupe must collapse both mlflow rules");
    let finding = &report.results[0];
    assert_eq!(finding.component, "mlflow");
    assert_eq!(finding.version, "2.2.0");
    assert_eq!(finding.advisories.len(), 1);
    assert_eq!(finding.advisories[0].cve.as_deref(), Some("CVE-2023-2780"));
    assert_eq!(report.vulnerabilities, 1);
    assert!(report.score < 100.0);
    assert!(report.is_internal, "127.0.0.1 is internal");
}

#[tokio::test]
async fn patched_version_matches_no_advisory() {
    let addr = spawn_target(mlflow_router("3.0.0")).await;
    let (_tx, cancel) = watch::channel(false);

    let report = engine(mlflow_corpus())
        .scan(&format!("http://{addr}/"), &cancel)
        .await
        .expect("scan should succeed");

    assert_eq!(report.total, 1);
    assert_eq!(report.results[0].version, "3.0.0");
    assert!(report.results[0].advisories.is_empty());
    assert_eq!(report.vulnerabilities, 0);
    assert!((report.score - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn unreachable_target_yields_empty_report() {
    // Nothing listens on this port (bound then dropped).
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (_tx, cancel) = watch::channel(false);
    let report = engine(mlflow_corpus())
        .scan(&format!("http://{addr}/"), &cancel)
        .await
        .expect("probe failures are not scan failures");
    assert_eq!(report.total, 0);
}

#[tokio::test]
async fn cancelled_scan_reports_cancellation() {
    let addr = spawn_target(mlflow_router("2.2.0")).await;
    let (tx, cancel) = watch::channel(true);
    drop(tx);

    let result = engine(mlflow_corpus())
        .scan(&format!("http://{addr}/"), &cancel)
        .await;
    assert!(matches!(result, Err(ScanError::Cancelled)));
}

#[tokio::test]
async fn empty_corpus_is_an_error() {
    let corpus = Arc::new(RuleCorpus::default());
    let (_tx, cancel) = watch::channel(false);
    let result = engine(corpus).scan("http://127.0.0.1:1/", &cancel).await;
    assert!(matches!(result, Err(ScanError::NoRulesLoaded)));
}
