//! Tests for rule corpus loading.

use std::path::Path;

use armitage::scan::rules::{RuleCorpus, Severity};

fn write_rule(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("should write rule file");
}

fn corpus_dirs(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let fingerprints = root.join("fingerprints");
    let advisories = root.join("advisories");
    std::fs::create_dir_all(&fingerprints).expect("should create fingerprints dir");
    std::fs::create_dir_all(&advisories).expect("should create advisories dir");
    (fingerprints, advisories)
}

#[test]
fn loads_corpus_and_skips_broken_files() {
    let tmp = tempfile::tempdir().expect("should create tempdir");
    let (fingerprints, advisories) = corpus_dirs(tmp.path());

    write_rule(
        &fingerprints,
        "mlflow.yaml",
        r#"
info:
  name: mlflow
  severity: medium
http:
  - path: /
    matchers:
      - body="Mlflow"
"#,
    );
    // Unbalanced parens poison only this file.
    write_rule(
        &fingerprints,
        "broken.yaml",
        r#"
info:
  name: broken
http:
  - path: /
    matchers:
      - (body="a" && body="b"
"#,
    );
    write_rule(
        &advisories,
        "mlflow.yaml",
        r#"
info:
  name: mlflow
  cve: CVE-2023-2780
  severity: high
  summary: path traversal
rule: 'version < "2.3.1"'
"#,
    );
    // Bad version rule also skipped.
    write_rule(
        &advisories,
        "broken.yaml",
        r#"
info:
  name: broken
  summary: nope
rule: 'release < "1"'
"#,
    );

    let corpus = RuleCorpus::load_dir(tmp.path()).expect("should load corpus");
    assert_eq!(corpus.fingerprints.len(), 1);
    assert_eq!(corpus.advisories.len(), 1);
    assert_eq!(corpus.load_errors.len(), 2);
    assert_eq!(corpus.fingerprints[0].name, "mlflow");
    assert_eq!(corpus.fingerprints[0].severity, Severity::Medium);
}

#[test]
fn missing_directories_yield_empty_corpus() {
    let tmp = tempfile::tempdir().expect("should create tempdir");
    let corpus = RuleCorpus::load_dir(tmp.path()).expect("should load");
    assert!(corpus.is_empty());
    assert!(corpus.load_errors.is_empty());
}

#[test]
fn shipped_corpus_parses_cleanly() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("rules");
    let corpus = RuleCorpus::load_dir(&dir).expect("should load shipped rules");
    assert!(
        corpus.load_errors.is_empty(),
        "shipped rules must parse: {:?}",
        corpus.load_errors
    );
    assert!(corpus.fingerprints.iter().any(|r| r.name == "mlflow"));
    assert!(corpus.advisories.iter().any(|a| a.cve.as_deref() == Some("CVE-2023-2780")));
}
