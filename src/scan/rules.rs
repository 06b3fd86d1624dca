//! Rule corpus loading: fingerprint and advisory YAML files.
//!
//! Rule files live under a corpus directory with two subdirectories:
//! `fingerprints/` and `advisories/`. A file that fails to parse is logged
//! and skipped; the remainder of the corpus still loads. The loaded corpus
//! is immutable; reloading builds a fresh corpus and swaps the shared
//! pointer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::expr::{self, Expr, MatchPart};
use super::version::{self, VersionPredicate};

/// Advisory / finding severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational finding.
    #[default]
    Info,
    /// Low severity.
    Low,
    /// Medium severity.
    Medium,
    /// High severity.
    High,
    /// Critical severity.
    Critical,
}

impl Severity {
    /// Storage and report representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse from rule-file text; unknown values degrade to `Info`.
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" | "moderate" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }

    /// Score penalty applied per finding of this severity.
    pub fn score_weight(&self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Low => 5.0,
            Self::Medium => 10.0,
            Self::High => 20.0,
            Self::Critical => 30.0,
        }
    }
}

// ---------------------------------------------------------------------------
// YAML file schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FingerprintFile {
    info: FingerprintInfo,
    #[serde(default)]
    http: Vec<HttpRuleFile>,
    #[serde(default)]
    version: Vec<VersionRuleFile>,
}

#[derive(Debug, Deserialize)]
struct FingerprintInfo {
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    author: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    metadata: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct HttpRuleFile {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_path")]
    path: String,
    /// Request body for non-GET probes.
    #[serde(default)]
    data: Option<String>,
    matchers: Vec<String>,
    #[serde(default)]
    extractor: Option<ExtractorFile>,
}

#[derive(Debug, Deserialize)]
struct VersionRuleFile {
    #[serde(default = "default_path")]
    path: String,
    extractor: ExtractorFile,
}

#[derive(Debug, Deserialize)]
struct ExtractorFile {
    part: String,
    #[serde(default)]
    group: usize,
    regex: String,
}

#[derive(Debug, Deserialize)]
struct AdvisoryFile {
    info: AdvisoryInfo,
    #[serde(default)]
    rule: String,
    #[serde(default)]
    references: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AdvisoryInfo {
    name: String,
    #[serde(default)]
    cve: Option<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    #[allow(dead_code)]
    cvss: Option<f64>,
    #[serde(default)]
    severity: String,
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_path() -> String {
    "/".to_owned()
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

/// Version extractor: regex submatch over a response part.
#[derive(Debug, Clone)]
pub struct Extractor {
    /// Part the regex runs over.
    pub part: MatchPart,
    /// Submatch group index returned.
    pub group: usize,
    /// Compiled pattern.
    pub regex: Regex,
}

impl Extractor {
    /// Apply the extractor to a probe response part.
    ///
    /// Returns the group-th submatch, or an empty string when the regex
    /// does not match or the group is absent.
    pub fn extract(&self, body: &str, header: &str) -> String {
        let haystack = match self.part {
            MatchPart::Body => body,
            MatchPart::Header => header,
        };
        self.regex
            .captures(haystack)
            .and_then(|caps| caps.get(self.group))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default()
    }
}

/// One HTTP probe within a fingerprint rule.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    /// HTTP method.
    pub method: String,
    /// Request path appended to the target base.
    pub path: String,
    /// Optional request body.
    pub body: Option<String>,
    /// Matcher expressions; any match identifies the component.
    pub matchers: Vec<Expr>,
    /// Optional inline version extractor for this probe.
    pub extractor: Option<Extractor>,
}

/// A version-extraction probe.
#[derive(Debug, Clone)]
pub struct VersionProbe {
    /// Request path appended to the target base.
    pub path: String,
    /// Extractor applied to the response.
    pub extractor: Extractor,
}

/// Compiled fingerprint rule.
#[derive(Debug, Clone)]
pub struct FingerprintRule {
    /// Component name this rule identifies.
    pub name: String,
    /// Severity attributed to the bare fingerprint.
    pub severity: Severity,
    /// Free-form rule metadata (`type`, tags, ...).
    pub metadata: HashMap<String, String>,
    /// Identification probes.
    pub http: Vec<HttpProbe>,
    /// Version extraction probes, tried in order after a match.
    pub version: Vec<VersionProbe>,
}

/// Compiled advisory rule.
#[derive(Debug, Clone)]
pub struct AdvisoryRule {
    /// Component the advisory applies to.
    pub component: String,
    /// CVE identifier, when assigned.
    pub cve: Option<String>,
    /// Severity of the vulnerability.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Longer description.
    pub details: String,
    /// Reference URLs.
    pub references: Vec<String>,
    /// Version applicability predicate.
    pub predicate: VersionPredicate,
    /// Original rule text, kept for reporting.
    pub rule_text: String,
}

/// Immutable loaded rule corpus with a prebuilt advisory index.
#[derive(Debug, Default)]
pub struct RuleCorpus {
    /// Fingerprint rules.
    pub fingerprints: Vec<FingerprintRule>,
    /// Advisory rules.
    pub advisories: Vec<AdvisoryRule>,
    /// `component name → advisory indices` lookup.
    index: HashMap<String, Vec<usize>>,
    /// Files that failed to parse during the load.
    pub load_errors: Vec<String>,
}

/// Rule loading errors (directory level; per-file errors are collected).
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Corpus directory unreadable.
    #[error("failed to read rule directory {dir}: {source}")]
    Io {
        /// Directory that failed.
        dir: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RuleCorpus {
    /// Load a corpus from `dir/fingerprints` and `dir/advisories`.
    ///
    /// Files that fail YAML parsing or DSL compilation are logged, recorded
    /// in `load_errors`, and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only when a subdirectory exists but cannot be
    /// listed. Missing subdirectories yield an empty corpus half.
    pub fn load_dir(dir: &Path) -> Result<Self, RuleError> {
        let mut corpus = Self::default();

        for path in yaml_files(&dir.join("fingerprints"))? {
            match load_fingerprint(&path) {
                Ok(rule) => {
                    debug!(rule = %rule.name, file = %path.display(), "fingerprint loaded");
                    corpus.fingerprints.push(rule);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping fingerprint rule");
                    corpus
                        .load_errors
                        .push(format!("{}: {err}", path.display()));
                }
            }
        }

        for path in yaml_files(&dir.join("advisories"))? {
            match load_advisory(&path) {
                Ok(rule) => {
                    debug!(component = %rule.component, file = %path.display(), "advisory loaded");
                    corpus.advisories.push(rule);
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping advisory rule");
                    corpus
                        .load_errors
                        .push(format!("{}: {err}", path.display()));
                }
            }
        }

        corpus.rebuild_index();
        Ok(corpus)
    }

    /// Whether the corpus holds no rules at all.
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty() && self.advisories.is_empty()
    }

    fn rebuild_index(&mut self) {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, advisory) in self.advisories.iter().enumerate() {
            index
                .entry(advisory.component.to_lowercase())
                .or_default()
                .push(i);
        }
        self.index = index;
    }

    /// Select advisories applicable to a finding.
    ///
    /// An advisory applies when its component matches and its predicate
    /// holds for the extracted version. A versionless finding only matches
    /// advisories whose rule is empty.
    pub fn advisories_for(
        &self,
        component: &str,
        detected_version: &str,
        is_internal: bool,
    ) -> Vec<&AdvisoryRule> {
        let Some(indices) = self.index.get(&component.to_lowercase()) else {
            return Vec::new();
        };
        indices
            .iter()
            .filter_map(|&i| self.advisories.get(i))
            .filter(|advisory| {
                if detected_version.is_empty() {
                    advisory.predicate.is_always()
                } else {
                    advisory.predicate.eval(detected_version, is_internal)
                }
            })
            .collect()
    }
}

/// Shared corpus slot with atomic replace-on-reload.
///
/// Scans take an [`Arc`] snapshot of the current corpus; a reload builds a
/// fresh corpus off to the side and swaps the pointer, so in-flight scans
/// keep the corpus they started with.
pub struct CorpusHandle {
    dir: std::path::PathBuf,
    current: std::sync::RwLock<Arc<RuleCorpus>>,
}

impl CorpusHandle {
    /// Load the corpus from `dir` and wrap it in a reloadable handle.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be listed.
    pub fn load(dir: &Path) -> Result<Self, RuleError> {
        let corpus = RuleCorpus::load_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current: std::sync::RwLock::new(Arc::new(corpus)),
        })
    }

    /// Snapshot of the current corpus.
    pub fn current(&self) -> Arc<RuleCorpus> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Rebuild the corpus from disk and swap it in. Returns the new
    /// `(fingerprint, advisory)` counts.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be listed; the previous
    /// corpus stays in place in that case.
    pub fn reload(&self) -> Result<(usize, usize), RuleError> {
        let fresh = RuleCorpus::load_dir(&self.dir)?;
        let counts = (fresh.fingerprints.len(), fresh.advisories.len());
        let fresh = Arc::new(fresh);
        match self.current.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        Ok(counts)
    }
}

fn yaml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, RuleError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|source| RuleError::Io {
        dir: dir.display().to_string(),
        source,
    })?;
    let mut files: Vec<std::path::PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_fingerprint(path: &Path) -> anyhow::Result<FingerprintRule> {
    let raw = std::fs::read_to_string(path)?;
    let file: FingerprintFile = serde_yaml::from_str(&raw)?;
    compile_fingerprint(file)
}

fn compile_fingerprint(file: FingerprintFile) -> anyhow::Result<FingerprintRule> {
    let name = file.info.name.clone();
    let mut http = Vec::with_capacity(file.http.len());
    for rule in file.http {
        let mut matchers = Vec::with_capacity(rule.matchers.len());
        for source in &rule.matchers {
            matchers.push(expr::parse(source)?);
        }
        http.push(HttpProbe {
            method: rule.method.to_ascii_uppercase(),
            path: rule.path,
            body: rule.data,
            matchers,
            // A broken extractor only costs the version, not the rule.
            extractor: rule
                .extractor
                .and_then(|e| lenient_extractor(&name, e)),
        });
    }

    let mut version = Vec::with_capacity(file.version.len());
    for rule in file.version {
        if let Some(extractor) = lenient_extractor(&name, rule.extractor) {
            version.push(VersionProbe {
                path: rule.path,
                extractor,
            });
        }
    }

    let metadata = file
        .info
        .metadata
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                serde_yaml::Value::String(s) => s,
                other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_owned(),
            };
            (k, text)
        })
        .collect();

    Ok(FingerprintRule {
        name: file.info.name,
        severity: Severity::parse_lossy(&file.info.severity),
        metadata,
        http,
        version,
    })
}

fn lenient_extractor(rule_name: &str, file: ExtractorFile) -> Option<Extractor> {
    let part = match file.part.to_ascii_lowercase().as_str() {
        "header" => MatchPart::Header,
        _ => MatchPart::Body,
    };
    match Regex::new(&file.regex) {
        Ok(regex) => Some(Extractor {
            part,
            group: file.group,
            regex,
        }),
        Err(err) => {
            warn!(rule = rule_name, regex = %file.regex, error = %err, "extractor regex invalid, version disabled");
            None
        }
    }
}

fn load_advisory(path: &Path) -> anyhow::Result<AdvisoryRule> {
    let raw = std::fs::read_to_string(path)?;
    let file: AdvisoryFile = serde_yaml::from_str(&raw)?;
    let predicate = version::parse(&file.rule)?;
    Ok(AdvisoryRule {
        component: file.info.name,
        cve: file.info.cve,
        severity: Severity::parse_lossy(&file.info.severity),
        summary: file.info.summary,
        details: file.info.details,
        references: file.references,
        predicate,
        rule_text: file.rule,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parses_lossily() {
        assert_eq!(Severity::parse_lossy("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse_lossy("moderate"), Severity::Medium);
        assert_eq!(Severity::parse_lossy("???"), Severity::Info);
    }

    #[test]
    fn fingerprint_yaml_compiles() {
        let file: FingerprintFile = serde_yaml::from_str(
            r#"
info:
  name: mlflow
  severity: medium
  metadata:
    type: model-registry
http:
  - method: GET
    path: /
    matchers:
      - body="Mlflow"
      - header~="mlflow"
version:
  - path: /version
    extractor:
      part: body
      group: 1
      regex: "Mlflow ([0-9.]+)"
"#,
        )
        .expect("should deserialize");
        let rule = compile_fingerprint(file).expect("should compile");
        assert_eq!(rule.name, "mlflow");
        assert_eq!(rule.http.len(), 1);
        assert_eq!(rule.http[0].matchers.len(), 2);
        assert_eq!(rule.version.len(), 1);
        assert_eq!(rule.metadata.get("type").map(String::as_str), Some("model-registry"));
    }

    #[test]
    fn versionless_finding_only_matches_empty_rules() {
        let mut corpus = RuleCorpus {
            advisories: vec![
                AdvisoryRule {
                    component: "mlflow".to_owned(),
                    cve: Some("CVE-2023-1177".to_owned()),
                    severity: Severity::Critical,
                    summary: "LFI/RFI".to_owned(),
                    details: String::new(),
                    references: vec![],
                    predicate: version::parse(r#"version < "2.2.1""#).expect("should parse"),
                    rule_text: r#"version < "2.2.1""#.to_owned(),
                },
                AdvisoryRule {
                    component: "mlflow".to_owned(),
                    cve: None,
                    severity: Severity::Info,
                    summary: "exposed tracking server".to_owned(),
                    details: String::new(),
                    references: vec![],
                    predicate: VersionPredicate::Always,
                    rule_text: String::new(),
                },
            ],
            ..RuleCorpus::default()
        };
        corpus.rebuild_index();

        let hits = corpus.advisories_for("mlflow", "", false);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].predicate.is_always());

        let hits = corpus.advisories_for("mlflow", "2.2.0", false);
        assert_eq!(hits.len(), 2);

        let hits = corpus.advisories_for("MLflow", "2.3.0", false);
        assert_eq!(hits.len(), 1, "index lookup is case-insensitive");

        assert!(corpus.advisories_for("gradio", "1.0", false).is_empty());
    }
}
