//! Fingerprint & advisory engine.
//!
//! Stateless and deterministic: given a target base URL and a loaded rule
//! corpus, probe HTTP endpoints, identify components with matcher
//! expressions, extract versions, and select applicable advisories. The
//! engine owns a per-scan response cache and a bounded worker pool; it
//! holds no state between scans.

pub mod expr;
pub mod favicon;
pub mod http;
pub mod preload;
pub mod rules;
pub mod version;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use self::expr::MatchContext;
use self::http::{HttpOptions, ProbeClient, ProbeResponse};
use self::preload::PreloadedFingerprint;
use self::rules::{FingerprintRule, RuleCorpus, Severity};

/// Scan errors.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// HTTP client construction or configuration failure.
    #[error("{0}")]
    Client(String),
    /// A probe failed at the transport level after all retries.
    #[error("probe of {url} failed: {detail}")]
    Probe {
        /// Probed URL.
        url: String,
        /// Transport error detail.
        detail: String,
    },
    /// Target URL could not be parsed.
    #[error("invalid target {target:?}: {source}")]
    InvalidTarget {
        /// Offending target string.
        target: String,
        /// Parse error.
        #[source]
        source: url::ParseError,
    },
    /// The rule corpus is empty; the engine has nothing to match with.
    #[error("no fingerprint rules loaded")]
    NoRulesLoaded,
    /// The scan was cancelled cooperatively.
    #[error("scan cancelled")]
    Cancelled,
}

/// Scan tuning knobs.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// HTTP client options.
    pub http: HttpOptions,
    /// Concurrent fingerprint-rule workers.
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            http: HttpOptions::default(),
            concurrency: 10,
        }
    }
}

/// An advisory attached to a finding, in report form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryReport {
    /// CVE identifier, when assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cve: Option<String>,
    /// Vulnerability severity.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Longer description.
    #[serde(default)]
    pub details: String,
    /// Reference URLs.
    #[serde(default)]
    pub references: Vec<String>,
    /// The version rule that matched.
    #[serde(default)]
    pub rule: String,
}

/// One identified component with its applicable advisories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Component name.
    pub component: String,
    /// Fingerprint severity.
    pub severity: Severity,
    /// Extracted version; empty when unknown.
    #[serde(default)]
    pub version: String,
    /// Target the finding was made against.
    pub target_url: String,
    /// Advisories whose version predicate held.
    pub advisories: Vec<AdvisoryReport>,
}

/// Full scan result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Normalized target base URL.
    pub target: String,
    /// Number of identified components.
    pub total: usize,
    /// Total advisories matched across findings.
    pub vulnerabilities: usize,
    /// Security score: 100 minus severity-weighted advisory penalties,
    /// floored at 0.
    pub score: f64,
    /// Whether the target address is private/loopback.
    pub is_internal: bool,
    /// Identified components.
    pub results: Vec<Finding>,
}

struct RawFinding {
    name: String,
    severity: Severity,
    version: String,
}

/// The fingerprint & advisory engine.
pub struct ScanEngine {
    corpus: Arc<RuleCorpus>,
    preloads: Vec<Box<dyn PreloadedFingerprint>>,
    options: ScanOptions,
}

impl ScanEngine {
    /// Build an engine over a loaded corpus with the default preloaded
    /// detectors.
    pub fn new(corpus: Arc<RuleCorpus>, options: ScanOptions) -> Self {
        Self {
            corpus,
            preloads: preload::default_preloads(),
            options,
        }
    }

    /// Replace the preloaded detector set.
    pub fn with_preloads(mut self, preloads: Vec<Box<dyn PreloadedFingerprint>>) -> Self {
        self.preloads = preloads;
        self
    }

    /// Scan one target.
    ///
    /// Cancellation is cooperative: the engine checks `cancel` between
    /// rules and probe iterations and returns [`ScanError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns an error for malformed targets, an empty corpus, client
    /// construction failures, or cancellation. Individual probe failures
    /// are treated as "no match" and logged.
    pub async fn scan(
        &self,
        target: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ScanReport, ScanError> {
        // Compiled-in detectors alone don't count: without a rule corpus
        // the scan cannot identify components, and the caller should hear
        // that rather than get an empty-looking result.
        if self.corpus.fingerprints.is_empty() {
            return Err(ScanError::NoRulesLoaded);
        }

        let base = normalize_target(target)?;
        let is_internal = is_internal_host(&base);
        let client = ProbeClient::new(&self.options.http)?;

        info!(target = %base, rules = self.corpus.fingerprints.len(), "scan started");

        // Cache the index response up front; rules probing "/" reuse it.
        let index_response = match client.fetch("GET", &base, None).await {
            Ok(response) => Some(response),
            Err(err) => {
                warn!(target = %base, error = %err, "index probe failed");
                None
            }
        };

        let icon = client.favicon(&base).await;

        let rule_futures: Vec<_> = self
            .corpus
            .fingerprints
            .iter()
            .map(|rule| self.probe_rule(&client, &base, index_response.as_ref(), icon, rule, cancel))
            .collect();
        let yaml_findings = stream::iter(rule_futures)
            .buffer_unordered(self.options.concurrency.max(1))
            .filter_map(futures::future::ready)
            .collect::<Vec<RawFinding>>();

        let preload_futures: Vec<_> = self
            .preloads
            .iter()
            .map(|detector| self.probe_preload(&client, &base, detector.as_ref(), cancel))
            .collect();
        let preload_findings = stream::iter(preload_futures)
            .buffer_unordered(self.options.concurrency.max(1))
            .filter_map(futures::future::ready)
            .collect::<Vec<RawFinding>>();

        let (yaml_findings, preload_findings) =
            futures::join!(yaml_findings, preload_findings);

        client.clear().await;

        if *cancel.borrow() {
            return Err(ScanError::Cancelled);
        }

        let mut merged: Vec<RawFinding> = yaml_findings;
        merged.extend(preload_findings);
        let deduped = dedupe(merged);

        let mut findings = Vec::with_capacity(deduped.len());
        let mut vulnerabilities = 0usize;
        let mut score = 100.0f64;
        for raw in deduped {
            let advisories: Vec<AdvisoryReport> = self
                .corpus
                .advisories_for(&raw.name, &raw.version, is_internal)
                .into_iter()
                .map(|advisory| AdvisoryReport {
                    cve: advisory.cve.clone(),
                    severity: advisory.severity,
                    summary: advisory.summary.clone(),
                    details: advisory.details.clone(),
                    references: advisory.references.clone(),
                    rule: advisory.rule_text.clone(),
                })
                .collect();
            vulnerabilities = vulnerabilities.saturating_add(advisories.len());
            for advisory in &advisories {
                score -= advisory.severity.score_weight();
            }
            findings.push(Finding {
                component: raw.name,
                severity: raw.severity,
                version: raw.version,
                target_url: base.to_string(),
                advisories,
            });
        }
        findings.sort_by(|a, b| a.component.cmp(&b.component));

        info!(
            target = %base,
            components = findings.len(),
            vulnerabilities,
            "scan finished"
        );

        Ok(ScanReport {
            target: base.to_string(),
            total: findings.len(),
            vulnerabilities,
            score: score.max(0.0),
            is_internal,
            results: findings,
        })
    }

    async fn probe_rule(
        &self,
        client: &ProbeClient,
        base: &Url,
        index: Option<&Arc<ProbeResponse>>,
        icon: i32,
        rule: &FingerprintRule,
        cancel: &watch::Receiver<bool>,
    ) -> Option<RawFinding> {
        for probe in &rule.http {
            if *cancel.borrow() {
                return None;
            }

            let response = if probe.path == "/" {
                index.map(Arc::clone)
            } else {
                match join_path(base, &probe.path) {
                    Some(url) => client
                        .fetch(&probe.method, &url, probe.body.as_deref())
                        .await
                        .ok(),
                    None => None,
                }
            };
            let Some(response) = response else {
                continue;
            };

            let ctx = MatchContext {
                body: response.body.clone(),
                header: response.header.clone(),
                icon,
            };

            if probe.matchers.iter().any(|matcher| matcher.eval(&ctx)) {
                debug!(rule = %rule.name, path = %probe.path, "fingerprint matched");
                let mut version = probe
                    .extractor
                    .as_ref()
                    .map(|e| e.extract(&response.body, &response.header))
                    .unwrap_or_default();
                if version.is_empty() {
                    version = self
                        .extract_version(client, base, index, rule, cancel)
                        .await;
                }
                return Some(RawFinding {
                    name: rule.name.clone(),
                    severity: rule.severity,
                    version,
                });
            }
        }
        None
    }

    /// Run the rule's version probes in order; first non-empty value wins.
    async fn extract_version(
        &self,
        client: &ProbeClient,
        base: &Url,
        index: Option<&Arc<ProbeResponse>>,
        rule: &FingerprintRule,
        cancel: &watch::Receiver<bool>,
    ) -> String {
        for probe in &rule.version {
            if *cancel.borrow() {
                return String::new();
            }
            let response = if probe.path == "/" {
                index.map(Arc::clone)
            } else {
                match join_path(base, &probe.path) {
                    Some(url) => client.fetch("GET", &url, None).await.ok(),
                    None => None,
                }
            };
            let Some(response) = response else {
                continue;
            };
            let value = probe.extractor.extract(&response.body, &response.header);
            if !value.is_empty() {
                return value;
            }
        }
        String::new()
    }

    async fn probe_preload(
        &self,
        client: &ProbeClient,
        base: &Url,
        detector: &dyn PreloadedFingerprint,
        cancel: &watch::Receiver<bool>,
    ) -> Option<RawFinding> {
        if *cancel.borrow() {
            return None;
        }
        if !detector.matches(client, base).await {
            return None;
        }
        debug!(rule = detector.name(), "preloaded fingerprint matched");
        Some(RawFinding {
            name: detector.name().to_owned(),
            severity: detector.severity(),
            version: detector.version(client, base).await,
        })
    }
}

/// Collapse duplicate findings per component, preferring versioned entries.
fn dedupe(raw: Vec<RawFinding>) -> Vec<RawFinding> {
    let mut by_name: HashMap<String, RawFinding> = HashMap::new();
    for finding in raw {
        let key = finding.name.to_lowercase();
        match by_name.get(&key) {
            Some(existing) if !existing.version.is_empty() => {
                // Keep the versioned entry already recorded.
            }
            _ if finding.version.is_empty() && by_name.contains_key(&key) => {
                // An unversioned duplicate never displaces anything.
            }
            _ => {
                by_name.insert(key, finding);
            }
        }
    }
    let mut merged: Vec<RawFinding> = by_name.into_values().collect();
    merged.sort_by(|a, b| a.name.cmp(&b.name));
    merged
}

/// Parse and normalize a target: bare hosts get an `http://` scheme.
fn normalize_target(target: &str) -> Result<Url, ScanError> {
    let trimmed = target.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("http://{trimmed}")
    };
    Url::parse(&candidate).map_err(|source| ScanError::InvalidTarget {
        target: target.to_owned(),
        source,
    })
}

fn join_path(base: &Url, path: &str) -> Option<Url> {
    base.join(path).ok()
}

/// Whether the target host is a loopback/private address.
fn is_internal_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback() || (v6.octets()[0] & 0xfe) == 0xfc,
        Err(_) => false,
    }
}
