//! Preloaded programmatic fingerprints.
//!
//! Some components cannot be identified by a static body/header match --
//! they need a JSON probe or a multi-request check. These detectors are
//! compiled in and run alongside the YAML-driven rules.

use async_trait::async_trait;
use url::Url;

use super::http::ProbeClient;
use super::rules::Severity;

/// A compiled-in component detector.
#[async_trait]
pub trait PreloadedFingerprint: Send + Sync {
    /// Component name reported on a match.
    fn name(&self) -> &'static str;

    /// Severity attributed to the bare fingerprint.
    fn severity(&self) -> Severity {
        Severity::Info
    }

    /// Whether the target runs this component.
    async fn matches(&self, http: &ProbeClient, base: &Url) -> bool;

    /// Extract the component version; empty when unknown.
    async fn version(&self, http: &ProbeClient, base: &Url) -> String;
}

/// The default set of compiled-in detectors.
pub fn default_preloads() -> Vec<Box<dyn PreloadedFingerprint>> {
    vec![Box::new(OllamaDetector), Box::new(OpenWebUiDetector)]
}

/// Detects an exposed Ollama model server via its JSON API.
pub struct OllamaDetector;

#[async_trait]
impl PreloadedFingerprint for OllamaDetector {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    async fn matches(&self, http: &ProbeClient, base: &Url) -> bool {
        let Ok(url) = base.join("/api/tags") else {
            return false;
        };
        match http.fetch("GET", &url, None).await {
            Ok(response) => response.status == 200 && response.body.contains("\"models\""),
            Err(_) => false,
        }
    }

    async fn version(&self, http: &ProbeClient, base: &Url) -> String {
        let Ok(url) = base.join("/api/version") else {
            return String::new();
        };
        let Ok(response) = http.fetch("GET", &url, None).await else {
            return String::new();
        };
        serde_json::from_str::<serde_json::Value>(&response.body)
            .ok()
            .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(str::to_owned))
            .unwrap_or_default()
    }
}

/// Detects Open WebUI front-ends by their config endpoint.
pub struct OpenWebUiDetector;

#[async_trait]
impl PreloadedFingerprint for OpenWebUiDetector {
    fn name(&self) -> &'static str {
        "open-webui"
    }

    async fn matches(&self, http: &ProbeClient, base: &Url) -> bool {
        let Ok(url) = base.join("/api/config") else {
            return false;
        };
        match http.fetch("GET", &url, None).await {
            Ok(response) => {
                response.status == 200
                    && serde_json::from_str::<serde_json::Value>(&response.body)
                        .map(|v| v.get("name").and_then(|s| s.as_str()) == Some("Open WebUI"))
                        .unwrap_or(false)
            }
            Err(_) => false,
        }
    }

    async fn version(&self, http: &ProbeClient, base: &Url) -> String {
        let Ok(url) = base.join("/api/config") else {
            return String::new();
        };
        let Ok(response) = http.fetch("GET", &url, None).await else {
            return String::new();
        };
        serde_json::from_str::<serde_json::Value>(&response.body)
            .ok()
            .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(str::to_owned))
            .unwrap_or_default()
    }
}
