//! Built-in `aiinfra_scan` handler: drive the fingerprint & advisory
//! engine over the targets in the task content.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{HandlerError, TaskContext, TaskHandler};
use crate::emitter::Emitter;
use armitage::protocol::TaskRequest;
use armitage::scan::rules::CorpusHandle;
use armitage::scan::{Finding, ScanEngine, ScanError, ScanOptions, ScanReport};
use armitage::types::{AgentStepStatus, PlanStep, StepStatus, TaskKind, ToolRecord, ToolStatus};

const STEP_RECON: &str = "step1";
const STEP_PROBE: &str = "step2";
const STEP_REPORT: &str = "step3";

/// The AI infrastructure scan handler.
///
/// Each execution snapshots the current rule corpus, so a reload swaps in
/// for the next task without touching scans already in flight.
pub struct InfraScanHandler {
    corpus: Arc<CorpusHandle>,
    options: ScanOptions,
}

impl InfraScanHandler {
    /// Build over a reloadable corpus handle.
    pub fn new(corpus: Arc<CorpusHandle>, options: ScanOptions) -> Self {
        Self { corpus, options }
    }

    fn plan() -> Vec<PlanStep> {
        let titles = [
            (STEP_RECON, "Collect target information"),
            (STEP_PROBE, "Probe components and match advisories"),
            (STEP_REPORT, "Compile scan report"),
        ];
        titles
            .iter()
            .map(|(step_id, title)| PlanStep {
                step_id: (*step_id).to_owned(),
                title: (*title).to_owned(),
                status: StepStatus::Todo,
                started_at: None,
            })
            .collect()
    }

    fn plan_with(status: &[(&str, StepStatus)]) -> Vec<PlanStep> {
        Self::plan()
            .into_iter()
            .map(|mut step| {
                if let Some((_, new_status)) =
                    status.iter().find(|(step_id, _)| *step_id == step.step_id)
                {
                    step.status = *new_status;
                }
                step
            })
            .collect()
    }
}

#[async_trait]
impl TaskHandler for InfraScanHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::AiinfraScan
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        request: TaskRequest,
        emitter: Emitter,
    ) -> Result<(), HandlerError> {
        let targets = parse_targets(&request.content);
        if targets.is_empty() {
            return Err(HandlerError::Invalid(
                "content carries no scan targets".to_owned(),
            ));
        }
        let engine = ScanEngine::new(self.corpus.current(), self.options.clone());

        emitter.plan_update(Self::plan()).await?;

        // Step 1: recon.
        emitter
            .new_plan_step(STEP_RECON, "Collect target information")
            .await?;
        emitter
            .step_status(
                STEP_RECON,
                AgentStepStatus::Running,
                "parsing targets",
                &format!("{} target(s) requested", targets.len()),
            )
            .await?;
        if ctx.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        emitter
            .step_status(
                STEP_RECON,
                AgentStepStatus::Completed,
                "targets resolved",
                &targets.join(", "),
            )
            .await?;
        emitter
            .plan_update(Self::plan_with(&[
                (STEP_RECON, StepStatus::Done),
                (STEP_PROBE, StepStatus::Doing),
            ]))
            .await?;

        // Step 2: probe each target.
        let mut reports: Vec<ScanReport> = Vec::with_capacity(targets.len());
        let mut rules_missing = false;
        for target in &targets {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let tool_id = Uuid::new_v4().to_string();
            emitter
                .tool_used(
                    STEP_PROBE,
                    "probing target",
                    vec![probe_tool(&tool_id, target, ToolStatus::Doing, "")],
                )
                .await?;

            match engine.scan(target, ctx.receiver()).await {
                Ok(report) => {
                    let summary = format!(
                        "{} component(s), {} advisor{}",
                        report.total,
                        report.vulnerabilities,
                        if report.vulnerabilities == 1 { "y" } else { "ies" }
                    );
                    for finding in &report.results {
                        emitter.tool_log(
                            &Uuid::new_v4().to_string(),
                            &tool_id,
                            STEP_PROBE,
                            &finding_line(finding),
                        );
                    }
                    emitter
                        .tool_used(
                            STEP_PROBE,
                            "target probed",
                            vec![probe_tool(&tool_id, target, ToolStatus::Done, &summary)],
                        )
                        .await?;
                    info!(target, summary, "target scanned");
                    reports.push(report);
                }
                Err(ScanError::Cancelled) => return Err(HandlerError::Cancelled),
                Err(err @ ScanError::NoRulesLoaded) => {
                    // Target-independent: no point probing the rest.
                    warn!(target, "no fingerprint rules loaded");
                    emitter
                        .tool_used(
                            STEP_PROBE,
                            "scan aborted",
                            vec![probe_tool(&tool_id, target, ToolStatus::Done, &err.to_string())],
                        )
                        .await?;
                    rules_missing = true;
                    break;
                }
                Err(err) => {
                    warn!(target, error = %err, "target scan failed");
                    emitter
                        .tool_used(
                            STEP_PROBE,
                            "target unreachable",
                            vec![probe_tool(
                                &tool_id,
                                target,
                                ToolStatus::Done,
                                &format!("scan failed: {err}"),
                            )],
                        )
                        .await?;
                }
            }
        }

        if rules_missing && reports.is_empty() {
            emitter
                .error_kind("no_rules_loaded", "the worker has no fingerprint rules loaded")
                .await?;
            return Err(HandlerError::Failed(
                "no fingerprint rules loaded".to_owned(),
            ));
        }
        if reports.is_empty() {
            return Err(HandlerError::Failed(
                "no target could be scanned".to_owned(),
            ));
        }

        // Step 3: report.
        emitter
            .plan_update(Self::plan_with(&[
                (STEP_RECON, StepStatus::Done),
                (STEP_PROBE, StepStatus::Done),
                (STEP_REPORT, StepStatus::Doing),
            ]))
            .await?;
        emitter
            .new_plan_step(STEP_REPORT, "Compile scan report")
            .await?;

        let total: usize = reports.iter().map(|r| r.total).sum();
        let vulnerabilities: usize = reports.iter().map(|r| r.vulnerabilities).sum();
        let score = reports
            .iter()
            .map(|r| r.score)
            .fold(100.0f64, f64::min);
        let results: Vec<&Finding> = reports.iter().flat_map(|r| r.results.iter()).collect();

        emitter
            .result_update(json!({
                "total": total,
                "vulnerabilities": vulnerabilities,
                "score": score,
                "results": results,
                "reports": reports,
            }))
            .await?;

        emitter
            .step_status(
                STEP_REPORT,
                AgentStepStatus::Completed,
                "report compiled",
                &format!("{total} component(s) across {} target(s)", reports.len()),
            )
            .await?;
        emitter
            .plan_update(Self::plan_with(&[
                (STEP_RECON, StepStatus::Done),
                (STEP_PROBE, StepStatus::Done),
                (STEP_REPORT, StepStatus::Done),
            ]))
            .await?;

        Ok(())
    }
}

fn probe_tool(tool_id: &str, target: &str, status: ToolStatus, summary: &str) -> ToolRecord {
    ToolRecord {
        tool_id: tool_id.to_owned(),
        name: "http_probe".to_owned(),
        status,
        brief: "fingerprint components over HTTP".to_owned(),
        action: "GET".to_owned(),
        target: target.to_owned(),
        result_summary: summary.to_owned(),
    }
}

fn finding_line(finding: &Finding) -> String {
    if finding.version.is_empty() {
        format!("{}: version unknown", finding.component)
    } else {
        format!("{} {}", finding.component, finding.version)
    }
}

/// Split task content into scan targets (whitespace, commas, newlines).
fn parse_targets(content: &str) -> Vec<String> {
    content
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}
