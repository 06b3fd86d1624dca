//! Generic handler that delegates a task kind to an external pipeline.
//!
//! The MCP static analysis and prompt-security evaluation stacks live
//! outside this process; the worker owns only their plan/result framing,
//! timeout, and cancellation. The spawned tool streams progress on stdout
//! (forwarded as tool logs) and prints its result as a final JSON line.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use super::{HandlerError, TaskContext, TaskHandler};
use crate::config::ExternalSection;
use crate::emitter::Emitter;
use armitage::protocol::TaskRequest;
use armitage::types::{
    AgentStepStatus, PlanStep, StepStatus, TaskKind, ToolRecord, ToolStatus,
};

const STEP_RUN: &str = "step1";

/// Handler that runs one configured external command per task.
pub struct ExternalHandler {
    kind: TaskKind,
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalHandler {
    /// Build from a config section.
    ///
    /// # Errors
    ///
    /// Returns an error when the section names an unknown task kind.
    pub fn from_config(section: &ExternalSection) -> anyhow::Result<Self> {
        let kind = TaskKind::parse(&section.kind)
            .map_err(|e| anyhow::anyhow!("external pipeline: {e}"))?;
        Ok(Self {
            kind,
            command: section.command.clone(),
            args: section.args.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }
}

#[async_trait]
impl TaskHandler for ExternalHandler {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        request: TaskRequest,
        emitter: Emitter,
    ) -> Result<(), HandlerError> {
        let title = format!("Run {} analysis", self.kind.as_str());
        emitter
            .plan_update(vec![PlanStep {
                step_id: STEP_RUN.to_owned(),
                title: title.clone(),
                status: StepStatus::Doing,
                started_at: None,
            }])
            .await?;
        emitter.new_plan_step(STEP_RUN, &title).await?;

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{content}", &request.content))
            .collect();

        let tool_id = Uuid::new_v4().to_string();
        emitter
            .tool_used(
                STEP_RUN,
                "external pipeline started",
                vec![ToolRecord {
                    tool_id: tool_id.clone(),
                    name: self.command.clone(),
                    status: ToolStatus::Doing,
                    brief: format!("{} pipeline", self.kind.as_str()),
                    action: "exec".to_owned(),
                    target: request.content.chars().take(120).collect(),
                    result_summary: String::new(),
                }],
            )
            .await?;

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::Failed(format!("failed to spawn pipeline: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HandlerError::Failed("pipeline stdout unavailable".to_owned()))?;
        let mut lines = BufReader::new(stdout).lines();
        let action_id = Uuid::new_v4().to_string();
        let mut last_json: Option<Value> = None;

        let run = async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    last_json = Some(value);
                }
                emitter.tool_log(&action_id, &tool_id, STEP_RUN, &line);
            }
            child.wait().await
        };

        let status = tokio::select! {
            status = run => {
                status.map_err(|e| HandlerError::Failed(format!("pipeline wait failed: {e}")))?
            }
            () = ctx.cancelled() => {
                warn!(kind = self.kind.as_str(), "pipeline cancelled");
                return Err(HandlerError::Cancelled);
            }
            () = tokio::time::sleep(self.timeout) => {
                return Err(HandlerError::Failed(format!(
                    "pipeline exceeded {} s timeout",
                    self.timeout.as_secs()
                )));
            }
        };

        if !status.success() {
            return Err(HandlerError::Failed(format!(
                "pipeline exited with {status}"
            )));
        }
        let result = last_json.ok_or_else(|| {
            HandlerError::Failed("pipeline produced no JSON result line".to_owned())
        })?;

        emitter
            .tool_used(
                STEP_RUN,
                "external pipeline finished",
                vec![ToolRecord {
                    tool_id,
                    name: self.command.clone(),
                    status: ToolStatus::Done,
                    brief: format!("{} pipeline", self.kind.as_str()),
                    action: "exec".to_owned(),
                    target: request.content.chars().take(120).collect(),
                    result_summary: "completed".to_owned(),
                }],
            )
            .await?;
        emitter.result_update(result).await?;
        emitter
            .step_status(
                STEP_RUN,
                AgentStepStatus::Completed,
                "analysis complete",
                "",
            )
            .await?;
        info!(kind = self.kind.as_str(), "external pipeline finished");
        Ok(())
    }
}
