//! End-to-end: control plane ↔ worker over a real WebSocket.
//!
//! Spins up the Armitage control plane on an ephemeral port, connects a
//! molly worker with test handlers, and drives the full dispatch loop:
//! register → task → progress frames → persisted ordered events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use armitage::config::ServerConfig;
use armitage::protocol::TaskRequest;
use armitage::server::store::Store;
use armitage::server::AppState;
use armitage::types::{
    AgentStepStatus, EventType, Language, PlanStep, SessionStatus, StepStatus, TaskKind,
};
use molly::config::WorkerConfig;
use molly::emitter::Emitter;
use molly::handlers::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};

/// Three-step handler mirroring the scan flow, without network probes.
struct ScriptedScanHandler;

#[async_trait]
impl TaskHandler for ScriptedScanHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::AiinfraScan
    }

    async fn execute(
        &self,
        _ctx: TaskContext,
        _request: TaskRequest,
        emitter: Emitter,
    ) -> Result<(), HandlerError> {
        let plan: Vec<PlanStep> = ["step1", "step2", "step3"]
            .iter()
            .map(|id| PlanStep {
                step_id: (*id).to_owned(),
                title: format!("phase {id}"),
                status: StepStatus::Todo,
                started_at: None,
            })
            .collect();
        emitter.plan_update(plan).await?;
        emitter.new_plan_step("step1", "phase step1").await?;
        emitter
            .step_status("step1", AgentStepStatus::Completed, "done", "")
            .await?;
        emitter
            .result_update(json!({"total": 1, "score": 80.0, "results": []}))
            .await?;
        Ok(())
    }
}

/// Handler that blocks until cancelled.
struct BlockingHandler;

#[async_trait]
impl TaskHandler for BlockingHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Jailbreak
    }

    async fn execute(
        &self,
        ctx: TaskContext,
        _request: TaskRequest,
        emitter: Emitter,
    ) -> Result<(), HandlerError> {
        emitter
            .plan_update(vec![PlanStep {
                step_id: "step1".to_owned(),
                title: "wait".to_owned(),
                status: StepStatus::Doing,
                started_at: None,
            }])
            .await?;
        ctx.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

async fn spawn_stack() -> AppState {
    let store = Store::open_in_memory().await.expect("should open store");
    let state = AppState::new(ServerConfig::default(), store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = listener.local_addr().expect("local addr");
    {
        let state = state.clone();
        tokio::spawn(async move {
            let _ = armitage::server::serve(listener, state).await;
        });
    }

    let worker_config = WorkerConfig {
        agent: molly::config::AgentSection {
            server_url: format!("ws://{addr}/ws/agent"),
            max_concurrent_tasks: 2,
            agent_id: Some("molly-test".to_owned()),
        },
        ..WorkerConfig::default()
    };
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(ScriptedScanHandler));
    handlers.register(Arc::new(BlockingHandler));
    tokio::spawn(async move {
        let _ = molly::connection::run(worker_config, Arc::new(handlers)).await;
    });

    // Wait for the worker to register.
    for _ in 0..100 {
        if !state.registry.snapshot().is_empty() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("worker never registered");
}

async fn submit(state: &AppState, session_id: &str, kind: TaskKind) {
    state
        .store
        .create_session(
            session_id,
            "alice",
            "e2e",
            kind,
            "http://127.0.0.1:5000/",
            None,
            Language::En,
        )
        .await
        .expect("create session");
    state
        .dispatcher
        .dispatch(TaskRequest {
            session_id: session_id.to_owned(),
            task_kind: kind,
            params: Value::Null,
            content: "http://127.0.0.1:5000/".to_owned(),
            attachments: vec![],
            language: Language::En,
        })
        .await;
}

async fn wait_for_status(state: &AppState, session_id: &str, wanted: SessionStatus) {
    for _ in 0..250 {
        let status = state
            .store
            .get_session(session_id)
            .await
            .expect("query")
            .expect("exists")
            .status;
        if status == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never reached {wanted:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_scan_streams_ordered_events() {
    let state = spawn_stack().await;
    submit(&state, "e2e_1", TaskKind::AiinfraScan).await;
    wait_for_status(&state, "e2e_1", SessionStatus::Done).await;

    let events = state.store.events_from("e2e_1", 0).await.expect("events");
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..i64::try_from(events.len()).expect("len")).collect::<Vec<_>>());

    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    let plan_pos = types
        .iter()
        .position(|t| *t == EventType::PlanUpdate)
        .expect("plan update");
    let step_pos = types
        .iter()
        .position(|t| *t == EventType::StepStatusUpdate)
        .expect("step update");
    assert!(plan_pos < step_pos, "plan precedes step updates");
    assert_eq!(types.last(), Some(&EventType::End));
    assert!(types.contains(&EventType::ResultUpdate));

    let result = state
        .store
        .result("e2e_1")
        .await
        .expect("query")
        .expect("present");
    assert_eq!(result["total"], 1);

    let plan = state.store.plan_steps("e2e_1").await.expect("plan");
    assert_eq!(plan.len(), 3);
    assert_eq!(plan[0].status, StepStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_task_terminates_without_result() {
    let state = spawn_stack().await;
    submit(&state, "e2e_2", TaskKind::Jailbreak).await;
    wait_for_status(&state, "e2e_2", SessionStatus::Running).await;

    state.dispatcher.terminate("e2e_2").await;
    wait_for_status(&state, "e2e_2", SessionStatus::Terminated).await;

    assert!(state.store.result("e2e_2").await.expect("query").is_none());
    let events = state.store.events_from("e2e_2", 0).await.expect("events");
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::End));
}
