//! Tests for dispatch selection, queueing, cancellation, and agent loss.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use armitage::protocol::{AgentFrame, ServerFrame, TaskRequest};
use armitage::server::bus::EventBus;
use armitage::server::dispatch::{DispatchOutcome, Dispatcher};
use armitage::server::registry::AgentRegistry;
use armitage::server::store::Store;
use armitage::types::{
    AgentIdentity, EventType, Language, SessionStatus, TaskKind,
};

struct Harness {
    store: Store,
    registry: Arc<AgentRegistry>,
    dispatcher: Dispatcher,
}

async fn harness() -> Harness {
    harness_with_deadline(Duration::from_secs(30)).await
}

async fn harness_with_deadline(deadline: Duration) -> Harness {
    let store = Store::open_in_memory().await.expect("should open store");
    let bus = Arc::new(EventBus::new(store.clone()));
    let registry = Arc::new(AgentRegistry::new());
    let dispatcher = Dispatcher::new(store.clone(), bus, Arc::clone(&registry), deadline);
    Harness {
        store,
        registry,
        dispatcher,
    }
}

impl Harness {
    async fn make_session(&self, session_id: &str, kind: TaskKind) -> TaskRequest {
        self.store
            .create_session(
                session_id,
                "alice",
                "t",
                kind,
                "http://127.0.0.1:5000/",
                None,
                Language::En,
            )
            .await
            .expect("should create session");
        TaskRequest {
            session_id: session_id.to_owned(),
            task_kind: kind,
            params: Value::Null,
            content: "http://127.0.0.1:5000/".to_owned(),
            attachments: vec![],
            language: Language::En,
        }
    }

    fn connect_agent(
        &self,
        agent_id: &str,
        capabilities: Vec<TaskKind>,
    ) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(16);
        let identity = AgentIdentity {
            agent_id: agent_id.to_owned(),
            hostname: "test-host".to_owned(),
            ip: "127.0.0.1".to_owned(),
            version: "0.0.0".to_owned(),
            metadata: Value::Null,
            capabilities,
        };
        self.registry.register(identity, tx);
        rx
    }

    async fn status(&self, session_id: &str) -> SessionStatus {
        self.store
            .get_session(session_id)
            .await
            .expect("query")
            .expect("exists")
            .status
    }
}

#[tokio::test]
async fn dispatch_prefers_least_loaded_agent() {
    let h = harness().await;
    let mut busy_rx = h.connect_agent("busy", vec![TaskKind::AiinfraScan]);
    let mut idle_rx = h.connect_agent("idle", vec![TaskKind::AiinfraScan]);

    // Load one task onto "busy".
    h.registry.assign("busy", "preexisting");

    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    assert_eq!(h.dispatcher.dispatch(request).await, DispatchOutcome::Dispatched);

    assert!(
        idle_rx.try_recv().is_ok(),
        "idle agent should receive the task"
    );
    assert!(busy_rx.try_recv().is_err());
    assert_eq!(h.status("s1").await, SessionStatus::Dispatched);
    assert_eq!(h.registry.total_in_flight(), 2);
}

#[tokio::test]
async fn capability_mismatch_queues_until_matching_agent_connects() {
    let h = harness().await;
    let request = h.make_session("s1", TaskKind::McpScan).await;

    assert_eq!(h.dispatcher.dispatch(request).await, DispatchOutcome::Queued);
    assert_eq!(h.status("s1").await, SessionStatus::Queued);

    // An agent with a different capability does not drain the queue.
    let _scan_rx = h.connect_agent("scanner", vec![TaskKind::AiinfraScan]);
    h.dispatcher.on_capacity().await;
    assert_eq!(h.status("s1").await, SessionStatus::Queued);

    // A matching agent does.
    let mut mcp_rx = h.connect_agent("auditor", vec![TaskKind::McpScan]);
    h.dispatcher.on_capacity().await;
    assert_eq!(h.status("s1").await, SessionStatus::Dispatched);
    let frame = mcp_rx.try_recv().expect("task frame");
    assert!(matches!(frame, ServerFrame::Task(t) if t.session_id == "s1"));
}

#[tokio::test]
async fn frames_drive_lifecycle_to_done() {
    let h = harness().await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _task = rx.recv().await.expect("task frame");

    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::PlanUpdate {
                session_id: "s1".to_owned(),
                tasks: vec![],
            },
        )
        .await;
    assert_eq!(h.status("s1").await, SessionStatus::Running);

    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::ResultUpdate {
                session_id: "s1".to_owned(),
                result: serde_json::json!({"total": 0}),
            },
        )
        .await;
    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::End {
                session_id: "s1".to_owned(),
            },
        )
        .await;

    assert_eq!(h.status("s1").await, SessionStatus::Done);
    assert_eq!(h.registry.total_in_flight(), 0, "in-flight released on end");

    let events = h.store.events_from("s1", 0).await.expect("events");
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![EventType::PlanUpdate, EventType::ResultUpdate, EventType::End]
    );
}

#[tokio::test]
async fn error_frame_fails_the_session() {
    let h = harness().await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _ = rx.recv().await;

    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::Error {
                session_id: "s1".to_owned(),
                kind: None,
                text: "probe blew up".to_owned(),
            },
        )
        .await;
    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::End {
                session_id: "s1".to_owned(),
            },
        )
        .await;

    let session = h
        .store
        .get_session("s1")
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error.as_deref(), Some("probe blew up"));

    let events = h.store.events_from("s1", 0).await.expect("events");
    let error_event = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("error event");
    assert_eq!(error_event.content["kind"], "task_error");
}

#[tokio::test]
async fn agent_error_kind_reaches_the_event_stream() {
    let h = harness().await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _ = rx.recv().await;

    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::Error {
                session_id: "s1".to_owned(),
                kind: Some("no_rules_loaded".to_owned()),
                text: "the worker has no fingerprint rules loaded".to_owned(),
            },
        )
        .await;

    let events = h.store.events_from("s1", 0).await.expect("events");
    let error_event = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("error event");
    assert_eq!(error_event.content["kind"], "no_rules_loaded");
    assert_eq!(h.status("s1").await, SessionStatus::Failed);
}

#[tokio::test]
async fn terminate_sends_cancel_and_end_resolves_terminated() {
    let h = harness().await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _ = rx.recv().await;

    h.dispatcher.terminate("s1").await;
    let frame = rx.recv().await.expect("cancel frame");
    assert!(matches!(frame, ServerFrame::Cancel { session_id } if session_id == "s1"));

    // Agent confirms with end; the pending cancel turns it into terminated,
    // and no result was recorded.
    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::End {
                session_id: "s1".to_owned(),
            },
        )
        .await;
    assert_eq!(h.status("s1").await, SessionStatus::Terminated);
    assert!(h.store.result("s1").await.expect("query").is_none());
}

#[tokio::test]
async fn silent_agent_hits_cancel_deadline() {
    let h = harness_with_deadline(Duration::from_millis(50)).await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _ = rx.recv().await;

    h.dispatcher.terminate("s1").await;
    let _ = rx.recv().await; // cancel frame

    // Agent never answers; the deadline fires.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.status("s1").await, SessionStatus::Terminated);

    let events = h.store.events_from("s1", 0).await.expect("events");
    let timeout_event = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("cancel_timeout event");
    assert_eq!(timeout_event.content["kind"], "cancel_timeout");
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::End));
}

#[tokio::test]
async fn terminate_queued_task_is_immediate() {
    let h = harness().await;
    let request = h.make_session("s1", TaskKind::Jailbreak).await;
    assert_eq!(h.dispatcher.dispatch(request).await, DispatchOutcome::Queued);

    h.dispatcher.terminate("s1").await;
    assert_eq!(h.status("s1").await, SessionStatus::Terminated);

    // A capable agent connecting later must not receive the dead task.
    let mut rx = h.connect_agent("late", vec![TaskKind::Jailbreak]);
    h.dispatcher.on_capacity().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn lost_agent_fails_its_sessions_with_kind() {
    let h = harness().await;
    let mut rx = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let request = h.make_session("s1", TaskKind::AiinfraScan).await;
    h.dispatcher.dispatch(request).await;
    let _ = rx.recv().await;

    // Connection teardown: unregister, then fan out failures.
    let orphaned = h.registry.unregister("a1");
    assert_eq!(orphaned, vec!["s1".to_owned()]);
    h.dispatcher.agent_lost("a1", orphaned).await;

    let session = h
        .store
        .get_session("s1")
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error.as_deref(), Some("agent_lost"));

    let events = h.store.events_from("s1", 0).await.expect("events");
    let error_event = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("terminal error event");
    assert_eq!(error_event.content["kind"], "agent_lost");
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::End));
    assert_eq!(h.registry.total_in_flight(), 0);
}

#[tokio::test]
async fn in_flight_matches_dispatched_and_running_sessions() {
    let h = harness().await;
    let _rx1 = h.connect_agent("a1", vec![TaskKind::AiinfraScan]);
    let _rx2 = h.connect_agent("a2", vec![TaskKind::AiinfraScan]);

    for i in 0..4 {
        let request = h
            .make_session(&format!("s{i}"), TaskKind::AiinfraScan)
            .await;
        h.dispatcher.dispatch(request).await;
    }
    assert_eq!(h.registry.total_in_flight(), 4);

    // Finish one.
    h.dispatcher
        .handle_agent_frame(
            "a1",
            AgentFrame::End {
                session_id: "s0".to_owned(),
            },
        )
        .await;
    assert_eq!(h.registry.total_in_flight(), 3);

    let mut live = 0usize;
    for i in 0..4 {
        let status = h.status(&format!("s{i}")).await;
        if matches!(status, SessionStatus::Dispatched | SessionStatus::Running) {
            live = live.saturating_add(1);
        }
    }
    assert_eq!(live, h.registry.total_in_flight());
}
