//! Tests for the SQLite store: sessions, events, plan side effects.

use serde_json::json;

use armitage::server::store::events::FrameSideEffect;
use armitage::server::store::Store;
use armitage::types::{
    EventType, Language, PlanStep, SessionStatus, StepStatus, TaskKind, ToolRecord, ToolStatus,
};

async fn store_with_session(session_id: &str) -> Store {
    let store = Store::open_in_memory().await.expect("should open store");
    store
        .create_session(
            session_id,
            "alice",
            "scan local mlflow",
            TaskKind::AiinfraScan,
            "http://127.0.0.1:5000/",
            None,
            Language::En,
        )
        .await
        .expect("should create session");
    store
}

#[tokio::test]
async fn session_lifecycle_and_terminal_immutability() {
    let store = store_with_session("s1").await;

    let session = store
        .get_session("s1")
        .await
        .expect("should query")
        .expect("should exist");
    assert_eq!(session.status, SessionStatus::Accepted);
    assert_eq!(session.username, "alice");
    assert!(!session.shared);

    assert!(store
        .set_session_status("s1", SessionStatus::Dispatched)
        .await
        .expect("should update"));
    assert!(store
        .set_session_status("s1", SessionStatus::Done)
        .await
        .expect("should update"));

    // Terminal is immutable.
    assert!(!store
        .set_session_status("s1", SessionStatus::Running)
        .await
        .expect("should not error"));
    assert!(!store
        .fail_session("s1", "late error")
        .await
        .expect("should not error"));
    let session = store
        .get_session("s1")
        .await
        .expect("should query")
        .expect("should exist");
    assert_eq!(session.status, SessionStatus::Done);
}

#[tokio::test]
async fn live_session_quota_counts_only_non_terminal() {
    let store = store_with_session("s1").await;
    store
        .create_session(
            "s2",
            "alice",
            "second",
            TaskKind::McpScan,
            "x",
            None,
            Language::En,
        )
        .await
        .expect("should create");
    assert_eq!(
        store.count_live_sessions("alice").await.expect("count"),
        2
    );
    store
        .set_session_status("s2", SessionStatus::Failed)
        .await
        .expect("update");
    assert_eq!(
        store.count_live_sessions("alice").await.expect("count"),
        1
    );
    assert_eq!(store.count_live_sessions("bob").await.expect("count"), 0);
}

#[tokio::test]
async fn frames_apply_atomically_with_side_effects() {
    let store = store_with_session("s1").await;
    store
        .set_session_status("s1", SessionStatus::Dispatched)
        .await
        .expect("update");

    let plan = vec![
        PlanStep {
            step_id: "step1".to_owned(),
            title: "Collect target information".to_owned(),
            status: StepStatus::Doing,
            started_at: None,
        },
        PlanStep {
            step_id: "step2".to_owned(),
            title: "Probe components".to_owned(),
            status: StepStatus::Todo,
            started_at: None,
        },
    ];
    store
        .apply_frame(
            "s1",
            0,
            EventType::PlanUpdate,
            &json!({"tasks": []}),
            &FrameSideEffect::Plan { steps: plan },
        )
        .await
        .expect("apply plan");

    // First progress frame promotes dispatched → running.
    let session = store
        .get_session("s1")
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(session.status, SessionStatus::Running);

    let steps = store.plan_steps("s1").await.expect("plan");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Doing);
    assert!(steps[0].started_at.is_some(), "doing step gets started_at");
    assert!(steps[1].started_at.is_none());

    // Step status never regresses.
    store
        .apply_frame(
            "s1",
            1,
            EventType::StepStatusUpdate,
            &json!({}),
            &FrameSideEffect::StepStatus {
                step_id: "step1".to_owned(),
                status: StepStatus::Done,
            },
        )
        .await
        .expect("apply step");
    store
        .apply_frame(
            "s1",
            2,
            EventType::StepStatusUpdate,
            &json!({}),
            &FrameSideEffect::StepStatus {
                step_id: "step1".to_owned(),
                status: StepStatus::Doing,
            },
        )
        .await
        .expect("apply stale step");
    let steps = store.plan_steps("s1").await.expect("plan");
    assert_eq!(steps[0].status, StepStatus::Done, "stale regression ignored");

    // Tool records advance doing → done only.
    let doing = ToolRecord {
        tool_id: "t1".to_owned(),
        name: "http_probe".to_owned(),
        status: ToolStatus::Doing,
        brief: "probe".to_owned(),
        action: "GET".to_owned(),
        target: "http://127.0.0.1:5000/".to_owned(),
        result_summary: String::new(),
    };
    store
        .apply_frame(
            "s1",
            3,
            EventType::ToolUsed,
            &json!({}),
            &FrameSideEffect::Tools {
                step_id: "step2".to_owned(),
                records: vec![doing.clone()],
            },
        )
        .await
        .expect("tool doing");
    let done = ToolRecord {
        status: ToolStatus::Done,
        result_summary: "1 component".to_owned(),
        ..doing
    };
    store
        .apply_frame(
            "s1",
            4,
            EventType::ToolUsed,
            &json!({}),
            &FrameSideEffect::Tools {
                step_id: "step2".to_owned(),
                records: vec![done],
            },
        )
        .await
        .expect("tool done");
    let tools = store.tool_records("s1").await.expect("tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].record.status, ToolStatus::Done);
    assert_eq!(tools[0].record.result_summary, "1 component");

    // Result and completion.
    store
        .apply_frame(
            "s1",
            5,
            EventType::ResultUpdate,
            &json!({"result": {"total": 1}}),
            &FrameSideEffect::Result {
                result: json!({"total": 1}),
            },
        )
        .await
        .expect("result");
    store
        .apply_frame(
            "s1",
            6,
            EventType::End,
            &json!({}),
            &FrameSideEffect::Complete,
        )
        .await
        .expect("end");

    let session = store
        .get_session("s1")
        .await
        .expect("query")
        .expect("exists");
    assert_eq!(session.status, SessionStatus::Done);
    let result = store.result("s1").await.expect("result").expect("present");
    assert_eq!(result["total"], 1);

    // The event log is totally ordered by seq.
    let events = store.events_from("s1", 0).await.expect("events");
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(store.last_seq("s1").await.expect("last"), Some(6));
}

#[tokio::test]
async fn duplicate_seq_is_rejected() {
    let store = store_with_session("s1").await;
    store
        .apply_frame("s1", 0, EventType::End, &json!({}), &FrameSideEffect::None)
        .await
        .expect("first");
    let duplicate = store
        .apply_frame("s1", 0, EventType::End, &json!({}), &FrameSideEffect::None)
        .await;
    assert!(duplicate.is_err(), "primary key must reject duplicate seq");
}

#[tokio::test]
async fn list_sessions_filters_by_kind_and_query() {
    let store = store_with_session("s1").await;
    store
        .create_session(
            "s2",
            "alice",
            "audit mcp server",
            TaskKind::McpScan,
            "github.com/example/mcp",
            None,
            Language::En,
        )
        .await
        .expect("create");

    let all = store
        .list_sessions("alice", None, None, 20, 0)
        .await
        .expect("list");
    assert_eq!(all.len(), 2);

    let scans = store
        .list_sessions("alice", Some(TaskKind::AiinfraScan), None, 20, 0)
        .await
        .expect("list");
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].session_id, "s1");

    let matched = store
        .list_sessions("alice", None, Some("mcp"), 20, 0)
        .await
        .expect("list");
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].session_id, "s2");
}

#[tokio::test]
async fn delete_session_removes_dependents() {
    let store = store_with_session("s1").await;
    store
        .apply_frame(
            "s1",
            0,
            EventType::NewPlanStep,
            &json!({}),
            &FrameSideEffect::NewStep {
                step_id: "step1".to_owned(),
                title: "x".to_owned(),
            },
        )
        .await
        .expect("frame");
    store.delete_session("s1").await.expect("delete");
    assert!(store.get_session("s1").await.expect("query").is_none());
    assert!(store.events_from("s1", 0).await.expect("events").is_empty());
    assert!(store.plan_steps("s1").await.expect("plan").is_empty());
}
