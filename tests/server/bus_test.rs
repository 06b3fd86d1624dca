//! Tests for the event bus: sequencing, replay, subscriber handover.

use std::sync::Arc;

use serde_json::json;

use armitage::server::bus::EventBus;
use armitage::server::store::events::FrameSideEffect;
use armitage::server::store::Store;
use armitage::types::{EventType, Language, TaskKind};

async fn bus_with_session(session_id: &str) -> Arc<EventBus> {
    let store = Store::open_in_memory().await.expect("should open store");
    store
        .create_session(
            session_id,
            "alice",
            "t",
            TaskKind::AiinfraScan,
            "http://t/",
            None,
            Language::En,
        )
        .await
        .expect("should create session");
    Arc::new(EventBus::new(store))
}

#[tokio::test]
async fn publish_assigns_monotonic_seq_from_zero() {
    let bus = bus_with_session("s1").await;
    for i in 0..5i64 {
        let seq = bus
            .publish("s1", EventType::ToolUseLog, json!({"text": i}), FrameSideEffect::None)
            .await
            .expect("should publish");
        assert_eq!(seq, i);
    }
}

#[tokio::test]
async fn seq_resumes_from_persisted_log() {
    let bus = bus_with_session("s1").await;
    bus.publish("s1", EventType::ToolUseLog, json!({}), FrameSideEffect::None)
        .await
        .expect("publish");
    bus.publish("s1", EventType::ToolUseLog, json!({}), FrameSideEffect::None)
        .await
        .expect("publish");

    // A fresh bus over the same store continues the sequence.
    let fresh = EventBus::new(bus.store().clone());
    let seq = fresh
        .publish("s1", EventType::ToolUseLog, json!({}), FrameSideEffect::None)
        .await
        .expect("publish");
    assert_eq!(seq, 2);
}

#[tokio::test]
async fn subscribe_replays_then_streams_live() {
    let bus = bus_with_session("s1").await;
    for i in 0..10 {
        bus.publish("s1", EventType::ToolUseLog, json!({"n": i}), FrameSideEffect::None)
            .await
            .expect("publish");
    }

    let (replay, mut live) = bus.subscribe("s1").await.expect("subscribe");
    assert_eq!(replay.len(), 10);
    let seqs: Vec<i64> = replay.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<i64>>());

    let seq = bus
        .publish("s1", EventType::End, json!({}), FrameSideEffect::None)
        .await
        .expect("publish");
    assert_eq!(seq, 10);
    let event = live.recv().await.expect("live event");
    assert_eq!(event.seq, 10);
    assert_eq!(event.event_type, EventType::End);
}

#[tokio::test]
async fn reconnect_replays_identical_prefix() {
    let bus = bus_with_session("s1").await;
    for i in 0..10 {
        bus.publish("s1", EventType::ToolUseLog, json!({"n": i}), FrameSideEffect::None)
            .await
            .expect("publish");
    }

    let (first, _live1) = bus.subscribe("s1").await.expect("subscribe");
    let (second, _live2) = bus.subscribe("s1").await.expect("subscribe again");
    let first_seqs: Vec<i64> = first.iter().map(|e| e.seq).collect();
    let second_seqs: Vec<i64> = second.iter().map(|e| e.seq).collect();
    assert_eq!(first_seqs, second_seqs, "replay is idempotent by seq");
}

#[tokio::test]
async fn second_subscriber_closes_the_first() {
    let bus = bus_with_session("s1").await;
    let (_replay, mut first) = bus.subscribe("s1").await.expect("subscribe");
    let (_replay, mut second) = bus.subscribe("s1").await.expect("subscribe again");

    bus.publish("s1", EventType::ToolUseLog, json!({}), FrameSideEffect::None)
        .await
        .expect("publish");

    // The first receiver's sender was replaced, so its stream ends.
    assert!(first.recv().await.is_none(), "first subscriber closed");
    let event = second.recv().await.expect("second subscriber live");
    assert_eq!(event.seq, 0);
}
