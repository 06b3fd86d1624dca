//! REST surface tests over a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use armitage::config::ServerConfig;
use armitage::server::store::events::FrameSideEffect;
use armitage::server::store::Store;
use armitage::server::{router, AppState};
use armitage::types::EventType;

async fn spawn_server() -> (SocketAddr, AppState) {
    let mut config = ServerConfig::default();
    config.tasks.max_live_sessions_per_user = 3;
    let tmp = tempfile::tempdir().expect("should create tempdir");
    config.storage.uploads_dir = tmp.path().join("uploads");
    // Leak the tempdir so upload files survive the test body.
    std::mem::forget(tmp);

    let store = Store::open_in_memory().await.expect("should open store");
    let state = AppState::new(config, store);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = listener.local_addr().expect("local addr");
    let app = router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn create_task(
    addr: SocketAddr,
    user: &str,
    session_id: &str,
    kind: &str,
    content: &str,
) -> Value {
    client()
        .post(format!("http://{addr}/tasks"))
        .header("x-user", user)
        .json(&json!({
            "session_id": session_id,
            "task": kind,
            "content": content,
        }))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("response should be json")
}

#[tokio::test]
async fn create_task_validates_and_queues() {
    let (addr, _state) = spawn_server().await;

    // Valid id, no agent connected: accepted and queued.
    let body = create_task(addr, "alice", "abc_123", "aiinfra_scan", "http://t:5000/").await;
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"]["session_id"], "abc_123");
    assert_eq!(body["data"]["title"], "http://t:5000/");

    // Path characters are rejected with a validation error.
    let body = create_task(addr, "alice", "abc/..xyz", "aiinfra_scan", "x").await;
    assert_eq!(body["status"], 1);
    assert!(body["message"]
        .as_str()
        .expect("message")
        .starts_with("validation_error"));

    // Unknown kind.
    let body = create_task(addr, "alice", "abc_124", "port_scan", "x").await;
    assert_eq!(body["status"], 1);

    // Empty content.
    let body = create_task(addr, "alice", "abc_125", "aiinfra_scan", "  ").await;
    assert_eq!(body["status"], 1);

    // Duplicate session id.
    let body = create_task(addr, "alice", "abc_123", "aiinfra_scan", "x").await;
    assert_eq!(body["status"], 1);
    assert!(body["message"]
        .as_str()
        .expect("message")
        .starts_with("conflict"));
}

#[tokio::test]
async fn quota_limits_live_sessions_per_user() {
    let (addr, _state) = spawn_server().await;
    for i in 0..3 {
        let body = create_task(addr, "alice", &format!("q{i}"), "aiinfra_scan", "x").await;
        assert_eq!(body["status"], 0);
    }
    let body = create_task(addr, "alice", "q3", "aiinfra_scan", "x").await;
    assert_eq!(body["status"], 1);
    assert!(body["message"]
        .as_str()
        .expect("message")
        .contains("quota_exceeded"));

    // Another user is unaffected.
    let body = create_task(addr, "bob", "q3", "aiinfra_scan", "x").await;
    assert_eq!(body["status"], 0);
}

#[tokio::test]
async fn ownership_gates_mutations_and_share_opens_reads() {
    let (addr, _state) = spawn_server().await;
    create_task(addr, "alice", "s1", "aiinfra_scan", "x").await;

    // Non-owner cannot read, rename, or delete.
    let body: Value = client()
        .get(format!("http://{addr}/tasks/s1"))
        .header("x-user", "mallory")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 1);
    assert!(body["message"].as_str().expect("msg").starts_with("forbidden"));

    let body: Value = client()
        .patch(format!("http://{addr}/tasks/s1"))
        .header("x-user", "mallory")
        .json(&json!({"title": "stolen"}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 1);

    // Owner shares; non-owner may now read but still not mutate.
    let body: Value = client()
        .post(format!("http://{addr}/tasks/s1/share"))
        .header("x-user", "alice")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 0);

    let body: Value = client()
        .get(format!("http://{addr}/tasks/s1"))
        .header("x-user", "mallory")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"]["session"]["session_id"], "s1");

    let body: Value = client()
        .delete(format!("http://{addr}/tasks/s1"))
        .header("x-user", "mallory")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 1);
}

#[tokio::test]
async fn title_update_enforces_length() {
    let (addr, _state) = spawn_server().await;
    create_task(addr, "alice", "s1", "aiinfra_scan", "x").await;

    let body: Value = client()
        .patch(format!("http://{addr}/tasks/s1"))
        .header("x-user", "alice")
        .json(&json!({"title": "y".repeat(101)}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 1);

    let body: Value = client()
        .patch(format!("http://{addr}/tasks/s1"))
        .header("x-user", "alice")
        .json(&json!({"title": "renamed"}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], 0);

    let body: Value = client()
        .get(format!("http://{addr}/tasks/s1"))
        .header("x-user", "alice")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["data"]["session"]["title"], "renamed");
}

#[tokio::test]
async fn list_filters_by_kind_and_query() {
    let (addr, _state) = spawn_server().await;
    create_task(addr, "alice", "s1", "aiinfra_scan", "scan the mlflow box").await;
    create_task(addr, "alice", "s2", "mcp_scan", "audit my mcp server").await;

    let body: Value = client()
        .get(format!("http://{addr}/tasks?taskType=mcp_scan"))
        .header("x-user", "alice")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let tasks = body["data"]["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["session_id"], "s2");

    let body: Value = client()
        .get(format!("http://{addr}/tasks?q=mlflow"))
        .header("x-user", "alice")
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let tasks = body["data"]["tasks"].as_array().expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["session_id"], "s1");
}

#[tokio::test]
async fn upload_then_download_through_owning_session() {
    let (addr, state) = spawn_server().await;

    // Hand-built multipart body: the wire format clients actually send.
    let boundary = "testboundary42";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         scan targets list\r\n\
         --{boundary}--\r\n"
    );
    let response: Value = client()
        .post(format!("http://{addr}/upload"))
        .header("x-user", "alice")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(body)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(response["status"], 0);
    let file_url = response["data"]["file_url"]
        .as_str()
        .expect("file_url")
        .to_owned();
    assert_eq!(response["data"]["size"], 17);

    // A task referencing the upload binds it.
    let created: Value = client()
        .post(format!("http://{addr}/tasks"))
        .header("x-user", "alice")
        .json(&json!({
            "session_id": "s1",
            "task": "mcp_scan",
            "content": "audit the attached server",
            "attachments": [file_url],
        }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(created["status"], 0);

    let bytes = client()
        .post(format!("http://{addr}/tasks/s1/download"))
        .header("x-user", "alice")
        .json(&json!({"file_url": file_url}))
        .send()
        .await
        .expect("request")
        .bytes()
        .await
        .expect("bytes");
    assert_eq!(&bytes[..], b"scan targets list");

    // A file the session does not reference is refused.
    let missing: Value = client()
        .post(format!("http://{addr}/tasks/s1/download"))
        .header("x-user", "alice")
        .json(&json!({"file_url": "/files/other"}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(missing["status"], 1);

    drop(state);
}

#[tokio::test]
async fn sse_streams_replay_in_order() {
    let (addr, state) = spawn_server().await;
    create_task(addr, "alice", "s1", "aiinfra_scan", "x").await;

    // Two more persisted events beyond the seq-0 acceptance marker.
    for _ in 0..2 {
        state
            .bus
            .publish(
                "s1",
                EventType::ToolUseLog,
                json!({"text": "probe"}),
                FrameSideEffect::None,
            )
            .await
            .expect("publish");
    }

    let response = client()
        .get(format!("http://{addr}/tasks/s1/events"))
        .header("x-user", "alice")
        .send()
        .await
        .expect("request");
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let mut stream = response.bytes_stream();
    let mut collected = String::new();
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.expect("chunk");
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.matches("\"seq\":").count() >= 3 {
                break;
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "replay should arrive promptly");
    let first = collected.find("\"seq\":0").expect("seq 0 replayed");
    let second = collected.find("\"seq\":1").expect("seq 1 replayed");
    let third = collected.find("\"seq\":2").expect("seq 2 replayed");
    assert!(first < second && second < third, "replay ordered by seq");
}
