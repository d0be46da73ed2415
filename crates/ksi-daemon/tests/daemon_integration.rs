//! End-to-end tests over the Unix socket.

use std::sync::Arc;
use std::time::Duration;

use ksi_client::KsiClient;
use ksi_completion::CompletionProvider;
use ksi_daemon::KsiDaemon;
use ksi_test::{StubProvider, temp_home};
use serde_json::{Value, json};
use tempfile::TempDir;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_daemon(provider: Arc<StubProvider>) -> (TempDir, Arc<KsiDaemon>) {
    let (dir, home) = temp_home();
    let mut config = ksi_config::load(&home).expect("load config");
    config.bus.correlation_timeout_secs = 2;
    config.daemon.shutdown_grace_secs = 2;
    let daemon = KsiDaemon::start(&home, config, provider as Arc<dyn CompletionProvider>)
        .await
        .expect("start daemon");
    (dir, daemon)
}

async fn connect(daemon: &KsiDaemon) -> KsiClient {
    KsiClient::connect(daemon.socket_path())
        .await
        .expect("connect")
        .with_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn test_health_round_trip() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    let started = std::time::Instant::now();
    let health = client.health().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(health["status"], "healthy");
    assert!(health["uptime"].as_f64().unwrap() >= 0.0);
    assert!(health["uptime_human"].as_str().unwrap().ends_with('s'));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_two_turn_conversation() {
    let provider = Arc::new(StubProvider::new().with_responses(&[
        "I will remember the number 42.",
        "The number you told me is 42.",
    ]));
    let (_dir, daemon) = start_daemon(Arc::clone(&provider)).await;
    let mut client = connect(&daemon).await;

    // Listen for completion results on this connection.
    let subscribed = client
        .request("message:subscribe", json!({"patterns": ["completion:result"]}))
        .await
        .unwrap();
    assert_eq!(subscribed["status"], "subscribed");

    let ack = client
        .completion_async("Remember the number 42.", "test", None)
        .await
        .unwrap();
    assert_eq!(ack["status"], "queued");

    let first = client.next_event(EVENT_TIMEOUT).await.unwrap();
    assert_eq!(first["event"], "completion:result");
    let session = first["data"]["result"]["response"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(session, "stub-sess-1");

    client
        .completion_async("What number?", "test", Some(&session))
        .await
        .unwrap();
    let second = client.next_event(EVENT_TIMEOUT).await.unwrap();
    assert!(
        second["data"]["result"]["response"]["result"]
            .as_str()
            .unwrap()
            .contains("42")
    );

    // The provider received the second turn with the chained session.
    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].session_id.is_none());
    assert_eq!(calls[1].session_id.as_ref().unwrap().as_str(), "stub-sess-1");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_invalid_json_keeps_connection_open() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    client.send_raw("{this is not json").await.unwrap();
    let error = client.next_event(EVENT_TIMEOUT).await.unwrap();
    assert_eq!(error["error"]["code"], "INVALID_JSON");

    // Same connection still works.
    let health = client.health().await.unwrap();
    assert_eq!(health["status"], "healthy");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_missing_event_name() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    client
        .send_raw(r#"{"data": {"x": 1}, "correlation_id": "c1"}"#)
        .await
        .unwrap();
    let error = client.next_event(EVENT_TIMEOUT).await.unwrap();
    assert_eq!(error["error"]["code"], "INVALID_EVENT");
    assert_eq!(error["correlation_id"], "c1");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unhandled_event_times_out() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    let response = client.request("nosuch:event", json!({})).await.unwrap();
    assert_eq!(response["error"]["code"], "TIMEOUT");
    assert_eq!(response["error"]["message"], "Response timeout");

    // The history records the unhandled dispatch.
    let events = client
        .request(
            "monitor:get_events",
            json!({"event_patterns": ["nosuch:*"]}),
        )
        .await
        .unwrap();
    assert_eq!(events["count"], 1);
    assert!(events["events"][0]["handlers_called"].as_array().unwrap().is_empty());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_discovery_over_the_wire() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    let discovered = client
        .request("system:discover", json!({"detail": true}))
        .await
        .unwrap();
    let events = discovered["events"].as_object().unwrap();
    for expected in [
        "system:health",
        "completion:async",
        "agent:spawn",
        "state:set",
        "injection:inject",
        "observation:subscribe",
        "monitor:get_events",
    ] {
        assert!(events.contains_key(expected), "missing {expected}");
    }
    assert_eq!(
        events["completion:async"]["parameters"]["prompt"]["required"],
        true
    );

    let help = client
        .request(
            "system:help",
            json!({"event": "state:set", "format_style": "mcp"}),
        )
        .await
        .unwrap();
    assert_eq!(help["name"], "state_set");
    assert_eq!(help["inputSchema"]["type"], "object");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_state_roundtrip_over_the_wire() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    client
        .request(
            "state:set",
            json!({"namespace": "test", "key": "greeting", "value": "hello"}),
        )
        .await
        .unwrap();
    let get = client
        .request("state:get", json!({"namespace": "test", "key": "greeting"}))
        .await
        .unwrap();
    assert_eq!(get["found"], true);
    assert_eq!(get["value"], "hello");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_agent_spawn_and_idempotent_terminate() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    let spawned = client
        .request(
            "agent:spawn",
            json!({"profile": "base_single_agent", "initial_prompt": "Say hi."}),
        )
        .await
        .unwrap();
    assert_eq!(spawned["status"], "created");
    let agent_id = spawned["agent_id"].as_str().unwrap().to_string();

    let listed = client.request("agent:list", json!({})).await.unwrap();
    assert_eq!(listed["count"], 1);

    let terminated = client
        .request("agent:terminate", json!({"agent_id": agent_id}))
        .await
        .unwrap();
    assert_eq!(terminated["status"], "terminated");

    // Terminating again, or an unknown agent, is a well-formed result.
    let again = client
        .request("agent:terminate", json!({"agent_id": agent_id}))
        .await
        .unwrap();
    assert_eq!(again["status"], "not_found");
    assert!(again.get("error").is_none());

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_malformed_json_feedback_scenario() {
    // One valid embedded event, two malformed ones.
    let response_text = concat!(
        r#"Done: {"event": "state:set", "data": {"key": "k", "value": "v"}} "#,
        r#"{'event': 'state:set', 'data': {'key': 'k2'}} "#,
        r#"{"event": "state:set", "data": {"key": "k3",}}"#,
    );
    let provider = Arc::new(StubProvider::new().with_responses(&[response_text]));
    let (_dir, daemon) = start_daemon(Arc::clone(&provider)).await;
    let mut client = connect(&daemon).await;

    client
        .request("message:subscribe", json!({"patterns": ["completion:result"]}))
        .await
        .unwrap();
    client
        .request(
            "completion:async",
            json!({"prompt": "emit events", "model": "test", "agent_id": "agent_e2e"}),
        )
        .await
        .unwrap();
    client.next_event(EVENT_TIMEOUT).await.unwrap();

    // Extraction runs just after the result is published; poll briefly.
    let mut value = json!(null);
    for _ in 0..50 {
        value = client
            .request("state:get", json!({"key": "k"}))
            .await
            .unwrap();
        if value["found"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(value["found"], true);
    assert_eq!(value["value"], "v");

    // Exactly one feedback injection for the agent's session, listing
    // both malformed patterns.
    let injections = client
        .request("injection:list", json!({"session_id": "stub-sess-1"}))
        .await
        .unwrap();
    assert_eq!(injections["count"], 1);
    let content = injections["injections"][0]["content"].as_str().unwrap();
    assert!(content.contains("1. "));
    assert!(content.contains("2. "));
    assert_eq!(injections["injections"][0]["is_feedback"], true);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_with_inflight_completions() {
    // Three workers mid-flight; shutdown lets them finish
    // within the grace period and injections survive to the next start.
    let provider = Arc::new(StubProvider::new().with_delay(Duration::from_millis(200)));
    let (dir, daemon) = start_daemon(Arc::clone(&provider)).await;
    let mut client = connect(&daemon).await;

    for session in ["a", "b", "c"] {
        client
            .completion_async("work", "test", Some(session))
            .await
            .unwrap();
    }
    client
        .request(
            "injection:inject",
            json!({"session_id": "survivor", "content": "carried across restarts"}),
        )
        .await
        .unwrap();

    let shutdown_ack = client.request("system:shutdown", json!({})).await.unwrap();
    assert_eq!(shutdown_ack["status"], "shutting_down");

    // The daemon signals shutdown; the embedder tears it down.
    let mut shutdown_rx = daemon.subscribe_shutdown();
    tokio::time::timeout(Duration::from_secs(2), shutdown_rx.recv())
        .await
        .expect("shutdown signal")
        .expect("channel open");
    let socket_path = daemon.socket_path();
    daemon.shutdown().await;

    // In-flight work completed within the grace period; socket removed.
    assert_eq!(provider.calls().len(), 3);
    assert!(!socket_path.exists());

    // Restart on the same home: the injection is still queued and is
    // consumed by the next completion in that session.
    let provider_b = Arc::new(StubProvider::new());
    let home = ksi_core::KsiHome::from_path(dir.path());
    let mut config = ksi_config::load(&home).unwrap();
    config.bus.correlation_timeout_secs = 2;
    let daemon_b = KsiDaemon::start(
        &home,
        config,
        Arc::clone(&provider_b) as Arc<dyn CompletionProvider>,
    )
    .await
    .expect("restart daemon");
    let mut client_b = connect(&daemon_b).await;

    client_b
        .request("message:subscribe", json!({"patterns": ["completion:result"]}))
        .await
        .unwrap();
    client_b
        .completion_async("next turn", "test", Some("survivor"))
        .await
        .unwrap();
    client_b.next_event(EVENT_TIMEOUT).await.unwrap();

    let calls = provider_b.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].prompt.contains("carried across restarts"));
    assert!(calls[0].prompt.ends_with("next turn"));

    daemon_b.shutdown().await;
}

#[tokio::test]
async fn test_subscription_teardown_on_disconnect() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;

    let mut client = connect(&daemon).await;
    client
        .request("message:subscribe", json!({"patterns": ["task:*"]}))
        .await
        .unwrap();
    let stats: Value = daemon
        .router()
        .emit("monitor:get_stats", json!({}), ksi_events::EmitOptions::new())
        .await
        .unwrap();
    assert_eq!(stats["active_subscriptions"], 1);

    drop(client);
    // Give the transport a beat to notice the disconnect.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats: Value = daemon
        .router()
        .emit("monitor:get_stats", json!({}), ksi_events::EmitOptions::new())
        .await
        .unwrap();
    assert_eq!(stats["active_subscriptions"], 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_requests_processed_in_order_per_connection() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    for i in 0..10 {
        client
            .request(
                "state:set",
                json!({"key": "counter", "value": i}),
            )
            .await
            .unwrap();
    }
    let last = client
        .request("state:get", json!({"key": "counter"}))
        .await
        .unwrap();
    assert_eq!(last["value"], 9);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_transport_status() {
    let (_dir, daemon) = start_daemon(Arc::new(StubProvider::new())).await;
    let mut client = connect(&daemon).await;

    let status = client.request("transport:status", json!({})).await.unwrap();
    assert_eq!(status["status"], "connected");
    assert!(status["connections"].as_u64().unwrap() >= 1);

    daemon.shutdown().await;
}
