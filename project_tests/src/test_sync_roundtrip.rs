//! # Synchronization Core Round-Trip Tests
//!
//! Drives the full client stack against a local axum fixture: an SSE
//! endpoint that disconnects once to exercise the reconnect path, plus the
//! generation REST endpoints walked from submission to completion. No
//! external services are involved; everything binds to an ephemeral local
//! port.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};

use lib_sync::{
    ApiClient, CleanupRegistry, GenerationConfig, GenerationTracker, HttpGenerationApi,
    SseTransport, StreamClient, StreamHandlers, StreamOptions,
};

/// Shared fixture counters so the test can assert how the clients behaved.
#[derive(Clone)]
struct FixtureState {
    stream_connects: Arc<Mutex<u32>>,
    poll_calls: Arc<Mutex<u32>>,
}

fn envelope(kind: &str, data: Value) -> Result<Event, Infallible> {
    Ok(Event::default().data(json!({"type": kind, "data": data}).to_string()))
}

/// First connection: seed snapshot, one update, then the stream ends so the
/// client must reconnect. Second connection onward: a richer snapshot (as a
/// real server would re-seed state) plus a tail update, held open.
async fn stream_handler(
    State(state): State<FixtureState>,
) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
    let connect_number = {
        let mut connects = state.stream_connects.lock().unwrap();
        *connects += 1;
        *connects
    };

    // First connection ends after its events to force a reconnect; later
    // connections are held open.
    let stream = if connect_number == 1 {
        stream::iter(vec![
            envelope("snapshot", json!([{"line": "boot"}])),
            envelope("heartbeat", Value::Null),
            envelope("update", json!({"line": "first"})),
        ])
        .boxed()
    } else {
        stream::iter(vec![
            envelope(
                "snapshot",
                json!([{"line": "boot"}, {"line": "first"}, {"line": "second"}]),
            ),
            envelope("update", json!({"line": "tail"})),
        ])
        .chain(stream::pending())
        .boxed()
    };
    Sse::new(stream)
}

async fn start_generation_handler(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "generation_id": "gen-42",
        "status": "pending",
        "total_emails": 2
    }))
}

async fn fetch_generation_handler(
    State(state): State<FixtureState>,
    Path(generation_id): Path<String>,
) -> Json<Value> {
    let call_number = {
        let mut calls = state.poll_calls.lock().unwrap();
        *calls += 1;
        *calls
    };

    if call_number == 1 {
        Json(json!({
            "generation_id": generation_id,
            "status": "in_progress",
            "total_emails": 2,
            "contacts_processed": 1,
            "generated_emails": []
        }))
    } else {
        Json(json!({
            "generation_id": generation_id,
            "status": "completed",
            "total_emails": 2,
            "contacts_processed": 2,
            "generated_emails": [
                {
                    "contact_id": "contact-0",
                    "sequence_step": 1,
                    "block_id": "block-1",
                    "block_name": "Opener",
                    "subject": "Hello 0",
                    "body": "Body 0",
                    "status": "generated"
                },
                {
                    "contact_id": "contact-1",
                    "sequence_step": 1,
                    "block_id": "block-1",
                    "block_name": "Opener",
                    "subject": "Hello 1",
                    "body": "Body 1",
                    "status": "generated"
                }
            ]
        }))
    }
}

async fn by_signal_handler(Path(_signal_id): Path<String>) -> Json<Value> {
    Json(json!({"status": "not_found"}))
}

async fn wait_until<F>(mut check: F, deadline: Duration, what: &str)
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while !check() {
        assert!(
            started.elapsed() < deadline,
            "Timed out waiting for: {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let fixture = FixtureState {
        stream_connects: Arc::new(Mutex::new(0)),
        poll_calls: Arc::new(Mutex::new(0)),
    };

    let app = Router::new()
        .route("/admin/logs/api/stream", get(stream_handler))
        .route("/emails/generate", post(start_generation_handler))
        .route("/emails/generations/{generation_id}", get(fetch_generation_handler))
        .route("/emails/by-signal/{signal_id}", get(by_signal_handler))
        .with_state(fixture.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fixture server failed");
    });

    println!("--- Starting Sync Core Round-Trip Tests (fixture at {addr}) ---");

    let registry = CleanupRegistry::new();

    // --- TEST 1: Stream reconciliation across a forced disconnect ---
    // The first connection delivers a snapshot plus one update and then
    // drops. The client must reconnect on its own, accept the re-seeded
    // snapshot wholesale, and append the tail update in arrival order.
    println!("\n[Test 1] Stream snapshot/update reconciliation with reconnect...");
    let mut options = StreamOptions::new(format!("http://{addr}/admin/logs/api/stream"));
    options.reconnect_interval = Duration::from_millis(300);

    let handlers = StreamHandlers::<String> {
        map_snapshot: Some(Arc::new(|value| {
            value
                .as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|e| e.get("line").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        })),
        map_item: Some(Arc::new(|value| {
            value
                .get("line")
                .and_then(Value::as_str)
                .map(str::to_string)
        })),
        ..StreamHandlers::default()
    };

    let client = StreamClient::spawn(
        SseTransport::new(None),
        options,
        handlers,
        registry.clone(),
    );

    {
        let mut rx = client.subscribe();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            {
                let state = rx.borrow_and_update();
                if state.items.last().map(String::as_str) == Some("tail") {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for the post-reconnect tail update"
            );
            let _ = tokio::time::timeout(Duration::from_secs(1), rx.changed()).await;
        }

        let state = rx.borrow();
        assert_eq!(state.items, ["boot", "first", "second", "tail"]);
        assert!(state.connected);
        assert!(state.error.is_none());
    }
    assert!(*fixture.stream_connects.lock().unwrap() >= 2);
    println!("✅ Reconnected and reconciled: {:?}", client.items());

    // --- TEST 2: clear() empties the list without dropping the connection ---
    println!("\n[Test 2] clear() leaves the connection alone...");
    client.clear();
    assert!(client.items().is_empty());
    assert!(client.connected());
    println!("✅ Cleared while still connected");

    // --- TEST 3: Generation job from reconciliation to completion ---
    println!("\n[Test 3] Generation polls to completion...");
    let api = Arc::new(HttpGenerationApi::new(Arc::new(ApiClient::new(
        &format!("http://{addr}/"),
        Some("test_secret_123".into()),
    ))));
    let config = GenerationConfig {
        fast_interval: Duration::from_millis(200),
        confirmation_delay: Duration::from_millis(100),
        ..GenerationConfig::default()
    };
    let tracker =
        GenerationTracker::with_config(api, registry.clone(), "signal-7", config);

    // Startup reconciliation finds nothing, so submitting is legitimate.
    tracker.refresh_status().await;
    assert!(tracker.state().generation.is_none());

    let generation_id = tracker
        .start_generation(lib_sync::GenerationRequest {
            sequence_id: "seq-1".into(),
            signal_id: "signal-7".into(),
            contacts: vec![json!({"contact_id": "contact-0"}), json!({"contact_id": "contact-1"})],
            company_data: json!({}),
            custom_data: json!({}),
        })
        .await;
    assert_eq!(generation_id.as_deref(), Some("gen-42"));

    wait_until(
        || tracker.state().has_results(),
        Duration::from_secs(20),
        "generation completion",
    )
    .await;

    let state = tracker.state();
    assert!(state.has_results());
    assert!(!state.has_failed());
    let generation = state.generation.expect("generation snapshot present");
    assert_eq!(generation.generated_emails.len(), 2);
    assert_eq!(generation.contacts_processed, 2);
    // The confirmation poll fires after completion is first observed.
    assert!(*fixture.poll_calls.lock().unwrap() >= 3);
    println!(
        "✅ Generation completed with {} emails",
        generation.generated_emails.len()
    );

    // --- TEST 4: Registry teardown drains everything and is idempotent ---
    println!("\n[Test 4] Registry cleanup...");
    registry.register_cleanup(|| println!("   (cleanup callback ran)"));
    registry.cleanup();
    registry.cleanup();
    let counts = registry.resource_counts();
    assert_eq!(counts.timers, 0);
    assert_eq!(counts.operations, 0);
    assert_eq!(counts.cleanup_callbacks, 0);
    assert!(registry.is_cleaned_up());
    println!("✅ Cleanup drained every resource: {counts:?}");

    println!("\n--- All Tests Passed Successfully ---");
    Ok(())
}
