use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::transport::Transport;
use agent_core::McpSession;
use agent_transport::ndjson::{EndpointPair, NdjsonTransport};
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

#[derive(Clone)]
struct TestState {
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    writes: Arc<AtomicUsize>,
}

impl TestState {
    fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(Some(outbound_rx))),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

async fn stream_handler(State(state): State<TestState>) -> impl IntoResponse {
    let Some(rx) = state.outbound_rx.lock().await.take() else {
        return StatusCode::CONFLICT.into_response();
    };
    let lines = UnboundedReceiverStream::new(rx).map(|line| Ok::<_, Infallible>(line + "\n"));
    (
        [("content-type", "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn write_handler(State(state): State<TestState>, Json(body): Json<Value>) -> StatusCode {
    state.writes.fetch_add(1, Ordering::SeqCst);

    // Notifications get no reply.
    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    let method = body.get("method").and_then(Value::as_str).unwrap_or("");

    let reply = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "ndjson-test", "version": "1.0.0" }
            }
        }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [{
                    "name": "summarize",
                    "description": "Summarize the loaded data",
                    "inputSchema": { "type": "object", "properties": { "column": { "type": "string" } } }
                }]
            }
        }),
        "tools/call" if body.pointer("/params/name") == Some(&json!("explode")) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "content": [{ "type": "text", "text": "column not found" }], "isError": true }
        }),
        "tools/call" => {
            let column = body
                .pointer("/params/arguments/column")
                .and_then(Value::as_str)
                .unwrap_or("?");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": format!("mean of {column} is 4.2") }] }
            })
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("Method not found: {other}") }
        }),
    };

    // A keep-alive blank line and a junk line precede the real reply.
    let _ = state.outbound_tx.send(String::new());
    let _ = state.outbound_tx.send("{not json".to_string());
    let _ = state.outbound_tx.send(reply.to_string());
    StatusCode::ACCEPTED
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_falls_back_to_alternate_endpoints_when_primary_is_missing() {
    let state = TestState::new();
    let app = Router::new()
        .route("/mcp/sse", get(stream_handler))
        .route("/mcp/message", post(write_handler))
        .with_state(state.clone());
    let base = serve(app).await;

    let transport = Arc::new(NdjsonTransport::new(
        format!("{base}/mcp"),
        Duration::from_secs(5),
    ));
    let session = McpSession::new(transport.clone()).with_request_timeout(Duration::from_secs(5));

    let info = session.initialize().await.expect("initialize should succeed");
    assert_eq!(info["serverInfo"]["name"], "ndjson-test");
    assert_eq!(
        transport.active_endpoints().await,
        EndpointPair {
            read: "sse",
            write: "message"
        }
    );

    let tools = session.list_tools().await.expect("tools/list should resolve");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "summarize");

    let result = session
        .call_tool("summarize", json!({ "column": "price" }))
        .await
        .expect("tools/call should resolve");
    assert_eq!(result.flatten_text(), "mean of price is 4.2");

    let err = session.call_tool("explode", json!({})).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Tool invocation error: explode: column not found"
    );

    // initialize, initialized, tools/list, two tools/call
    assert_eq!(state.writes.load(Ordering::SeqCst), 5);

    session.close().await.unwrap();
    assert!(session.list_tools().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_reports_every_probed_endpoint_when_none_respond() {
    let base = serve(Router::new()).await;
    let transport = NdjsonTransport::new(format!("{base}/mcp"), Duration::from_secs(5));

    let err = match transport.inbound().await {
        Ok(_) => panic!("no endpoint should have been adopted"),
        Err(e) => e.to_string(),
    };

    for name in ["stream", "events", "sse", "read"] {
        let url = format!("{base}/mcp/{name}");
        assert!(err.contains(&url), "{err} should mention {url}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_does_not_probe_when_primary_fails_for_other_reasons() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    let app = Router::new()
        .route(
            "/mcp/stream",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .route(
            "/mcp/events",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        );
    let base = serve(app).await;
    let transport = NdjsonTransport::new(format!("{base}/mcp"), Duration::from_secs(5));

    let err = match transport.inbound().await {
        Ok(_) => panic!("a 500 from the primary endpoint must not be accepted"),
        Err(e) => e.to_string(),
    };

    assert!(err.contains("500"), "unexpected error: {err}");
    assert_eq!(probes.load(Ordering::SeqCst), 0);
    assert_eq!(transport.active_endpoints().await.read, "stream");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_session_fails_fast_when_stream_cannot_be_opened() {
    let base = serve(Router::new()).await;
    let transport = Arc::new(NdjsonTransport::new(
        format!("{base}/mcp"),
        Duration::from_secs(5),
    ));
    let session = McpSession::new(transport).with_request_timeout(Duration::from_secs(5));

    let err = session.list_tools().await.unwrap_err();
    assert!(err.to_string().contains("no stream endpoint responded"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ndjson_adopts_first_alternate_that_answers_in_order() {
    let events_hits = Arc::new(AtomicUsize::new(0));
    let read_hits = Arc::new(AtomicUsize::new(0));
    let (events_counter, read_counter) = (events_hits.clone(), read_hits.clone());

    let state = TestState::new();
    let app = Router::new()
        .route(
            "/mcp/events",
            get(move || {
                let counter = events_counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }
            }),
        )
        .route("/mcp/sse", get(stream_handler))
        .route(
            "/mcp/read",
            get(move || {
                let counter = read_counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }
            }),
        )
        .with_state(state);
    let base = serve(app).await;
    let transport = NdjsonTransport::new(format!("{base}/mcp"), Duration::from_secs(5));

    let _inbound = match transport.inbound().await {
        Ok(stream) => stream,
        Err(e) => panic!("the sse alternate should have been adopted: {e}"),
    };

    assert_eq!(
        transport.active_endpoints().await,
        EndpointPair {
            read: "sse",
            write: "message"
        }
    );
    assert_eq!(events_hits.load(Ordering::SeqCst), 1);
    assert_eq!(read_hits.load(Ordering::SeqCst), 0);
}
