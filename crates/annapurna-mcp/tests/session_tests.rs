//! End-to-end tests for the SSE session transport.
//!
//! A real listener on 127.0.0.1:0 serves sessions; the retrieval API is a
//! wiremock server.

use annapurna_mcp::{
    serve, CredentialSet, McpHttpState, RetrievalClient, SharedCredentials, ToolHandler,
    INVALID_PARAMS, MESSAGES_PATH, METHOD_NOT_FOUND,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RETRIEVE_PATH: &str = "/api/annapurna/ret-1/retrieve";

fn test_state(upstream: &MockServer) -> McpHttpState {
    let client = RetrievalClient::new(
        format!("{}{RETRIEVE_PATH}", upstream.uri()),
        Duration::from_secs(5),
    )
    .unwrap();
    let handler = ToolHandler::new(client, SharedCredentials::new(CredentialSet::new("tok", None)));
    McpHttpState::new(handler, MESSAGES_PATH)
}

/// Start a server that runs until the returned sender fires or is dropped.
async fn start(state: McpHttpState) -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        serve(listener, state, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });

    (format!("http://{addr}"), tx, handle)
}

/// One MCP client session: an open event stream plus its message URL.
struct Session {
    http: reqwest::Client,
    events: reqwest::Response,
    buffer: String,
    message_url: String,
    endpoint: String,
}

impl Session {
    async fn open(base: &str) -> Self {
        Self::open_with(base, reqwest::Client::new().get(format!("{base}/sse"))).await
    }

    async fn open_with(base: &str, request: reqwest::RequestBuilder) -> Self {
        let events = request.send().await.unwrap();
        assert_eq!(events.status(), 200);
        assert!(events.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let mut session = Self {
            http: reqwest::Client::new(),
            events,
            buffer: String::new(),
            message_url: String::new(),
            endpoint: String::new(),
        };

        let (event, data) = session.next_event().await;
        assert_eq!(event, "endpoint");
        session.message_url = format!("{base}{data}");
        session.endpoint = data;
        session
    }

    /// Next event with a data field, skipping keep-alive comments.
    async fn next_event(&mut self) -> (String, String) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(end) = self.buffer.find("\n\n") {
                    let block: String = self.buffer.drain(..end + 2).collect();
                    let mut event = String::from("message");
                    let mut data = Vec::new();
                    for line in block.lines() {
                        if let Some(value) = line.strip_prefix("event:") {
                            event = value.trim().to_string();
                        } else if let Some(value) = line.strip_prefix("data:") {
                            data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                        }
                    }
                    if !data.is_empty() {
                        return (event, data.join("\n"));
                    }
                    continue;
                }

                let chunk = self
                    .events
                    .chunk()
                    .await
                    .unwrap()
                    .expect("event stream ended");
                self.buffer.push_str(&String::from_utf8_lossy(&chunk));
            }
        })
        .await
        .expect("timed out waiting for an event")
    }

    /// Whether the server has ended the event stream.
    async fn stream_ended(&mut self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), self.events.chunk()).await {
                Ok(Ok(Some(_))) => continue,
                Ok(Ok(None)) | Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    async fn post_raw(&self, body: impl Into<reqwest::Body>) -> reqwest::Response {
        self.http
            .post(&self.message_url)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, message: Value) -> reqwest::Response {
        self.post_raw(message.to_string()).await
    }

    /// Send a request and wait for its response on the event stream.
    async fn call(&mut self, id: i64, method: &str, params: Option<Value>) -> Value {
        let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        assert_eq!(self.post(message).await.status(), 202);

        let (event, data) = self.next_event().await;
        assert_eq!(event, "message");
        let response: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(response["id"], id);
        response
    }

    async fn call_tool(&mut self, id: i64, query: &str) -> Value {
        self.call(
            id,
            "tools/call",
            Some(json!({ "name": "annapurna", "arguments": { "query": query } })),
        )
        .await
    }
}

fn result_text(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap()
}

#[tokio::test]
async fn test_endpoint_event_names_session() {
    let upstream = MockServer::start().await;
    let state = test_state(&upstream);
    let (base, _shutdown, _server) = start(state.clone()).await;

    let session = Session::open(&base).await;
    let id = session
        .endpoint
        .strip_prefix("/messages/?session_id=")
        .unwrap();

    assert_eq!(id.len(), 32);
    assert!(state.watch_session(id).await.is_some());
}

#[tokio::test]
async fn test_initialize_and_list_tools() {
    let upstream = MockServer::start().await;
    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let init = session
        .call(
            1,
            "initialize",
            Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" },
            })),
        )
        .await;
    assert_eq!(init["result"]["serverInfo"]["name"], "annapurna");
    assert!(init["result"]["capabilities"]["tools"].is_object());

    let listed = session.call(2, "tools/list", None).await;
    let tools = listed["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "annapurna");
    assert_eq!(tools[0]["inputSchema"]["required"], json!(["query"]));
    assert_eq!(
        tools[0]["description"],
        "Returns a list of chunks providing more context for a given query"
    );
}

#[tokio::test]
async fn test_call_tool_passes_body_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RETRIEVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"chunks":["a","b"]}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let response = session.call_tool(1, "x").await;
    assert_eq!(result_text(&response), r#"{"chunks":["a","b"]}"#);
    assert_eq!(response["result"]["isError"], false);
}

#[tokio::test]
async fn test_upstream_error_then_success_on_same_session() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RETRIEVE_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path(RETRIEVE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&upstream)
        .await;

    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let failed = session.call_tool(1, "x").await;
    assert!(failed.get("error").is_none());
    assert_eq!(failed["result"]["isError"], true);
    let text = result_text(&failed);
    assert!(text.contains("403"));
    assert!(text.contains("denied"));

    let ok = session.call_tool(2, "x").await;
    assert_eq!(result_text(&ok), "[]");
}

#[tokio::test]
async fn test_unknown_tool_makes_no_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let response = session
        .call(
            1,
            "tools/call",
            Some(json!({ "name": "search", "arguments": { "query": "x" } })),
        )
        .await;
    assert_eq!(response["result"]["isError"], true);
    assert!(result_text(&response).contains("Unknown tool"));

    let response = session
        .call(
            2,
            "tools/call",
            Some(json!({ "name": "annapurna", "arguments": {} })),
        )
        .await;
    assert_eq!(response["result"]["isError"], true);

    // Params that do not decode at all stay a protocol error.
    let response = session.call(3, "tools/call", None).await;
    assert_eq!(response["error"]["code"], INVALID_PARAMS);
}

#[tokio::test]
async fn test_responses_follow_request_order() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_json(json!({ "query": "slow" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(body_json(json!({ "query": "fast" })))
        .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
        .mount(&upstream)
        .await;

    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    for (id, query) in [(1, "slow"), (2, "fast")] {
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": "annapurna", "arguments": { "query": query } },
        });
        assert_eq!(session.post(message).await.status(), 202);
    }

    let (_, first) = session.next_event().await;
    let (_, second) = session.next_event().await;
    let first: Value = serde_json::from_str(&first).unwrap();
    let second: Value = serde_json::from_str(&second).unwrap();

    assert_eq!(first["id"], 1);
    assert_eq!(result_text(&first), "slow");
    assert_eq!(second["id"], 2);
    assert_eq!(result_text(&second), "fast");
}

#[tokio::test]
async fn test_concurrent_sessions_get_their_own_results() {
    let upstream = MockServer::start().await;
    for marker in ["alpha", "beta"] {
        Mock::given(method("POST"))
            .and(body_json(json!({ "query": marker })))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("result-{marker}")))
            .expect(1)
            .mount(&upstream)
            .await;
    }

    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut a = Session::open(&base).await;
    let mut b = Session::open(&base).await;
    assert_ne!(a.endpoint, b.endpoint);

    let (ra, rb) = tokio::join!(a.call_tool(1, "alpha"), b.call_tool(1, "beta"));

    assert_eq!(result_text(&ra), "result-alpha");
    assert_eq!(result_text(&rb), "result-beta");
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let upstream = MockServer::start().await;
    let (base, _shutdown, _server) = start(test_state(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/messages/?session_id=does-not-exist"))
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_malformed_message_keeps_session_open() {
    let upstream = MockServer::start().await;
    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    assert_eq!(session.post_raw("{not json").await.status(), 400);

    let response = session.call(7, "ping", None).await;
    assert!(response["error"].is_null());
}

#[tokio::test]
async fn test_notifications_get_no_reply() {
    let upstream = MockServer::start().await;
    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
    assert_eq!(session.post(notification).await.status(), 202);

    // The next event must answer the ping, not the notification.
    let response = session.call(3, "ping", None).await;
    assert_eq!(response["id"], 3);

    let response = session.call(4, "resources/list", None).await;
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_string_request_ids_are_echoed() {
    let upstream = MockServer::start().await;
    let (base, _shutdown, _server) = start(test_state(&upstream)).await;
    let mut session = Session::open(&base).await;

    let message = json!({ "jsonrpc": "2.0", "id": "req-1", "method": "ping" });
    assert_eq!(session.post(message).await.status(), 202);

    let (_, data) = session.next_event().await;
    let response: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(response["id"], "req-1");
}

#[tokio::test]
async fn test_api_key_guards_both_routes() {
    let upstream = MockServer::start().await;
    let state = test_state(&upstream).with_api_key("s3cret");
    let (base, _shutdown, _server) = start(state).await;
    let http = reqwest::Client::new();

    let denied = http.get(format!("{base}/sse")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = http
        .get(format!("{base}/sse"))
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let mut session = Session::open_with(
        &base,
        http.get(format!("{base}/sse")).header("x-api-key", "s3cret"),
    )
    .await;

    let unauthenticated = session
        .post(json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .await;
    assert_eq!(unauthenticated.status(), 401);

    let accepted = session
        .http
        .post(&session.message_url)
        .bearer_auth("s3cret")
        .json(&json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);

    let (_, data) = session.next_event().await;
    let response: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(response["id"], 2);
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let upstream = MockServer::start().await;
    let state = test_state(&upstream);
    let (base, shutdown, server) = start(state.clone()).await;

    let mut session = Session::open(&base).await;
    assert_eq!(state.session_count().await, 1);

    shutdown.send(()).unwrap();

    assert!(session.stream_ended().await);
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert_eq!(state.session_count().await, 0);
}
