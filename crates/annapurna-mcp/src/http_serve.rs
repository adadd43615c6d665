//! HTTP/SSE transport for the MCP server.
//!
//! Each `GET /sse` opens one session. The session owns a queue of inbound
//! requests and a single task that answers them in arrival order, writing
//! responses back onto the same event stream.
//!
//! # Protocol
//!
//! ```text
//! Client                                  Server
//!   │                                       │
//!   │── GET /sse ──────────────────────────►│ (open session)
//!   │◄── SSE: endpoint event ───────────────│ (message URL with session id)
//!   │                                       │
//!   │── POST /messages/?session_id=x ──────►│ (JSON-RPC request, 202)
//!   │◄── SSE: message event ────────────────│ (response)
//!   │                                       │
//! ```
//!
//! # Session lifecycle
//!
//! `Connected` → `Serving` → `Closed`. A session closes when the client
//! drops the event stream or the server shuts down; nothing reopens it.

use crate::error::{AnnapurnaError, AnnapurnaResult, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::handler::ToolHandler;
use crate::protocol::{
    CallToolParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RequestId, ServerCapabilities, ServerInfo, ToolCallResult, ToolsCapability,
    PROTOCOL_VERSION,
};
use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Path of the event stream.
pub const SSE_PATH: &str = "/sse";

/// Path clients post messages to.
pub const MESSAGES_PATH: &str = "/messages/";

/// Requests a session may have queued before posting blocks.
const SESSION_QUEUE_DEPTH: usize = 32;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream open, session task not yet running.
    Connected,
    /// Session task is answering requests.
    Serving,
    /// Terminal. Resources released.
    Closed,
}

/// Shared state for the MCP HTTP server.
#[derive(Clone)]
pub struct McpHttpState {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Tool invocation handler shared by all sessions.
    handler: ToolHandler,
    /// Active sessions (session_id -> session).
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    /// Message URL announced in the endpoint event.
    pub message_url: String,
    /// Optional API key for authentication.
    api_key: Option<String>,
    /// Cancelled on server shutdown; every session holds a child token.
    shutdown: CancellationToken,
}

/// Registry entry for an active session.
struct SessionHandle {
    inbound_tx: mpsc::Sender<JsonRpcRequest>,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

/// Why a posted message could not be delivered.
#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// No session with that id.
    UnknownSession,
    /// The session closed while the message was in flight.
    SessionClosed,
}

/// Closes the session when the event stream is dropped.
struct SessionGuard(CancellationToken);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl McpHttpState {
    /// Create a new MCP HTTP state.
    pub fn new(handler: ToolHandler, message_url: impl Into<String>) -> Self {
        Self {
            name: crate::tool::TOOL_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            handler,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            message_url: message_url.into(),
            api_key: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Require an API key on both routes.
    ///
    /// Accepted as `X-API-Key` or `Authorization: Bearer <key>`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Check if authentication is enabled.
    pub fn has_auth(&self) -> bool {
        self.api_key.is_some()
    }

    /// Number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Observe the lifecycle of a session.
    pub async fn watch_session(&self, session_id: &str) -> Option<watch::Receiver<SessionState>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.state.clone())
    }

    /// Close every session. Used on server shutdown.
    pub fn close_all_sessions(&self) {
        self.shutdown.cancel();
    }

    /// Open a session and start its task.
    ///
    /// Returns the session id, the receiving end of its response stream, and
    /// a guard that closes the session when dropped.
    async fn open_session(&self) -> (String, mpsc::Receiver<JsonRpcResponse>, SessionGuard) {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let (inbound_tx, inbound_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (outbound_tx, outbound_rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let cancel = self.shutdown.child_token();

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionHandle {
                inbound_tx,
                state: state_rx,
                cancel: cancel.clone(),
            },
        );
        info!(session_id = %session_id, "MCP session registered");

        tokio::spawn(self.clone().run_session(
            session_id.clone(),
            inbound_rx,
            outbound_tx,
            state_tx,
            cancel.clone(),
        ));

        (session_id, outbound_rx, SessionGuard(cancel))
    }

    /// Session loop: answer queued requests one at a time until closed.
    async fn run_session(
        self,
        session_id: String,
        mut inbound: mpsc::Receiver<JsonRpcRequest>,
        outbound: mpsc::Sender<JsonRpcResponse>,
        state: watch::Sender<SessionState>,
        cancel: CancellationToken,
    ) {
        state.send_replace(SessionState::Serving);
        debug!(session_id = %session_id, "MCP session serving");

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = inbound.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let Some(response) = self.handle_request(request).await else {
                continue;
            };
            if outbound.send(response).await.is_err() {
                warn!(session_id = %session_id, "Event stream gone, closing session");
                break;
            }
        }

        self.unregister_session(&session_id).await;
        state.send_replace(SessionState::Closed);
    }

    /// Unregister a session.
    async fn unregister_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(session_id).is_some() {
            info!(session_id = %session_id, "MCP session closed");
        }
    }

    /// Queue a request on a session.
    pub async fn deliver(
        &self,
        session_id: &str,
        request: JsonRpcRequest,
    ) -> Result<(), DeliveryError> {
        let tx = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(session_id)
                .ok_or(DeliveryError::UnknownSession)?;
            // Cancelled sessions stay registered until their task winds down.
            if session.cancel.is_cancelled() || *session.state.borrow() == SessionState::Closed {
                return Err(DeliveryError::SessionClosed);
            }
            session.inbound_tx.clone()
        };
        tx.send(request)
            .await
            .map_err(|_| DeliveryError::SessionClosed)
    }

    /// Handle a JSON-RPC request.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            debug!(method = %request.method, "Received notification");
            return None;
        }
        let id = request.id?;
        debug!(method = %request.method, id = %id, "Handling MCP request");

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(id),
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "tools/list" => self.handle_list_tools(id),
            "tools/call" => self.handle_call_tool(id, request.params).await,
            _ => JsonRpcResponse::failure(id, JsonRpcError::new(METHOD_NOT_FOUND, "Method not found")),
        };
        Some(response)
    }

    /// Handle the initialize request.
    fn handle_initialize(&self, id: RequestId) -> JsonRpcResponse {
        info!(name = %self.name, version = %self.version, "Initializing MCP session");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: self.name.clone(),
                version: Some(self.version.clone()),
            },
        };

        to_response(id, &result)
    }

    /// Handle the tools/list request.
    fn handle_list_tools(&self, id: RequestId) -> JsonRpcResponse {
        let result = ListToolsResult {
            tools: self.handler.list_tools(),
        };
        to_response(id, &result)
    }

    /// Handle the tools/call request.
    async fn handle_call_tool(&self, id: RequestId, params: Option<serde_json::Value>) -> JsonRpcResponse {
        let params = match params.map(serde_json::from_value::<CallToolParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::failure(id, AnnapurnaError::from(e).rpc_error());
            }
            None => {
                return JsonRpcResponse::failure(
                    id,
                    JsonRpcError::new(crate::error::INVALID_PARAMS, "Missing params"),
                );
            }
        };

        match self
            .handler
            .call_tool(&params.name, params.arguments.as_ref())
            .await
        {
            Ok(result) => {
                debug!(tool = %params.name, "Tool completed successfully");
                to_response(id, &result)
            }
            Err(e) if e.is_tool_failure() => {
                warn!(tool = %params.name, error = %e, "Tool failed");
                to_response(id, &ToolCallResult::error(e.to_string()))
            }
            Err(e) => {
                warn!(tool = %params.name, error = %e, "Tool call aborted");
                JsonRpcResponse::failure(id, e.rpc_error())
            }
        }
    }
}

fn to_response<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(crate::error::INTERNAL_ERROR, e.to_string()),
        ),
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Extract API key from request headers.
///
/// Supports both `X-API-Key` header and `Authorization: Bearer <key>` format.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Middleware to validate API key.
async fn api_key_auth(
    State(state): State<McpHttpState>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<serde_json::Value>)> {
    let Some(ref expected_key) = state.api_key else {
        return Ok(next.run(request).await);
    };

    match extract_api_key(request.headers()) {
        Some(key) if constant_time_eq(key.as_bytes(), expected_key.as_bytes()) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Invalid API key provided for MCP endpoint");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Invalid API key" })),
            ))
        }
        None => {
            warn!("Missing API key for MCP endpoint");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Authentication required" })),
            ))
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the MCP HTTP router.
pub fn create_mcp_router(state: McpHttpState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route(SSE_PATH, get(mcp_sse))
        .route(MESSAGES_PATH, post(mcp_message));

    let router = if state.has_auth() {
        info!("MCP API key authentication enabled");
        router.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_auth,
        ))
    } else {
        router
    };

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve sessions on `listener` until `shutdown` resolves.
///
/// Open sessions are closed on shutdown so their event streams end.
pub async fn serve(
    listener: TcpListener,
    state: McpHttpState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AnnapurnaResult<()> {
    let app = create_mcp_router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing sessions");
            state.close_all_sessions();
        })
        .await?;

    Ok(())
}

/// SSE connection handler.
async fn mcp_sse(
    State(state): State<McpHttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session_id, mut responses, guard) = state.open_session().await;
    let endpoint = format!("{}?session_id={}", state.message_url, session_id);

    info!(session_id = %session_id, endpoint = %endpoint, "MCP SSE connection established");

    let stream = async_stream::stream! {
        let _guard = guard;

        // The endpoint event carries the bare URL, not JSON.
        yield Ok(Event::default().event("endpoint").data(endpoint));

        while let Some(response) = responses.recv().await {
            match serde_json::to_string(&response) {
                Ok(data) => yield Ok(Event::default().event("message").data(data)),
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Query parameters for message endpoint.
#[derive(Deserialize)]
struct MessageQuery {
    #[serde(alias = "sessionId")]
    session_id: String,
}

/// Message endpoint handler.
async fn mcp_message(
    State(state): State<McpHttpState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> impl IntoResponse {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(session_id = %query.session_id, error = %e, "Malformed MCP message");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": PARSE_ERROR, "message": format!("Parse error: {e}") },
                })),
            );
        }
    };

    debug!(
        session_id = %query.session_id,
        method = %request.method,
        "Received MCP message"
    );

    match state.deliver(&query.session_id, request).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "accepted" })),
        ),
        Err(e) => {
            warn!(session_id = %query.session_id, reason = ?e, "Could not deliver message");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "Session not found" })),
            )
        }
    }
}
