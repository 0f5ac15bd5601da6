//! HTTP surface of the proxy.
//!
//! - `GET /sse`: open a session, answered with the browser's SSE stream
//! - `POST /message?sessionId=...`: deliver a browser message to its session
//! - `GET /config`: defaults the web UI pre-fills its connection form with

use crate::config::ProxyConfig;
use crate::session::SessionManager;
use crate::transport::{default_environment, ConnectQuery, TransportParams};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_proxy_core::{JsonRpcMessage, RelayError, RelayResult};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Path browsers post their messages to.
pub const MESSAGE_PATH: &str = "/message";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(config: ProxyConfig) -> Self {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.clone(), MESSAGE_PATH));
        Self { config, sessions }
    }
}

/// Build the proxy's router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route(MESSAGE_PATH, post(message_handler))
        .route("/config", get(config_handler))
        .layer(DefaultBodyLimit::max(state.config.max_message_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The proxy server instance.
pub struct ProxyServer {
    state: AppState,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    /// Bind and serve until the listener fails.
    pub async fn run(self) -> RelayResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.state.config.host, self.state.config.port)
            .parse()
            .map_err(|e| RelayError::Other(format!("invalid address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "MCP proxy listening");

        axum::serve(listener, build_router(self.state)).await?;
        Ok(())
    }
}

/// Error response for the HTTP layer.
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::SessionNotFound(_) => {
                return (StatusCode::NOT_FOUND, "Session not found").into_response();
            }
            RelayError::InvalidTransportKind(_)
            | RelayError::InvalidParams(_)
            | RelayError::InvalidMessage(_)
            | RelayError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// `GET /sse`
async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Result<impl IntoResponse, ApiError> {
    info!(transport_type = ?query.transport_type, "new SSE connection");

    let params = TransportParams::from_query(&query).map_err(|e| {
        warn!(error = %e, "rejected SSE connection");
        e
    })?;

    let kind = params.kind();
    let session = state.sessions.establish(params).await.map_err(|e| {
        error!(transport = ?kind, error = %e, "failed to establish session");
        e
    })?;
    debug!(session_id = %session.id, transport = ?kind, "streaming session events");

    Ok(Sse::new(session.stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// `POST /message?sessionId=...`
async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = query.session_id.unwrap_or_default();
    debug!(session_id = %session_id, "received message");

    let client = state.sessions.lookup(&session_id).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(RelayError::InvalidMessage(format!(
            "unsupported content-type: {content_type:?}"
        ))
        .into());
    }

    let message: JsonRpcMessage = serde_json::from_slice(&body)?;
    client.handle_post_message(message)?;
    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// `GET /config`
async fn config_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "defaultEnvironment": default_environment(),
        "defaultCommand": state.config.default_command,
        "defaultArgs": state.config.default_args,
    }))
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(RelayError::Json(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SseServerTransport, SseStream};
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::StreamExt;
    use mcp_proxy_core::{Transport, TransportEvent};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(ProxyConfig {
            default_command: "npx".into(),
            default_args: "-y server-everything".into(),
            ..ProxyConfig::default()
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Register a started browser transport directly, bypassing `/sse`.
    async fn open_client(state: &AppState) -> (Arc<SseServerTransport>, SseStream) {
        let client = Arc::new(SseServerTransport::new(MESSAGE_PATH));
        let stream = client.event_stream().unwrap();
        client.start().await.unwrap();
        state
            .sessions
            .registry()
            .register(client.session_id(), &client)
            .await
            .unwrap();
        (client, stream)
    }

    #[tokio::test]
    async fn config_reports_defaults() {
        let app = build_router(state());
        let (status, text) = send(&app, get_req("/config")).await;
        assert_eq!(status, StatusCode::OK);

        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["defaultCommand"], "npx");
        assert_eq!(body["defaultArgs"], "-y server-everything");
        assert!(body["defaultEnvironment"].is_object());
    }

    #[tokio::test]
    async fn message_for_unknown_session_is_404() {
        let app = build_router(state());
        let (status, text) = send(&app, post_json("/message?sessionId=nope", "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(text, "Session not found");

        let (status, _) = send(&app, post_json("/message", "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn message_for_closed_session_is_404() {
        let state = state();
        let app = build_router(state.clone());
        let (client, _stream) = open_client(&state).await;
        client.close().await.unwrap();

        let uri = format!("/message?sessionId={}", client.session_id());
        let (status, text) = send(&app, post_json(&uri, r#"{"id":1}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(text, "Session not found");
    }

    #[tokio::test]
    async fn invalid_transport_type_is_400() {
        let state = state();
        let app = build_router(state.clone());
        let (status, text) = send(&app, get_req("/sse?transportType=carrier-pigeon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("invalid transport type"), "body: {text}");
        assert_eq!(state.sessions.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn stdio_without_command_is_400() {
        let app = build_router(state());
        let (status, _) = send(&app, get_req("/sse?transportType=stdio")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn spawn_failure_is_500() {
        let app = build_router(state());
        let (status, text) = send(
            &app,
            get_req("/sse?transportType=stdio&command=/definitely/not/a/real/binary"),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.contains("transport start failed"), "body: {text}");
    }

    #[tokio::test]
    async fn message_requires_json_content_type_and_body() {
        let state = state();
        let app = build_router(state.clone());
        let (client, _stream) = open_client(&state).await;
        let uri = format!("/message?sessionId={}", client.session_id());

        let request = Request::builder()
            .method("POST")
            .uri(&uri)
            .header("content-type", "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post_json(&uri, "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn messages_are_routed_to_their_own_session() {
        let state = state();
        let app = build_router(state.clone());
        let (a, _stream_a) = open_client(&state).await;
        let (b, _stream_b) = open_client(&state).await;
        let mut events_a = a.subscribe().unwrap();
        let mut events_b = b.subscribe().unwrap();

        let uri = format!("/message?sessionId={}", a.session_id());
        let (status, text) = send(&app, post_json(&uri, r#"{"id":1,"method":"ping"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(text, "Accepted");

        match events_a.try_recv().unwrap() {
            TransportEvent::Message(m) => assert_eq!(m["method"], "ping"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events_b.try_recv().is_err());
    }

    async fn read_until(needle: &str, text: &mut String, body: &mut axum::body::BodyDataStream) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !text.contains(needle) {
                let chunk = body.next().await.expect("stream ended").unwrap();
                text.push_str(&String::from_utf8_lossy(&chunk));
            }
        })
        .await
        .expect("timed out reading SSE stream");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_session_end_to_end() {
        let state = state();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(get_req("/sse?transportType=stdio&command=cat&args="))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();
        let mut text = String::new();

        read_until("\n\n", &mut text, &mut body).await;
        assert!(text.starts_with("event: endpoint\n"), "body: {text}");
        let session_id = text
            .split("sessionId=")
            .nth(1)
            .unwrap()
            .split_whitespace()
            .next()
            .unwrap()
            .to_string();
        assert_eq!(state.sessions.active_sessions().await, 1);

        let uri = format!("/message?sessionId={session_id}");
        let (status, _) = send(&app, post_json(&uri, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        read_until("\"method\":\"ping\"", &mut text, &mut body).await;
        assert!(text.contains("event: message\n"), "body: {text}");

        // Browser disconnects: the session is torn down and deregistered.
        drop(body);
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.sessions.active_sessions().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not deregistered");

        let (status, _) = send(&app, post_json(&uri, "{}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
