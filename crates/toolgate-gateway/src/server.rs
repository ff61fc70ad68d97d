//! HTTP server: the agent-facing SSE session transport plus the admin API

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use toolgate_core::ApiKey;
use toolgate_core::error::codes;
use toolgate_mcp::protocol::JsonRpcRequest;

use crate::admin;
use crate::auth::{authenticate, extract_api_key};
use crate::error::ApiError;
use crate::gateway::Gateway;
use crate::session::{OpenedSession, SessionManager};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionManager>,
    pub admin_role: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct KeyQuery {
    api_key: Option<String>,
}

/// The key presented with a request, from headers or `?api_key=`
pub(crate) fn presented_key(parts: &Parts) -> Option<String> {
    let query = Query::<KeyQuery>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();
    extract_api_key(&parts.headers, query.api_key.as_deref())
}

/// Any active API key; the role scopes what the session can see
pub struct AgentKey(pub ApiKey);

impl FromRequestParts<AppState> for AgentKey {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = authenticate(state.gateway.policy(), presented_key(parts)).await?;
        Ok(AgentKey(key))
    }
}

pub struct GatewayServer {
    state: AppState,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>, admin_role: impl Into<String>) -> Self {
        Self {
            state: AppState {
                gateway,
                sessions: Arc::new(SessionManager::new()),
                admin_role: admin_role.into(),
            },
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/sse", get(open_stream))
            .route("/messages", post(post_message))
            .nest("/admin", admin::routes())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` fires, then close every session
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        info!("toolgate listening on http://{}", addr);

        let sessions = Arc::clone(&self.state.sessions);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutting down, closing {} sessions", sessions.count());
                sessions.close_all();
            })
            .await
            .context("HTTP server failed")
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.count(),
        "connections": state.gateway.pool().connected(),
    }))
}

/// `GET /sse`: open a session. The first event names the POST endpoint; each
/// response the session produces follows as a `message` event.
async fn open_stream(
    State(state): State<AppState>,
    AgentKey(key): AgentKey,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let OpenedSession {
        id,
        outbound,
        guard,
    } = state.sessions.open(Arc::clone(&state.gateway), &key.role)?;
    info!(session_id = %id, "Agent '{}' connected with role '{}'", key.name, key.role);

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?sessionId={}", id));

    // The guard lives as long as the stream; dropping it ends the session
    let messages = ReceiverStream::new(outbound).map(move |response| {
        let _session = &guard;
        let data = serde_json::to_string(&response).unwrap_or_else(|e| {
            error!("Failed to encode response: {}", e);
            format!(
                r#"{{"jsonrpc":"2.0","id":null,"error":{{"code":{},"message":"Failed to encode response"}}}}"#,
                codes::INTERNAL_ERROR
            )
        });
        Ok(Event::default().event("message").data(data))
    });

    let stream = stream::once(async move { Ok(endpoint) }).chain(messages);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// `POST /messages?sessionId=`: queue one JSON-RPC message for a session
async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let session_id = query
        .session_id
        .ok_or_else(|| ApiError::bad_request("missing_session", "sessionId is required"))?;
    if !state.sessions.contains(&session_id) {
        return Err(ApiError::not_found(
            "session_not_found",
            format!("Session '{}' not found", session_id),
        ));
    }

    let request: JsonRpcRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("invalid_message", format!("Invalid JSON-RPC message: {}", e)))?;

    state.sessions.deliver(&session_id, request)?;
    Ok(StatusCode::ACCEPTED)
}
