//! Admin API under `/admin`, open only to keys carrying the admin role

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use toolgate_core::config::ServerManifest;
use toolgate_core::{
    ApiKey, CallLogEntry, PolicyRule, RuleAction, ServerStatus, ToolServer, Transport,
};

use crate::auth::authorize_admin;
use crate::error::ApiError;
use crate::gateway::Registration;
use crate::server::{AppState, presented_key};
use crate::session::SessionInfo;

pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 1000;

/// A key whose role is the configured admin role
pub struct AdminKey(pub ApiKey);

impl FromRequestParts<AppState> for AdminKey {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let key = authorize_admin(
            state.gateway.policy(),
            presented_key(parts),
            &state.admin_role,
        )
        .await?;
        Ok(AdminKey(key))
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/servers", get(list_servers).post(register_server))
        .route("/servers/{name}", delete(remove_server))
        .route("/servers/{name}/status", put(set_status))
        .route("/servers/{name}/sync", post(sync_server))
        .route("/stats", get(stats))
        .route("/logs", get(recent_logs))
        .route("/sessions", get(list_sessions))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/{id}", delete(deactivate_key))
        .route("/rules", get(list_rules).post(add_rule).delete(remove_rule))
}

#[derive(Debug, Serialize)]
struct ServerView {
    #[serde(flatten)]
    server: ToolServer,
    tools: Vec<String>,
}

/// Environment values often hold secrets; show only the names
fn mask_env(mut server: ToolServer) -> ToolServer {
    if let Transport::Subprocess { env, .. } = &mut server.transport {
        for value in env.values_mut() {
            *value = "***".to_string();
        }
    }
    server
}

async fn list_servers(
    State(state): State<AppState>,
    _admin: AdminKey,
) -> Result<Json<Vec<ServerView>>, ApiError> {
    let registry = state.gateway.registry();
    let mut views = Vec::new();
    for server in registry.list_servers().await? {
        let tools = registry
            .list_tools_for(&server.name)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        views.push(ServerView {
            server: mask_env(server),
            tools,
        });
    }
    Ok(Json(views))
}

async fn register_server(
    State(state): State<AppState>,
    AdminKey(admin): AdminKey,
    Json(manifest): Json<ServerManifest>,
) -> Result<(StatusCode, Json<Registration>), ApiError> {
    if manifest.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_server", "Server name cannot be empty"));
    }
    info!("Admin '{}' registering server '{}'", admin.name, manifest.name.trim());
    let registration = state.gateway.register(manifest).await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

async fn find_server(state: &AppState, name: &str) -> Result<ToolServer, ApiError> {
    state
        .gateway
        .registry()
        .get_server(name)
        .await?
        .ok_or_else(|| ApiError::not_found("server_not_found", format!("Server '{}' not found", name)))
}

async fn remove_server(
    State(state): State<AppState>,
    AdminKey(admin): AdminKey,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.gateway.delete_server(&name).await? {
        return Err(ApiError::not_found("server_not_found", format!("Server '{}' not found", name)));
    }
    info!("Admin '{}' removed server '{}'", admin.name, name);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: ServerStatus,
}

async fn set_status(
    State(state): State<AppState>,
    _admin: AdminKey,
    Path(name): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    let server = find_server(&state, &name).await?;
    state
        .gateway
        .set_server_status(&server.name, body.status)
        .await?;
    Ok(Json(serde_json::json!({ "name": server.name, "status": body.status })))
}

async fn sync_server(
    State(state): State<AppState>,
    _admin: AdminKey,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = find_server(&state, &name).await?;
    let count = state.gateway.sync_tools(&server.name).await.map_err(|e| ApiError {
        status: StatusCode::BAD_GATEWAY,
        code: "sync_failed",
        message: format!("{:#}", e),
    })?;
    Ok(Json(serde_json::json!({ "name": server.name, "tools": count })))
}

async fn stats(State(state): State<AppState>, _admin: AdminKey) -> Result<Json<Value>, ApiError> {
    let log = state.gateway.call_log();
    let overall = log.get_stats().await?;
    let servers = log.get_server_stats().await?;
    Ok(Json(serde_json::json!({
        "overall": overall,
        "servers": servers,
        "sessions": state.sessions.count(),
        "connections": state.gateway.pool().connected(),
    })))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    limit: Option<usize>,
}

async fn recent_logs(
    State(state): State<AppState>,
    _admin: AdminKey,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<CallLogEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    Ok(Json(state.gateway.call_log().get_recent_logs(limit).await?))
}

async fn list_sessions(State(state): State<AppState>, _admin: AdminKey) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

async fn list_keys(
    State(state): State<AppState>,
    _admin: AdminKey,
) -> Result<Json<Vec<ApiKey>>, ApiError> {
    Ok(Json(state.gateway.policy().list_api_keys().await?))
}

#[derive(Debug, Deserialize)]
struct NewKey {
    name: String,
    role: String,
}

async fn create_key(
    State(state): State<AppState>,
    AdminKey(admin): AdminKey,
    Json(body): Json<NewKey>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.role.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_key", "Role cannot be empty"));
    }
    let key = state
        .gateway
        .policy()
        .create_api_key(&body.name, &body.role)
        .await?;
    info!("Admin '{}' created a key for role '{}'", admin.name, body.role.trim());
    // The only time the secret is shown
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "key": key, "name": body.name.trim(), "role": body.role.trim() })),
    ))
}

async fn deactivate_key(
    State(state): State<AppState>,
    _admin: AdminKey,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.gateway.policy().deactivate_api_key(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("key_not_found", format!("No active key with id '{}'", id)))
    }
}

async fn list_rules(
    State(state): State<AppState>,
    _admin: AdminKey,
) -> Result<Json<Vec<PolicyRule>>, ApiError> {
    Ok(Json(state.gateway.policy().list_rules().await?))
}

#[derive(Debug, Deserialize)]
struct RuleBody {
    role: String,
    resource: String,
    #[serde(default = "default_action")]
    action: RuleAction,
}

fn default_action() -> RuleAction {
    RuleAction::Allow
}

async fn add_rule(
    State(state): State<AppState>,
    _admin: AdminKey,
    Json(body): Json<RuleBody>,
) -> Result<StatusCode, ApiError> {
    if body.role.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_rule", "Role cannot be empty"));
    }
    state
        .gateway
        .policy()
        .add_rule(&body.role, &body.resource, body.action)
        .await
        .map_err(|e| ApiError::bad_request("invalid_rule", format!("{:#}", e)))?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct RuleTarget {
    role: String,
    resource: String,
}

async fn remove_rule(
    State(state): State<AppState>,
    _admin: AdminKey,
    Json(body): Json<RuleTarget>,
) -> Result<StatusCode, ApiError> {
    if state
        .gateway
        .policy()
        .remove_rule(&body.role, &body.resource)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("rule_not_found", "No such rule"))
    }
}

#[cfg(test)]
mod tests {
    use crate::server::GatewayServer;
    use crate::testing::{FakeClient, FakeConnector, fast_retry, gateway_with};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use toolgate_core::NativeCatalog;
    use toolgate_core::native::builtin::register_builtins;
    use tower::ServiceExt;

    const ADMIN_KEY: &str = "tg_admin_admin_routes";

    async fn setup(connector: FakeConnector) -> GatewayServer {
        let mut natives = NativeCatalog::new();
        register_builtins(&mut natives);
        let gw = gateway_with(Arc::new(connector), natives, fast_retry());
        gw.policy().bootstrap("admin", ADMIN_KEY).await.unwrap();
        GatewayServer::new(Arc::new(gw), "admin")
    }

    async fn call(
        server: &GatewayServer,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            req = req.header("authorization", format!("Bearer {}", key));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = server.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_admin_requires_admin_role() {
        let server = setup(FakeConnector::new()).await;
        let analyst = server
            .state()
            .gateway
            .policy()
            .create_api_key("bot", "analyst")
            .await
            .unwrap();

        let (status, _) = call(&server, "GET", "/admin/servers", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&server, "GET", "/admin/servers", Some(&analyst), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) = call(&server, "GET", "/admin/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_register_sync_and_status() {
        let connector =
            FakeConnector::new().with_client(FakeClient::new("research").with_tools(&["search"]));
        let server = setup(connector).await;

        let (status, body) = call(
            &server,
            "POST",
            "/admin/servers",
            Some(ADMIN_KEY),
            Some(json!({
                "name": "research",
                "transport": {"kind": "remote_stream", "url": "http://research.invalid/sse"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["tools"], 1);
        assert!(body.get("sync_error").is_none());

        let (_, listed) = call(&server, "GET", "/admin/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(listed[0]["name"], "research");
        assert_eq!(listed[0]["status"], "active");
        assert_eq!(listed[0]["tools"], json!(["search"]));

        let (status, body) = call(
            &server,
            "POST",
            "/admin/servers/research/sync",
            Some(ADMIN_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"], 1);

        let (status, _) = call(
            &server,
            "PUT",
            "/admin/servers/research/status",
            Some(ADMIN_KEY),
            Some(json!({"status": "inactive"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, listed) = call(&server, "GET", "/admin/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(listed[0]["status"], "inactive");

        let (status, _) = call(
            &server,
            "POST",
            "/admin/servers/missing/sync",
            Some(ADMIN_KEY),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_remove_server() {
        let connector =
            FakeConnector::new().with_client(FakeClient::new("research").with_tools(&["search"]));
        let server = setup(connector).await;
        let (status, _) = call(
            &server,
            "POST",
            "/admin/servers",
            Some(ADMIN_KEY),
            Some(json!({
                "name": "research",
                "transport": {"kind": "remote_stream", "url": "http://research.invalid/sse"}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(server.state().gateway.pool().connected(), 1);

        let (status, _) = call(&server, "DELETE", "/admin/servers/research", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(server.state().gateway.pool().connected(), 0);
        let (_, listed) = call(&server, "GET", "/admin/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(listed, json!([]));

        let (status, body) = call(&server, "DELETE", "/admin/servers/research", Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "server_not_found");
    }

    #[tokio::test]
    async fn test_subprocess_env_is_masked() {
        let server = setup(FakeConnector::new()).await;
        let (status, _) = call(
            &server,
            "POST",
            "/admin/servers",
            Some(ADMIN_KEY),
            Some(json!({
                "name": "local",
                "transport": {"kind": "subprocess", "command": "local-mcp", "env": {"TOKEN": "s3cret"}},
                "tools": [{"name": "lookup"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, listed) = call(&server, "GET", "/admin/servers", Some(ADMIN_KEY), None).await;
        assert_eq!(listed[0]["transport"]["env"]["TOKEN"], "***");
        assert_eq!(listed[0]["tools"], json!(["lookup"]));
    }

    #[tokio::test]
    async fn test_key_lifecycle() {
        let server = setup(FakeConnector::new()).await;
        let (status, created) = call(
            &server,
            "POST",
            "/admin/keys",
            Some(ADMIN_KEY),
            Some(json!({"name": "ci", "role": "analyst"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let secret = created["key"].as_str().unwrap().to_string();
        assert!(secret.starts_with("tg_"));

        let (_, keys) = call(&server, "GET", "/admin/keys", Some(ADMIN_KEY), None).await;
        let keys = keys.as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k["key"].as_str().unwrap() != secret));
        let id = keys
            .iter()
            .find(|k| k["role"] == "analyst")
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let (status, _) = call(&server, "DELETE", &format!("/admin/keys/{}", id), Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&server, "DELETE", &format!("/admin/keys/{}", id), Some(ADMIN_KEY), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let gw = server.state().gateway;
        assert!(gw.policy().verify_api_key(&secret).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rules_and_logs() {
        let server = setup(FakeConnector::new()).await;
        let (status, _) = call(
            &server,
            "POST",
            "/admin/rules",
            Some(ADMIN_KEY),
            Some(json!({"role": "analyst", "resource": "builtin:echo"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, rules) = call(&server, "GET", "/admin/rules", Some(ADMIN_KEY), None).await;
        assert!(
            rules
                .as_array()
                .unwrap()
                .iter()
                .any(|r| r["role"] == "analyst" && r["action"] == "allow")
        );

        let gw = server.state().gateway;
        for i in 0..3 {
            gw.call_tool(
                "echo",
                json!({"text": format!("hi {}", i)}),
                "analyst",
                "s1",
                &tokio_util::sync::CancellationToken::new(),
            )
            .await
            .unwrap();
        }

        let (_, logs) = call(&server, "GET", "/admin/logs?limit=2", Some(ADMIN_KEY), None).await;
        assert_eq!(logs.as_array().unwrap().len(), 2);
        let (_, stats) = call(&server, "GET", "/admin/stats", Some(ADMIN_KEY), None).await;
        assert_eq!(stats["overall"]["total_calls"], 3);
        assert_eq!(stats["servers"][0]["server_name"], "builtin");

        let (status, _) = call(
            &server,
            "DELETE",
            "/admin/rules",
            Some(ADMIN_KEY),
            Some(json!({"role": "analyst", "resource": "builtin:echo"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
