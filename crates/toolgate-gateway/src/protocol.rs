//! Session protocol: JSON-RPC messages from agents, answered by the gateway

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use toolgate_core::GatewayError;
use toolgate_core::error::codes;
use toolgate_mcp::protocol::{InitializeResult, JsonRpcRequest, JsonRpcResponse, ToolCallResult};

use crate::gateway::Gateway;

/// Methods agents can call
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// Who is asking, fixed when the session was opened
#[derive(Debug, Clone)]
pub struct Caller {
    pub session_id: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default = "empty_arguments")]
    arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Default::default())
}

/// Answer one inbound message. Notifications get `None`.
pub async fn handle_request(
    gateway: &Gateway,
    caller: &Caller,
    request: JsonRpcRequest,
    cancel: &CancellationToken,
) -> Option<JsonRpcResponse> {
    let Some(id) = request.id.clone() else {
        match request.method.as_str() {
            methods::INITIALIZED => debug!(session_id = %caller.session_id, "Agent initialized"),
            methods::CANCELLED => debug!(session_id = %caller.session_id, "Agent sent cancel notification"),
            other => debug!(session_id = %caller.session_id, "Ignoring notification {}", other),
        }
        return None;
    };

    if request.jsonrpc != "2.0" {
        return Some(JsonRpcResponse::error(
            id,
            codes::INVALID_REQUEST,
            format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
        ));
    }

    let response = match request.method.as_str() {
        methods::INITIALIZE => match serde_json::to_value(InitializeResult::gateway()) {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, codes::INTERNAL_ERROR, e.to_string()),
        },
        methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),
        methods::TOOLS_LIST => match gateway.list_tools(&caller.role).await {
            Ok(tools) => JsonRpcResponse::success(id, serde_json::json!({ "tools": tools })),
            Err(e) => {
                warn!(session_id = %caller.session_id, "tools/list failed: {:#}", e);
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, format!("{:#}", e))
            }
        },
        methods::TOOLS_CALL => {
            let params: CallParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    return Some(JsonRpcResponse::error(
                        id,
                        codes::INVALID_PARAMS,
                        format!("Invalid tools/call params: {}", e),
                    ));
                }
            };
            let outcome = gateway
                .call_tool(
                    &params.name,
                    params.arguments,
                    &caller.role,
                    &caller.session_id,
                    cancel,
                )
                .await;
            call_response(id, outcome)
        }
        other => JsonRpcResponse::error(
            id,
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        ),
    };

    Some(response)
}

/// Tool failures become an `isError` result the agent can read; everything
/// else is a JSON-RPC error tagged with its kind
fn call_response(id: Value, outcome: Result<Value, GatewayError>) -> JsonRpcResponse {
    match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) if e.is_tool_failure() => {
            match serde_json::to_value(ToolCallResult::error_text(e.to_string())) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(ser) => JsonRpcResponse::error(id, codes::INTERNAL_ERROR, ser.to_string()),
            }
        }
        Err(e) => JsonRpcResponse::error_with_data(
            id,
            e.code(),
            e.to_string(),
            serde_json::json!({ "kind": e.kind() }),
        ),
    }
}
