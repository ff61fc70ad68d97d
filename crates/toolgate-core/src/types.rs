//! Persisted data model: servers, tools, keys, policy rules and call logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Owner name recorded when a call fails before its server is resolved
pub const UNKNOWN_SERVER: &str = "unknown";

/// Kind of transport a tool server is reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Subprocess,
    RemoteStream,
    Native,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Subprocess => write!(f, "subprocess"),
            TransportKind::RemoteStream => write!(f, "remote_stream"),
            TransportKind::Native => write!(f, "native"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subprocess" => Ok(TransportKind::Subprocess),
            "remote_stream" => Ok(TransportKind::RemoteStream),
            "native" => Ok(TransportKind::Native),
            other => Err(anyhow::anyhow!("Unknown transport kind: {}", other)),
        }
    }
}

/// How to reach a tool server. The variant is the transport kind, the fields its config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    /// Spawn a local process and speak MCP over its stdin/stdout
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Open an MCP HTTP+SSE stream at `url`
    RemoteStream { url: String },
    /// Resolved in-process from the native catalog
    Native,
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Subprocess { .. } => TransportKind::Subprocess,
            Transport::RemoteStream { .. } => TransportKind::RemoteStream,
            Transport::Native => TransportKind::Native,
        }
    }
}

/// Lifecycle status of a tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Active => write!(f, "active"),
            ServerStatus::Inactive => write!(f, "inactive"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ServerStatus::Active),
            "inactive" => Ok(ServerStatus::Inactive),
            "error" => Ok(ServerStatus::Error),
            other => Err(anyhow::anyhow!("Unknown server status: {}", other)),
        }
    }
}

/// A registered tool server, addressed everywhere by `name`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServer {
    pub id: String,
    pub name: String,
    pub transport: Transport,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A tool definition as supplied at registration time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object_schema")]
    pub input_schema: Value,
}

/// The schema used when a tool declares nothing usable
pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A stored tool row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool from an active server, tagged with its owner
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
    pub transport_kind: TransportKind,
}

/// An API key and the role it authenticates as
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    #[serde(serialize_with = "mask_secret")]
    pub key: String,
    pub name: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

fn mask_secret<S: serde::Serializer>(key: &str, s: S) -> Result<S::Ok, S::Error> {
    let visible: String = key.chars().take(6).collect();
    s.serialize_str(&format!("{}…", visible))
}

/// Whether a policy rule grants or refuses access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
        }
    }
}

impl std::str::FromStr for RuleAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(RuleAction::Allow),
            "deny" => Ok(RuleAction::Deny),
            other => Err(anyhow::anyhow!("Unknown rule action: {}", other)),
        }
    }
}

/// Role → resource access rule. `resource` is `server:tool`, either side may be `*`,
/// or the whole pattern may be `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub role: String,
    pub resource: String,
    pub action: RuleAction,
}

/// Terminal outcome of a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Success => write!(f, "success"),
            CallStatus::Error => write!(f, "error"),
        }
    }
}

/// A call-log row to be written
#[derive(Debug, Clone)]
pub struct NewCallLog {
    pub session_id: String,
    pub role: String,
    pub server_name: String,
    pub tool_name: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    pub error_message: Option<String>,
}

/// A stored call-log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub role: String,
    pub server_name: String,
    pub tool_name: String,
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Aggregate statistics over every logged call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub error_count: u64,
    /// Percentage in 0..=100; 100 when no calls have been made
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Per-server call statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCallStats {
    pub server_name: String,
    pub total_calls: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_tagged_serialization() {
        let transport = Transport::Subprocess {
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            env: BTreeMap::new(),
        };
        let json = serde_json::to_value(&transport).unwrap();
        assert_eq!(json["kind"], "subprocess");
        assert_eq!(json["command"], "node");
        assert_eq!(transport.kind(), TransportKind::Subprocess);
    }

    #[test]
    fn test_transport_from_json() {
        let remote: Transport =
            serde_json::from_str(r#"{"kind":"remote_stream","url":"http://localhost:9000/sse"}"#)
                .unwrap();
        assert_eq!(remote.kind(), TransportKind::RemoteStream);

        let native: Transport = serde_json::from_str(r#"{"kind":"native"}"#).unwrap();
        assert_eq!(native, Transport::Native);

        let sub: Transport = serde_json::from_str(r#"{"kind":"subprocess","command":"x"}"#).unwrap();
        match sub {
            Transport::Subprocess { args, env, .. } => {
                assert!(args.is_empty());
                assert!(env.is_empty());
            }
            _ => panic!("expected subprocess"),
        }
    }

    #[test]
    fn test_kind_and_status_parse() {
        assert_eq!("native".parse::<TransportKind>().unwrap(), TransportKind::Native);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!("error".parse::<ServerStatus>().unwrap(), ServerStatus::Error);
        assert_eq!(ServerStatus::Inactive.to_string(), "inactive");
        assert_eq!("deny".parse::<RuleAction>().unwrap(), RuleAction::Deny);
    }

    #[test]
    fn test_tool_spec_defaults() {
        let spec: ToolSpec = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(spec.description, "");
        assert_eq!(spec.input_schema["type"], "object");
        assert!(spec.input_schema["properties"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_api_key_secret_masked() {
        let key = ApiKey {
            id: "k1".to_string(),
            key: "tg_0123456789abcdef".to_string(),
            name: "ops".to_string(),
            role: "admin".to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(!json.contains("0123456789abcdef"));
        assert!(json.contains("tg_012"));
    }
}
