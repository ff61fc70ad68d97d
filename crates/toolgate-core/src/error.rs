//! Caller-facing error taxonomy for tool routing

use std::time::Duration;
use thiserror::Error;

/// JSON-RPC error codes used on the session protocol
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const UNAUTHENTICATED: i64 = -32000;
    pub const FORBIDDEN: i64 = -32001;
    pub const TOOL_NOT_FOUND: i64 = -32002;
    pub const CONNECTION_FAILED: i64 = -32003;
    pub const EXECUTION_FAILED: i64 = -32004;
    pub const TIMED_OUT: i64 = -32005;
    pub const CANCELLED: i64 = -32006;
}

/// Every way a gateway operation can fail, as seen by the caller
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing, invalid or inactive API key")]
    Unauthenticated,

    #[error("Role '{role}' is not allowed to call tool '{tool}'")]
    Forbidden { role: String, tool: String },

    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Failed to connect to server '{server}': {message}")]
    Connection { server: String, message: String },

    #[error("Tool execution failed: {0}")]
    Execution(String),

    #[error("Tool '{tool}' timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("Tool call cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// JSON-RPC error code for this failure
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::Unauthenticated => codes::UNAUTHENTICATED,
            GatewayError::Forbidden { .. } => codes::FORBIDDEN,
            GatewayError::NotFound(_) => codes::TOOL_NOT_FOUND,
            GatewayError::Connection { .. } => codes::CONNECTION_FAILED,
            GatewayError::Execution(_) => codes::EXECUTION_FAILED,
            GatewayError::Timeout { .. } => codes::TIMED_OUT,
            GatewayError::Cancelled => codes::CANCELLED,
            GatewayError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Short machine-readable name of the taxonomy entry
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "authentication",
            GatewayError::Forbidden { .. } => "forbidden",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Connection { .. } => "connection",
            GatewayError::Execution(_) => "execution",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Failures the tool itself produced, reported to agents as an error result
    /// rather than a protocol error
    pub fn is_tool_failure(&self) -> bool {
        matches!(self, GatewayError::Execution(_) | GatewayError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_message_names_role_and_tool() {
        let err = GatewayError::Forbidden {
            role: "analyst".to_string(),
            tool: "charge".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("analyst"));
        assert!(msg.contains("charge"));
        assert_eq!(err.code(), codes::FORBIDDEN);
        assert_eq!(err.kind(), "forbidden");
    }

    #[test]
    fn test_tool_failures() {
        assert!(GatewayError::Execution("boom".into()).is_tool_failure());
        assert!(
            GatewayError::Timeout {
                tool: "t".into(),
                after: Duration::from_secs(1)
            }
            .is_tool_failure()
        );
        assert!(!GatewayError::NotFound("t".into()).is_tool_failure());
        assert!(!GatewayError::Cancelled.is_tool_failure());
    }

    #[test]
    fn test_internal_from_anyhow() {
        let err: GatewayError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(err.code(), codes::INTERNAL_ERROR);
    }
}
