//! Session management: each agent connection gets its own session
//!
//! A session pairs an inbound queue (filled by `POST /messages`) with an
//! outbound queue (drained onto the agent's SSE stream). A per-session worker
//! reads the inbound queue in arrival order; tool calls are spawned off so
//! two calls on one session race independently. Each call runs under a child
//! of the session's token, so the agent can abort one call with
//! `notifications/cancelled` and closing the session aborts them all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolgate_mcp::protocol::{JsonRpcRequest, JsonRpcResponse};

use crate::gateway::Gateway;
use crate::protocol::{Caller, handle_request, methods};

/// Maximum number of concurrent sessions
pub const MAX_SESSIONS: usize = 1000;

/// Inbound messages a session may have queued before POSTs are refused
const INBOUND_CAPACITY: usize = 256;

/// Outbound messages buffered ahead of the SSE stream
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,
    #[error("Session is busy, retry later")]
    Busy,
    #[error("Maximum number of sessions reached")]
    Full,
}

/// Admin-facing view of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

struct Session {
    info: SessionInfo,
    inbound: mpsc::Sender<JsonRpcRequest>,
    cancel: CancellationToken,
}

/// A freshly opened session, handed to the SSE handler
pub struct OpenedSession {
    pub id: String,
    pub outbound: mpsc::Receiver<JsonRpcResponse>,
    pub guard: SessionGuard,
}

/// Tears the session down when dropped, i.e. when the agent's stream goes away
pub struct SessionGuard {
    id: String,
    manager: Arc<SessionManager>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.close(&self.id);
    }
}

/// Table of live sessions, keyed by session id
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    /// Slots taken, counted before the insert so concurrent opens cannot overshoot
    reserved: AtomicUsize,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_limit(MAX_SESSIONS)
    }

    pub fn with_limit(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            max_sessions,
        }
    }

    /// Mint a session for an authenticated `role` and start its worker
    pub fn open(
        self: &Arc<Self>,
        gateway: Arc<Gateway>,
        role: &str,
    ) -> Result<OpenedSession, SessionError> {
        let reserved = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < self.max_sessions).then_some(taken + 1)
            });
        if reserved.is_err() {
            warn!("Refusing session for role '{}': limit of {} reached", role, self.max_sessions);
            return Err(SessionError::Full);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let caller = Caller {
            session_id: id.clone(),
            role: role.to_string(),
        };
        tokio::spawn(run_worker(
            gateway,
            caller,
            inbound_rx,
            outbound_tx,
            cancel.clone(),
        ));

        self.sessions.insert(
            id.clone(),
            Session {
                info: SessionInfo {
                    id: id.clone(),
                    role: role.to_string(),
                    created_at: Utc::now(),
                },
                inbound: inbound_tx,
                cancel,
            },
        );
        info!("Opened session {} for role '{}'", id, role);

        Ok(OpenedSession {
            id: id.clone(),
            outbound: outbound_rx,
            guard: SessionGuard {
                id,
                manager: Arc::clone(self),
            },
        })
    }

    /// Queue an inbound message for a session's worker
    pub fn deliver(&self, session_id: &str, request: JsonRpcRequest) -> Result<(), SessionError> {
        let inbound = self
            .sessions
            .get(session_id)
            .map(|session| session.inbound.clone())
            .ok_or(SessionError::NotFound)?;

        inbound.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Busy,
            mpsc::error::TrySendError::Closed(_) => SessionError::NotFound,
        })
    }

    /// Remove a session and cancel its work. Unknown ids are ignored.
    pub fn close(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            session.cancel.cancel();
            info!(
                "Closed session {} (role '{}')",
                session_id, session.info.role
            );
        }
    }

    /// Close every session (shutdown)
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Live sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.iter().map(|s| s.info.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Number of active sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call tokens of a session's running `tools/call` tasks, keyed by request
/// id. The sequence number tells a finished call from a newer one reusing its id.
type InFlight = Arc<DashMap<String, (u64, CancellationToken)>>;

async fn run_worker(
    gateway: Arc<Gateway>,
    caller: Caller,
    mut inbound: mpsc::Receiver<JsonRpcRequest>,
    outbound: mpsc::Sender<JsonRpcResponse>,
    cancel: CancellationToken,
) {
    let in_flight: InFlight = Arc::new(DashMap::new());
    let mut seq = 0u64;

    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = inbound.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.id.is_none() && request.method == methods::CANCELLED {
            cancel_call(&caller, &in_flight, &request.params);
            continue;
        }

        if request.method == methods::TOOLS_CALL {
            let gateway = Arc::clone(&gateway);
            let caller = caller.clone();
            let outbound = outbound.clone();
            let call_cancel = cancel.child_token();

            seq += 1;
            let tracked = request.id.as_ref().map(|id| (id.to_string(), seq));
            if let Some((key, seq)) = &tracked {
                in_flight.insert(key.clone(), (*seq, call_cancel.clone()));
            }
            let in_flight = Arc::clone(&in_flight);

            tokio::spawn(async move {
                let response = handle_request(&gateway, &caller, request, &call_cancel).await;
                if let Some((key, seq)) = tracked {
                    in_flight.remove_if(&key, |_, (current, _)| *current == seq);
                }
                // The agent abandoned this call; it expects no reply
                if call_cancel.is_cancelled() {
                    return;
                }
                if let Some(response) = response {
                    let _ = outbound.send(response).await;
                }
            });
            continue;
        }

        if let Some(response) = handle_request(&gateway, &caller, request, &cancel).await
            && outbound.send(response).await.is_err()
        {
            break;
        }
    }
    debug!("Session worker {} stopped", caller.session_id);
}

/// Handle `notifications/cancelled`: abort the named in-flight call, if any
fn cancel_call(caller: &Caller, in_flight: &InFlight, params: &Value) {
    let Some(request_id) = params.get("requestId") else {
        debug!(session_id = %caller.session_id, "Cancel notification without requestId");
        return;
    };
    match in_flight.get(&request_id.to_string()) {
        Some(entry) => {
            let reason = params.get("reason").and_then(Value::as_str).unwrap_or("none given");
            info!(
                session_id = %caller.session_id,
                "Agent cancelled request {} (reason: {})", request_id, reason
            );
            entry.1.cancel();
        }
        None => debug!(
            session_id = %caller.session_id,
            "Cancel for request {} that is not in flight", request_id
        ),
    }
}
