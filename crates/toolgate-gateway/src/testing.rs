//! Fakes shared by the gateway crate's tests

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolgate_core::{NativeCatalog, PolicyEvaluation, ServerStatus, ToolServer, ToolSpec, Transport};
use toolgate_mcp::{Connector, DownstreamClient};
use toolgate_store::{CallLog, Database, Policy, Registry};

use crate::gateway::{Gateway, RetryPolicy};
use crate::pool::ConnectionPool;

/// What the fake does on its next `tools/call`
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(String),
    ErrorResult(String),
    Hang,
}

pub struct FakeClient {
    name: String,
    tools: Vec<ToolSpec>,
    script: Mutex<VecDeque<Step>>,
    pub calls: AtomicUsize,
    closed: AtomicBool,
}

impl FakeClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_tools(mut self, names: &[&str]) -> Self {
        self.tools = names
            .iter()
            .map(|n| ToolSpec {
                name: n.to_string(),
                description: format!("{} via {}", n, self.name),
                input_schema: toolgate_core::empty_object_schema(),
            })
            .collect();
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }
}

#[async_trait]
impl DownstreamClient for FakeClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        if self.is_closed() {
            bail!("closed");
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step.unwrap_or_else(|| Step::Reply(format!("{} ok", name))) {
            Step::Reply(text) => Ok(serde_json::json!({
                "content": [{"type": "text", "text": text}]
            })),
            Step::Fail(msg) => Err(anyhow!(msg)),
            Step::ErrorResult(msg) => Ok(serde_json::json!({
                "content": [{"type": "text", "text": msg}],
                "isError": true
            })),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow!("hung call returned"))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    clients: HashMap<String, Arc<FakeClient>>,
    failures: AtomicUsize,
    delay: Duration,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn with_client(self, client: FakeClient) -> Self {
        self.with_shared_client(Arc::new(client))
    }

    pub fn with_shared_client(mut self, client: Arc<FakeClient>) -> Self {
        self.clients.insert(client.name.clone(), client);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` connects
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, server: &ToolServer) -> Result<Arc<dyn DownstreamClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            bail!("connection refused");
        }
        let client = self
            .clients
            .get(&server.name)
            .cloned()
            .ok_or_else(|| anyhow!("no route to {}", server.name))?;
        // A reconnect brings the fake back up
        client.closed.store(false, Ordering::SeqCst);
        Ok(client as Arc<dyn DownstreamClient>)
    }
}

pub fn server(name: &str) -> ToolServer {
    ToolServer {
        id: format!("{}-id", name),
        name: name.to_string(),
        transport: Transport::RemoteStream {
            url: format!("http://{}.invalid/sse", name),
        },
        status: ServerStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Short deadlines so timeout tests finish quickly
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        call_timeout: Duration::from_millis(200),
        backoff_base: Duration::from_millis(10),
    }
}

/// A gateway over an in-memory store
pub fn gateway_with(
    connector: Arc<dyn Connector>,
    natives: NativeCatalog,
    retry: RetryPolicy,
) -> Gateway {
    let db = Database::open_in_memory().unwrap();
    Gateway::new(
        Registry::new(db.clone()),
        Policy::new(db.clone(), PolicyEvaluation::AllowOnly),
        CallLog::new(db),
        natives,
        ConnectionPool::new(connector),
        retry,
    )
}
