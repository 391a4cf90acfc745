//! Request/response correlation over a [`Transport`].
//!
//! Outbound calls get a fresh id and park a oneshot waiter in the pending
//! map; a background listener drains the inbound stream and hands each
//! response to the waiter with the matching id.

use crate::error::{AgentError, Result};
use crate::protocol::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ToolDescriptor, ToolResult, ToolsListResult,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_LIST_TOOLS, PROTOCOL_VERSION,
};
use crate::transport::{InboundStream, Transport};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type ResponseWaiter = oneshot::Sender<Result<JsonRpcResponse>>;
type PendingMap = Arc<Mutex<HashMap<u64, ResponseWaiter>>>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const CLIENT_NAME: &str = "mcp-agent";

/// A long-lived protocol session against one tool server.
pub struct McpSession {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl McpSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Optional handshake. Servers that don't implement it are tolerated, so
    /// failure only yields `None`.
    pub async fn initialize(&self) -> Option<Value> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        let response = match self.request(METHOD_INITIALIZE, Some(params)).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Initialize handshake failed, continuing without it: {}", e);
                return None;
            }
        };
        if let Some(err) = response.error {
            warn!("Server rejected initialize, continuing without it: {}", err.message);
            return None;
        }

        let note = JsonRpcMessage::Request(JsonRpcRequest::notification(METHOD_INITIALIZED, None));
        if let Err(e) = self.transport.send(&note).await {
            debug!("Failed to send initialized notification: {}", e);
        }

        let result = response.result.unwrap_or(Value::Null);
        if let Some(name) = result.pointer("/serverInfo/name").and_then(Value::as_str) {
            info!("Connected to tool server: {}", name);
        }
        Some(result)
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let response = self.request(METHOD_LIST_TOOLS, None).await?;
        if let Some(err) = response.error {
            return Err(AgentError::Protocol(format!(
                "{} failed: {} (code {})",
                METHOD_LIST_TOOLS, err.message, err.code
            )));
        }
        let result = response.result.ok_or_else(|| {
            AgentError::Protocol(format!("{} response carried no result", METHOD_LIST_TOOLS))
        })?;
        let parsed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            AgentError::Protocol(format!("invalid {} result: {}", METHOD_LIST_TOOLS, e))
        })?;
        debug!("Server advertises {} tools", parsed.tools.len());
        Ok(parsed.tools)
    }

    /// Invoke a remote tool and return its result payload.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request(METHOD_CALL_TOOL, Some(params)).await?;

        if let Some(err) = response.error {
            return Err(AgentError::ToolInvocation {
                tool_name: name.to_string(),
                message: err.message,
            });
        }
        let result = response.result.ok_or_else(|| {
            AgentError::Protocol(format!("{} response carried no result", METHOD_CALL_TOOL))
        })?;
        let result: ToolResult = serde_json::from_value(result).map_err(|e| {
            AgentError::Protocol(format!("invalid {} result: {}", METHOD_CALL_TOOL, e))
        })?;

        if result.is_error {
            return Err(AgentError::ToolInvocation {
                tool_name: name.to_string(),
                message: result.flatten_text(),
            });
        }
        Ok(result)
    }

    /// Close the transport and fail every call still waiting for a response.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.transport.close().await;
        fail_pending(&self.pending).await;
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        debug!("Session closed");
        result
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if self.is_closed() {
            return Err(AgentError::SessionClosed);
        }
        self.ensure_listener().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // close() flips the flag before draining, so a waiter inserted after
        // the drain is caught here instead of hanging.
        if self.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(AgentError::SessionClosed);
        }

        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        debug!("-> {} (id={})", method, id);
        if let Err(e) = self.transport.send(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::SessionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::Transport(format!(
                    "{} (id={}) timed out after {}s",
                    method,
                    id,
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    /// Start the inbound listener on first use.
    async fn ensure_listener(&self) -> Result<()> {
        let mut guard = self.listener.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let inbound = self.transport.inbound().await?;
        let pending = self.pending.clone();
        let closed = self.closed.clone();
        *guard = Some(tokio::spawn(async move {
            pump_inbound(inbound, &pending).await;
            closed.store(true, Ordering::SeqCst);
            fail_pending(&pending).await;
        }));
        Ok(())
    }
}

async fn pump_inbound(mut inbound: InboundStream, pending: &PendingMap) {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(JsonRpcMessage::Response(response)) => {
                let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
                    debug!("Dropping response without a numeric id");
                    continue;
                };
                let waiter = pending.lock().await.remove(&id);
                match waiter {
                    Some(waiter) => {
                        debug!("<- response (id={})", id);
                        let _ = waiter.send(Ok(response));
                    }
                    None => warn!("Received response for unknown request ID: {}", id),
                }
            }
            Ok(JsonRpcMessage::Request(request)) => {
                debug!("Ignoring server-originated message: method={}", request.method);
            }
            Err(e) => warn!("Inbound stream error: {}", e),
        }
    }
    debug!("Inbound stream ended");
}

async fn fail_pending(pending: &PendingMap) {
    let waiters: Vec<ResponseWaiter> = {
        let mut guard = pending.lock().await;
        guard.drain().map(|(_, waiter)| waiter).collect()
    };
    if !waiters.is_empty() {
        debug!("Failing {} outstanding calls", waiters.len());
    }
    for waiter in waiters {
        let _ = waiter.send(Err(AgentError::SessionClosed));
    }
}
