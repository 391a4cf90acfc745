//! In-memory doubles for the transport and model backend seams.

use crate::error::{AgentError, Result};
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::provider::{BackendError, GenerateRequest, ModelBackend};
use crate::transport::{InboundStream, Transport};
use crate::types::{Message, ModelResponse};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Responder = Box<dyn Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync>;
type InboundItem = Result<JsonRpcMessage>;

/// Transport backed by an in-process channel.
///
/// With a responder every request is answered immediately; without one the
/// test drives responses through [`FakeTransport::push_response`].
pub struct FakeTransport {
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundItem>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundItem>>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    responder: Option<Responder>,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
            responder: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub fn push_message(&self, message: JsonRpcMessage) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(message));
        }
    }

    pub fn push_response(&self, response: JsonRpcResponse) {
        self.push_message(JsonRpcMessage::Response(response));
    }

    /// Simulate the server hanging up.
    pub fn end_inbound(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn sent_messages(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent requests that expect a response.
    pub fn sent_requests(&self) -> Vec<JsonRpcRequest> {
        self.sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Request(req) if req.id.is_some() => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Yield until `count` requests have been sent.
    pub async fn wait_for_sent(&self, count: usize) {
        let wait = async {
            while self.sent_requests().len() < count {
                tokio::task::yield_now().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("requests were never sent");
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::Transport("transport closed".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        if let (Some(responder), JsonRpcMessage::Request(req)) = (&self.responder, message) {
            if req.id.is_some() {
                if let Some(response) = responder(req) {
                    self.push_response(response);
                }
            }
        }
        Ok(())
    }

    async fn inbound(&self) -> Result<InboundStream> {
        let rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AgentError::Transport("inbound stream already taken".into()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.end_inbound();
        Ok(())
    }
}

/// Model backend replaying canned responses.
///
/// Models in `unavailable` are rejected as not found. Scripted responses are
/// consumed in order; once exhausted, `repeat` (if set) is returned forever.
pub struct ScriptedBackend {
    unavailable: HashSet<String>,
    script: Mutex<VecDeque<ModelResponse>>,
    repeat: Option<ModelResponse>,
    attempts: Mutex<Vec<String>>,
    seen: Mutex<Vec<Vec<Message>>>,
    models: Option<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<ModelResponse>) -> Self {
        Self {
            unavailable: HashSet::new(),
            script: Mutex::new(script.into()),
            repeat: None,
            attempts: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
            models: None,
        }
    }

    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn rejecting(mut self, models: &[&str]) -> Self {
        self.unavailable = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }

    /// Every model id passed to `generate`, in call order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    /// Conversation snapshots of successful calls.
    pub fn seen_conversations(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn generate(
        &self,
        request: GenerateRequest<'_>,
    ) -> std::result::Result<ModelResponse, BackendError> {
        self.attempts.lock().unwrap().push(request.model.to_string());
        if self.unavailable.contains(request.model) {
            return Err(BackendError::ModelNotFound(format!(
                "model '{}' not found",
                request.model
            )));
        }
        self.seen.lock().unwrap().push(request.messages.to_vec());

        let next = self.script.lock().unwrap().pop_front();
        let mut response = next
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| BackendError::Other("script exhausted".into()))?;
        response.model = request.model.to_string();
        Ok(response)
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, BackendError> {
        self.models
            .clone()
            .ok_or_else(|| BackendError::Other("listing unsupported".into()))
    }
}
