use crate::error::Result;
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of messages arriving from the server, in arrival order.
pub type InboundStream = BoxStream<'static, Result<JsonRpcMessage>>;

/// A bidirectional channel to a tool server.
///
/// Implementations must deliver each response exactly once and leave `id`
/// values untouched; the session layer relies on both for correlation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one outbound message.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Open the inbound message stream. Called at most once per transport.
    async fn inbound(&self) -> Result<InboundStream>;

    /// Release the underlying connection. The inbound stream should end soon after.
    async fn close(&self) -> Result<()>;
}
