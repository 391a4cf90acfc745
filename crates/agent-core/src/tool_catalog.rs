use crate::error::AgentError;
use crate::protocol::ToolDescriptor;
use crate::session::McpSession;
use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType, FunctionObjectArgs};
use std::sync::RwLock;

/// Cached copy of the tools the server advertises.
///
/// The server sends no change notifications we consume, so the catalog is
/// refreshed before use rather than invalidated.
pub struct ToolCatalog {
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Re-fetch the catalog. On failure the previous contents are kept.
    pub async fn refresh(&self, session: &McpSession) -> Result<usize, AgentError> {
        let tools = session.list_tools().await?;
        let count = tools.len();
        self.replace(tools);
        tracing::debug!("Tool catalog refreshed: {} tools", count);
        Ok(count)
    }

    /// Replace the cached catalog.
    pub fn replace(&self, tools: Vec<ToolDescriptor>) {
        if let Ok(mut guard) = self.tools.write() {
            *guard = tools;
        }
    }

    /// Current catalog contents.
    pub fn snapshot(&self) -> Vec<ToolDescriptor> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }

    /// Number of cached tools.
    pub fn len(&self) -> usize {
        self.tools.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert tool descriptors to the OpenAI function calling format.
pub fn descriptors_to_openai_tools(
    descriptors: &[ToolDescriptor],
) -> Result<Vec<ChatCompletionTool>, AgentError> {
    descriptors
        .iter()
        .map(|d| {
            let func = FunctionObjectArgs::default()
                .name(&d.name)
                .description(&d.description)
                .parameters(d.input_schema.clone())
                .build()
                .map_err(|e| AgentError::Schema(format!("function '{}': {}", d.name, e)))?;
            ChatCompletionToolArgs::default()
                .r#type(ChatCompletionToolType::Function)
                .function(func)
                .build()
                .map_err(|e| AgentError::Schema(format!("tool '{}': {}", d.name, e)))
        })
        .collect()
}
