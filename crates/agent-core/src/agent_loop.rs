use crate::config::AppConfig;
use crate::error::AgentError;
use crate::preview::preview;
use crate::provider::{ModelGateway, ModelSelection};
use crate::session::McpSession;
use crate::tool_catalog::ToolCatalog;
use crate::types::{ContentBlock, Conversation, Message, ToolCall};

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of generate/invoke rounds per query.
pub const MAX_ROUNDS: usize = 5;

/// The core agent loop — turns one query into one answer, invoking remote
/// tools as often as the model asks.
pub struct AgentLoop {
    session: Arc<McpSession>,
    gateway: ModelGateway,
    catalog: Arc<ToolCatalog>,
    config: AppConfig,
    model_override: Option<String>,
}

impl AgentLoop {
    pub fn new(
        session: Arc<McpSession>,
        gateway: ModelGateway,
        catalog: Arc<ToolCatalog>,
        config: AppConfig,
    ) -> Self {
        Self {
            session,
            gateway,
            catalog,
            config,
            model_override: None,
        }
    }

    /// Model tried ahead of the configured default.
    pub fn with_model_override(mut self, model: Option<String>) -> Self {
        self.model_override = model;
        self
    }

    pub fn gateway(&self) -> &ModelGateway {
        &self.gateway
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Fresh candidate list for one query.
    pub fn model_selection(&self) -> ModelSelection {
        ModelSelection::from_config(self.model_override.as_deref(), &self.config.provider)
    }

    /// Run one query to its final answer.
    pub async fn run(&self, query: &str) -> Result<String, AgentError> {
        let mut selection = self.model_selection();
        self.run_with_selection(query, &mut selection).await
    }

    /// Like [`AgentLoop::run`], leaving the rejected models visible in `selection`.
    pub async fn run_with_selection(
        &self,
        query: &str,
        selection: &mut ModelSelection,
    ) -> Result<String, AgentError> {
        if self.config.agent.refresh_tools {
            if let Err(e) = self.catalog.refresh(&self.session).await {
                warn!("Tool catalog refresh failed, using cached catalog: {}", e);
            }
        }
        let tools = self.catalog.snapshot();

        let mut conversation = Conversation::new();
        if let Some(prompt) = &self.config.agent.system_prompt {
            conversation.push(Message::system(prompt.as_str()));
        }
        conversation.push(Message::user(query));

        let mut output: Vec<String> = Vec::new();

        for round in 1..=MAX_ROUNDS {
            debug!("Query round {}", round);

            let response = self
                .gateway
                .generate(
                    conversation.turns(),
                    selection,
                    self.config.provider.max_tokens,
                    &tools,
                )
                .await?;

            let invocations = response.tool_invocations();
            if !invocations.is_empty() {
                conversation.push(Message::assistant_with_tool_calls(
                    response.text(),
                    invocations,
                ));
            }

            let mut invoked = false;
            for block in response.blocks {
                match block {
                    ContentBlock::Text(text) => {
                        if !text.is_empty() {
                            output.push(text);
                        }
                    }
                    ContentBlock::ToolInvocation(call) => {
                        invoked = true;
                        let (lines, turn) = self.invoke(&call).await;
                        output.extend(lines);
                        conversation.push(turn);
                    }
                }
            }

            if !invoked {
                debug!("Query converged after {} round(s)", round);
                return Ok(output.join("\n"));
            }
        }

        warn!(
            "Hit max rounds ({}), returning accumulated output",
            MAX_ROUNDS
        );
        Ok(output.join("\n"))
    }

    /// Invoke one tool. Failures become trace lines and error turns, never errors.
    async fn invoke(&self, call: &ToolCall) -> (Vec<String>, Message) {
        let trace = format!("[Calling tool {} with args {}]", call.name, call.arguments);
        info!("Calling tool {}", call.name);

        let outcome = match parse_arguments(&call.arguments) {
            Ok(args) => self.session.call_tool(&call.name, args).await,
            Err(e) => Err(AgentError::ToolInvocation {
                tool_name: call.name.clone(),
                message: format!("Invalid JSON arguments: {}", e),
            }),
        };

        match outcome {
            Ok(result) => {
                let text = result.flatten_text();
                let lines = vec![trace, format!("Result: {}", preview(&text))];
                (lines, Message::tool_result(&call.id, text))
            }
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                let lines = vec![trace, format!("Error: {}", e)];
                let turn = Message::tool_result(
                    &call.id,
                    format!("Error calling tool {}: {}", call.name, e),
                );
                (lines, turn)
            }
        }
    }
}

/// Models sometimes send an empty string for "no arguments".
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}
