use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionToolType, CreateChatCompletionRequestArgs, FunctionCall,
};
use async_openai::Client;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::AgentError;
use crate::protocol::ToolDescriptor;
use crate::tool_catalog::descriptors_to_openai_tools;
use crate::types::{ContentBlock, Message, ModelResponse, Role, ToolCall};

/// Error classification for fallback decisions.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// The requested model id is unknown to the backend; try the next candidate.
    ModelNotFound(String),
    /// Anything else; never retried.
    Other(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::ModelNotFound(msg) => write!(f, "model not found: {}", msg),
            BackendError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// One generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub max_tokens: u32,
}

/// A language-model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<ModelResponse, BackendError>;

    /// Model ids the backend advertises.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
}

/// Ordered candidate models for one query plus the ones already rejected.
#[derive(Debug, Clone, Default)]
pub struct ModelSelection {
    candidates: Vec<String>,
    exhausted: HashSet<String>,
}

impl ModelSelection {
    /// Blank ids are skipped and duplicates keep their first position.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let candidates = candidates
            .into_iter()
            .map(|m| {
                let m: String = m.into();
                m.trim().to_string()
            })
            .filter(|m| !m.is_empty() && seen.insert(m.clone()))
            .collect();
        Self {
            candidates,
            exhausted: HashSet::new(),
        }
    }

    /// Explicit override first, then the configured default, then the fallback chain.
    pub fn from_config(model_override: Option<&str>, provider: &ProviderConfig) -> Self {
        let chain = model_override
            .into_iter()
            .map(str::to_string)
            .chain(std::iter::once(provider.model.clone()))
            .chain(provider.fallback_models.iter().cloned());
        Self::new(chain)
    }

    /// First candidate not yet rejected.
    pub fn next_candidate(&self) -> Option<&str> {
        self.candidates
            .iter()
            .find(|m| !self.exhausted.contains(*m))
            .map(String::as_str)
    }

    pub fn mark_exhausted(&mut self, model: &str) {
        self.exhausted.insert(model.to_string());
    }

    pub fn exhausted(&self) -> &HashSet<String> {
        &self.exhausted
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Rejected ids in candidate order.
    fn exhausted_in_order(&self) -> Vec<String> {
        self.candidates
            .iter()
            .filter(|m| self.exhausted.contains(*m))
            .cloned()
            .collect()
    }
}

/// Calls the backend and rotates through candidate models on "not found".
#[derive(Clone)]
pub struct ModelGateway {
    backend: Arc<dyn ModelBackend>,
}

impl ModelGateway {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    /// Generate one round. Each pass either returns or exhausts a candidate,
    /// so the loop runs at most `selection.candidates().len()` times.
    pub async fn generate(
        &self,
        messages: &[Message],
        selection: &mut ModelSelection,
        max_tokens: u32,
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, AgentError> {
        while let Some(model) = selection.next_candidate().map(str::to_string) {
            debug!("Generating with model {}", model);
            let request = GenerateRequest {
                model: &model,
                messages,
                tools,
                max_tokens,
            };
            match self.backend.generate(request).await {
                Ok(response) => return Ok(response),
                Err(BackendError::ModelNotFound(msg)) => {
                    warn!("Model {} unavailable ({}), trying next candidate", model, msg);
                    selection.mark_exhausted(&model);
                }
                Err(BackendError::Other(msg)) => {
                    return Err(AgentError::Provider(format!("{}: {}", model, msg)));
                }
            }
        }

        Err(AgentError::ModelUnavailable {
            attempted: selection.exhausted_in_order(),
        })
    }

    /// Best-effort model listing; failures are logged and yield an empty list.
    pub async fn list_models(&self) -> Vec<String> {
        match self.backend.list_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!("Failed to list models: {}", e);
                Vec::new()
            }
        }
    }
}

/// Backend for any OpenAI-compatible chat completions API.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiBackend {
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_base(&config.api_base)
            .with_api_key(api_key.clone().unwrap_or_else(|| "not-needed".to_string()));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        // Rate limits surface immediately instead of being retried inside the client.
        let no_retry = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();

        Self {
            client: Client::with_config(openai_config).with_backoff(no_retry),
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
        }
    }

    /// Direct `GET {api_base}/models`, for backends whose listing shape
    /// the typed client rejects.
    async fn list_models_direct(&self) -> Result<Vec<String>, reqwest::Error> {
        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        let mut request = self.http.get(format!("{}/models", self.api_base));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let list: ModelList = request.send().await?.error_for_status()?.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<ModelResponse, BackendError> {
        let messages = build_openai_messages(request.messages)
            .map_err(|e| BackendError::Other(e.to_string()))?;

        let mut request_builder = CreateChatCompletionRequestArgs::default();
        request_builder
            .model(request.model)
            .messages(messages)
            .temperature(self.temperature)
            .max_completion_tokens(request.max_tokens);

        if !request.tools.is_empty() {
            let tools = descriptors_to_openai_tools(request.tools)
                .map_err(|e| BackendError::Other(e.to_string()))?;
            request_builder.tools(tools);
        }

        let chat_request = request_builder
            .build()
            .map_err(|e| BackendError::Other(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(classify_error)?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| BackendError::Other("No choices in response".into()))?;

        let mut blocks = Vec::new();
        if let Some(content) = &choice.message.content {
            if !content.is_empty() {
                blocks.push(ContentBlock::Text(content.clone()));
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            blocks.extend(tool_calls.iter().map(|tc| {
                ContentBlock::ToolInvocation(ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: tc.function.arguments.clone(),
                })
            }));
        }

        Ok(ModelResponse::new(response.model.clone(), blocks))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let native_err = match self.client.models().list().await {
            Ok(list) => return Ok(list.data.into_iter().map(|m| m.id).collect()),
            Err(e) => e,
        };
        debug!("Native model listing failed ({}), querying endpoint directly", native_err);

        self.list_models_direct().await.map_err(|direct_err| {
            BackendError::Other(format!(
                "native listing: {}; direct listing: {}",
                native_err, direct_err
            ))
        })
    }
}

/// Map a client error onto the fallback classification. Only structured API
/// errors can name a missing model; a bare 404 page means the endpoint
/// itself is wrong and surfaces as `Other`.
fn classify_error(err: OpenAIError) -> BackendError {
    match &err {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_ref().map(|c| c.to_string());
            let kind = api.r#type.as_ref().map(|t| t.to_string());
            if is_model_not_found(code.as_deref(), kind.as_deref(), &api.message) {
                return BackendError::ModelNotFound(api.message.clone());
            }
        }
        _ => {}
    }
    BackendError::Other(err.to_string())
}

/// Backends disagree on how they tag an unknown model: OpenAI uses the
/// `model_not_found` code, Anthropic-style APIs a `not_found_error` type, and
/// local servers often only say so in the message.
pub(crate) fn is_model_not_found(code: Option<&str>, kind: Option<&str>, message: &str) -> bool {
    const TAGS: [&str; 2] = ["model_not_found", "not_found_error"];
    let tagged = |field: Option<&str>| field.map_or(false, |f| TAGS.iter().any(|t| f.contains(t)));
    if tagged(code) || tagged(kind) {
        return true;
    }
    let message = message.to_lowercase();
    message.contains("model")
        && (message.contains("not found") || message.contains("does not exist"))
}

/// Convert our Message types to async-openai request messages.
fn build_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    let mut result = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => {
                let m = ChatCompletionRequestSystemMessageArgs::default()
                    .content(msg.content.as_str())
                    .build()?;
                result.push(ChatCompletionRequestMessage::System(m));
            }
            Role::User => {
                let m = ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content.as_str())
                    .build()?;
                result.push(ChatCompletionRequestMessage::User(m));
            }
            Role::Assistant => {
                let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
                builder.content(msg.content.as_str());
                if let Some(tool_calls) = &msg.tool_calls {
                    let tc_openai: Vec<ChatCompletionMessageToolCall> = tool_calls
                        .iter()
                        .map(|tc| ChatCompletionMessageToolCall {
                            id: tc.id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect();
                    builder.tool_calls(tc_openai);
                }
                result.push(ChatCompletionRequestMessage::Assistant(builder.build()?));
            }
            Role::Tool => {
                let m = ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(msg.tool_call_id.as_deref().unwrap_or(""))
                    .content(msg.content.as_str())
                    .build()?;
                result.push(ChatCompletionRequestMessage::Tool(m));
            }
        }
    }

    Ok(result)
}
