pub mod agent_loop;
pub mod config;
pub mod error;
pub mod preview;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod tool_catalog;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use agent_loop::AgentLoop;
pub use config::AppConfig;
pub use error::AgentError;
pub use provider::{ModelGateway, ModelSelection, OpenAiBackend};
pub use session::McpSession;
pub use tool_catalog::ToolCatalog;
pub use transport::Transport;
