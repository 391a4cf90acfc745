pub mod ndjson;
pub mod streamable;

pub use ndjson::NdjsonTransport;
pub use streamable::StreamableHttpTransport;

use agent_core::config::{ServerConfig, TransportKind};
use agent_core::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the transport selected by `config`.
pub fn connect(config: &ServerConfig) -> Arc<dyn Transport> {
    let url = config.endpoint_url();
    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
    info!("Connecting to {} ({} transport)", url, config.transport);

    match config.transport {
        TransportKind::Streamable => Arc::new(StreamableHttpTransport::new(url, timeout)),
        TransportKind::Ndjson => Arc::new(NdjsonTransport::new(url, timeout)),
    }
}
