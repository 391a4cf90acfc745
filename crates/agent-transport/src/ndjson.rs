//! NDJSON-over-HTTP transport.
//!
//! Outbound messages are POSTed as JSON to a write endpoint; inbound messages
//! arrive as newline-delimited JSON on a long-lived GET stream. Servers name
//! these endpoints differently, so when the primary stream endpoint is
//! missing the transport probes a fixed list of alternates.

use agent_core::error::{AgentError, Result};
use agent_core::protocol::JsonRpcMessage;
use agent_core::transport::{InboundStream, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

const NDJSON_MIME_TYPE: &str = "application/x-ndjson";

/// A read/write endpoint-name pair under the mount path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    pub read: &'static str,
    pub write: &'static str,
}

pub const PRIMARY_ENDPOINTS: EndpointPair = EndpointPair {
    read: "stream",
    write: "messages",
};

/// Probed in order when the primary read endpoint answers 404.
pub const ALTERNATE_ENDPOINTS: [EndpointPair; 3] = [
    EndpointPair {
        read: "events",
        write: "messages",
    },
    EndpointPair {
        read: "sse",
        write: "message",
    },
    EndpointPair {
        read: "read",
        write: "write",
    },
];

pub struct NdjsonTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    active: RwLock<EndpointPair>,
    shutdown_tx: watch::Sender<bool>,
}

impl NdjsonTransport {
    /// `base_url` already includes the mount path.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        // No overall timeout: the read stream stays open for the whole session.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("mcp-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to create HTTP client, using default config: {}", e);
                reqwest::Client::new()
            });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            active: RwLock::new(PRIMARY_ENDPOINTS),
            shutdown_tx,
        }
    }

    /// Endpoint pair currently used for reads and writes.
    pub async fn active_endpoints(&self) -> EndpointPair {
        *self.active.read().await
    }

    fn url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn get_stream(&self, url: &str) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.client
            .get(url)
            .header(ACCEPT, NDJSON_MIME_TYPE)
            .send()
            .await
    }

    /// Open the read stream, probing alternates if the primary is missing.
    async fn open_stream(&self) -> Result<(EndpointPair, reqwest::Response)> {
        let primary_url = self.url(PRIMARY_ENDPOINTS.read);
        let response = self.get_stream(&primary_url).await.map_err(|e| {
            AgentError::Transport(format!("GET {} failed: {}", primary_url, e))
        })?;

        if response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            if !status.is_success() {
                return Err(AgentError::Transport(format!(
                    "stream endpoint {} returned {}",
                    primary_url, status
                )));
            }
            return Ok((PRIMARY_ENDPOINTS, response));
        }

        warn!("Stream endpoint {} not found, probing alternates", primary_url);
        let mut tried = vec![primary_url];
        for pair in ALTERNATE_ENDPOINTS {
            let url = self.url(pair.read);
            match self.get_stream(&url).await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Using stream endpoint {}", url);
                    return Ok((pair, resp));
                }
                Ok(resp) => debug!("Probe {} returned {}", url, resp.status()),
                Err(e) => debug!("Probe {} failed: {}", url, e),
            }
            tried.push(url);
        }

        Err(AgentError::Transport(format!(
            "no stream endpoint responded (tried {})",
            tried.join(", ")
        )))
    }
}

#[async_trait]
impl Transport for NdjsonTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(AgentError::Transport("transport closed".into()));
        }
        let url = self.url(self.active_endpoints().await.write);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "POST {} returned {}",
                url, status
            )));
        }
        Ok(())
    }

    async fn inbound(&self) -> Result<InboundStream> {
        let (pair, response) = self.open_stream().await?;
        *self.active.write().await = pair;

        let body = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = BufReader::new(StreamReader::new(body));
        let messages = LinesStream::new(reader.lines()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_line(&line),
                Err(e) => Some(Err(AgentError::Transport(format!("stream read failed: {}", e)))),
            }
        });

        let mut shutdown = self.shutdown_tx.subscribe();
        let stopped = async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        };
        Ok(messages.take_until(stopped).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}

/// Blank lines are keep-alives; malformed lines are skipped.
fn parse_line(line: &str) -> Option<Result<JsonRpcMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(message) => Some(Ok(message)),
        Err(e) => {
            warn!("Skipping malformed NDJSON line: {}", e);
            None
        }
    }
}
