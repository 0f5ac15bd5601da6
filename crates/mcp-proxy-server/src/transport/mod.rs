//! Transport implementations and backing-transport selection.
//!
//! The browser always talks to an `SseServerTransport`. The backing server is
//! reached through either a spawned process (`stdio`) or a remote SSE endpoint
//! (`sse`), chosen per connection from the query string.

pub mod sse_client;
pub mod sse_server;
pub mod stdio;

pub use sse_client::SseClientTransport;
pub use sse_server::{SseServerTransport, SseStream};
pub use stdio::{default_environment, StdioParams, StdioTransport};

use crate::config::ProxyConfig;
use mcp_proxy_core::{RelayError, RelayResult, Transport};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Kind of backing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
}

impl FromStr for TransportKind {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            other => Err(RelayError::InvalidTransportKind(other.to_string())),
        }
    }
}

/// Query string of `GET /sse`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub transport_type: Option<String>,
    pub command: Option<String>,
    /// Whitespace-separated argument list.
    pub args: Option<String>,
    /// JSON object of environment variables.
    pub env: Option<String>,
    pub url: Option<String>,
}

/// Validated parameters for the backing transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportParams {
    Stdio(StdioParams),
    Sse { url: String },
}

impl TransportParams {
    /// Validate connection parameters. Nothing is started here.
    pub fn from_query(query: &ConnectQuery) -> RelayResult<Self> {
        let kind: TransportKind = query
            .transport_type
            .as_deref()
            .unwrap_or_default()
            .parse()?;

        match kind {
            TransportKind::Stdio => {
                let command = query
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| RelayError::InvalidParams("stdio transport requires a command".into()))?;
                let args = query
                    .args
                    .as_deref()
                    .map(|a| a.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                let env = match query.env.as_deref().filter(|e| !e.is_empty()) {
                    Some(raw) => Some(serde_json::from_str::<HashMap<String, String>>(raw).map_err(
                        |e| RelayError::InvalidParams(format!("env must be a JSON object of strings: {e}")),
                    )?),
                    None => None,
                };
                Ok(Self::Stdio(StdioParams {
                    command: command.to_string(),
                    args,
                    env,
                }))
            }
            TransportKind::Sse => {
                let url = query
                    .url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| RelayError::InvalidParams("sse transport requires a url".into()))?;
                Ok(Self::Sse {
                    url: url.to_string(),
                })
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }
}

/// Create and start the transport to the backing server.
pub async fn connect_backing(
    params: TransportParams,
    config: &ProxyConfig,
) -> RelayResult<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match params {
        TransportParams::Stdio(stdio) => {
            info!(
                command = %stdio.command,
                args = ?stdio.args,
                custom_env = stdio.env.is_some(),
                "stdio transport requested"
            );
            Arc::new(StdioTransport::new(stdio, config.max_message_bytes))
        }
        TransportParams::Sse { url } => {
            info!(url = %url, "sse transport requested");
            Arc::new(SseClientTransport::new(
                &url,
                config.connect_timeout,
                config.startup_timeout,
                config.max_message_bytes,
            )?)
        }
    };

    transport.start().await?;
    info!(transport = transport.kind(), "backing transport started");
    Ok(transport)
}
