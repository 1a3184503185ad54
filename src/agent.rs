//! Node dialer: negotiates a device stream with the agent on the instance's node.
//!
//! Dialing is two hops. The gateway first asks the node agent to resolve the
//! channel:
//!
//! ```text
//! GET {agent}/v1/namespaces/{ns}/virtualmachineinstances/{name}/{kind}/uri?cid=3&port=8888&tls=false
//! Authorization: Bearer <agent token>
//!
//! 200 {"uri": "/v1/streams/…", "subprotocol": "plain.kubevirt.io"}
//! ```
//!
//! The answer is only a reference. [`open_remote`] opens it as a WebSocket so
//! negotiation failures and data-path failures stay distinguishable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::channel::DialTarget;
use crate::config::AgentConfig;
use crate::model::{InstanceRef, VirtualMachineInstance};

/// An opened agent-side device stream.
pub type RemoteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Failure to reach the device behind a channel. Always a gateway-side failure.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("unable to connect to VirtualMachineInstance {0}: it is not scheduled on a node")]
    Unscheduled(InstanceRef),
    #[error("no node agent endpoint known for node {node}")]
    NoAgent { node: String },
    #[error("channel cannot be resolved: {0}")]
    Unresolvable(String),
    #[error("node agent on {node} is unreachable: {source}")]
    Unreachable {
        node: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("node agent on {node} refused the channel (HTTP {status}): {message}")]
    Agent {
        node: String,
        status: u16,
        message: String,
    },
    #[error("node agent on {node} returned an invalid answer: {message}")]
    InvalidAnswer { node: String, message: String },
    #[error("failed to open device stream at {uri}: {source}")]
    Open {
        uri: String,
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    #[error("timed out opening device stream at {uri}")]
    Timeout { uri: String },
}

/// Reference to a device stream, produced by a [`NodeDialer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialResult {
    pub uri: String,
    pub bearer: Option<String>,
    pub subprotocol: Option<String>,
}

/// Resolves a channel on the node an instance runs on.
#[async_trait]
pub trait NodeDialer: Send + Sync {
    async fn dial(
        &self,
        vmi: &VirtualMachineInstance,
        target: &DialTarget,
    ) -> Result<DialResult, DialError>;
}

#[derive(Deserialize)]
struct ResolveAnswer {
    uri: String,
    #[serde(default)]
    subprotocol: Option<String>,
}

/// [`NodeDialer`] speaking the node agent's HTTP control API.
pub struct AgentDialer {
    http: reqwest::Client,
    url_template: String,
    nodes: HashMap<String, String>,
    token: Option<String>,
}

impl AgentDialer {
    pub fn new(http: reqwest::Client, config: &AgentConfig, token: Option<String>) -> Self {
        Self {
            http,
            url_template: config.url_template.clone(),
            nodes: config.nodes.clone(),
            token,
        }
    }

    /// Build a dialer with its own HTTP client honouring `control_timeout_secs`.
    pub fn from_config(config: &AgentConfig, token: Option<String>) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(config.control_timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self::new(http, config, token))
    }

    /// Agent base URL for `node`: the explicit mapping if any, else the template.
    pub fn endpoint(&self, node: &str) -> Result<String, DialError> {
        if let Some(url) = self.nodes.get(node) {
            return Ok(url.trim_end_matches('/').to_string());
        }
        if self.url_template.is_empty() {
            return Err(DialError::NoAgent {
                node: node.to_string(),
            });
        }
        Ok(self
            .url_template
            .replace("{node}", node)
            .trim_end_matches('/')
            .to_string())
    }
}

#[async_trait]
impl NodeDialer for AgentDialer {
    async fn dial(
        &self,
        vmi: &VirtualMachineInstance,
        target: &DialTarget,
    ) -> Result<DialResult, DialError> {
        let node = vmi
            .status
            .node_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| DialError::Unscheduled(vmi.instance_ref()))?;
        let endpoint = self.endpoint(node)?;
        let url = format!(
            "{endpoint}/v1/namespaces/{}/virtualmachineinstances/{}/{}/uri",
            vmi.metadata.namespace,
            vmi.metadata.name,
            target.kind.as_str()
        );
        debug!(%node, %url, "Resolving channel with node agent");

        let mut request = self.http.get(&url).query(&target.query);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|source| DialError::Unreachable {
                node: node.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DialError::Agent {
                node: node.to_string(),
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        let answer: ResolveAnswer =
            resp.json()
                .await
                .map_err(|e| DialError::InvalidAnswer {
                    node: node.to_string(),
                    message: e.to_string(),
                })?;
        if answer.uri.is_empty() {
            return Err(DialError::InvalidAnswer {
                node: node.to_string(),
                message: "empty uri".into(),
            });
        }

        let uri = resolve_uri(&endpoint, &answer.uri);
        info!(%node, kind = %target.kind, %uri, "Node agent resolved channel");
        Ok(DialResult {
            uri,
            bearer: self.token.clone(),
            subprotocol: answer.subprotocol,
        })
    }
}

/// Turn an agent answer into an absolute WebSocket URI. Relative paths are
/// joined onto the agent endpoint with its scheme switched to `ws`/`wss`.
fn resolve_uri(endpoint: &str, uri: &str) -> String {
    if uri.starts_with("ws://") || uri.starts_with("wss://") {
        return uri.to_string();
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return to_ws_scheme(uri);
    }
    format!("{}/{}", to_ws_scheme(endpoint), uri.trim_start_matches('/'))
}

/// Map `http(s)://` to `ws(s)://`, leaving other schemes untouched.
pub fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Open the stream a [`DialResult`] points at, within `timeout`.
pub async fn open_remote(dial: &DialResult, timeout: Duration) -> Result<RemoteStream, DialError> {
    let open_error = |source: tokio_tungstenite::tungstenite::Error| DialError::Open {
        uri: dial.uri.clone(),
        source: Box::new(source),
    };

    let mut request = dial.uri.as_str().into_client_request().map_err(open_error)?;
    if let Some(ref token) = dial.bearer {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            open_error(tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))
        })?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    if let Some(ref protocol) = dial.subprotocol {
        let value = HeaderValue::from_str(protocol).map_err(|e| {
            open_error(tokio_tungstenite::tungstenite::Error::HttpFormat(e.into()))
        })?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
    }

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(open_error(e)),
        Err(_) => Err(DialError::Timeout {
            uri: dial.uri.clone(),
        }),
    }
}
