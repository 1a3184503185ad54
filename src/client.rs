//! Client library for the gateway's channel subresources.
//!
//! ```ignore
//! # async fn demo() -> Result<(), vmi_gateway::client::ClientError> {
//! use vmi_gateway::client::{StreamOptions, VmiClient, VsockOptions};
//!
//! let client = VmiClient::new("https://gateway:8443").with_token("secret");
//! let handle = client
//!     .instance("default")
//!     .vsock("fedora", &VsockOptions { target_port: 8888, use_tls: false })
//!     .await?;
//! let (input, output) = (tokio::io::stdin(), tokio::io::stdout());
//! handle.stream(StreamOptions { input, output }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Connecting happens in `vsock`/`serial_console`/`vnc`, so a missing
//! instance or detached channel is reported there. [`StreamHandle::stream`]
//! blocks until the session ends; the caller closing `input` is a clean end.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{to_ws_scheme, RemoteStream};
use crate::model::ChannelKind;
use crate::relay::{relay, StreamError};
use crate::routes::subresources::PLAIN_PROTOCOL;
use crate::ws::byte_stream;

const COPY_BUFFER: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to connect: {0}")]
    Connect(#[source] Box<WsError>),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl From<WsError> for ClientError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let body = response.body().as_deref().unwrap_or_default();
                let message = serde_json::from_slice::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| v["message"].as_str().map(str::to_string))
                    .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
                Self::Status { status, message }
            }
            other => Self::Connect(Box::new(other)),
        }
    }
}

/// Options for a VSOCK stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct VsockOptions {
    pub target_port: u32,
    pub use_tls: bool,
}

/// The caller's own endpoints to bridge to the tunnel.
pub struct StreamOptions<R, W> {
    pub input: R,
    pub output: W,
}

/// Gateway client.
#[derive(Debug, Clone)]
pub struct VmiClient {
    base_url: String,
    token: Option<String>,
}

impl VmiClient {
    /// `base_url` may use `http(s)://` or `ws(s)://`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: to_ws_scheme(base_url.trim_end_matches('/')),
            token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn instance(&self, namespace: &str) -> InstanceClient<'_> {
        InstanceClient {
            client: self,
            namespace: namespace.to_string(),
        }
    }

    async fn connect(&self, url: &str) -> Result<RemoteStream, ClientError> {
        let mut request = url.into_client_request()?;
        if let Some(ref token) = self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PLAIN_PROTOCOL),
        );
        debug!("Connecting to {url}");
        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(socket)
    }
}

/// Channel operations for instances in one namespace.
pub struct InstanceClient<'a> {
    client: &'a VmiClient,
    namespace: String,
}

impl InstanceClient<'_> {
    pub async fn vsock(
        &self,
        name: &str,
        options: &VsockOptions,
    ) -> Result<StreamHandle, ClientError> {
        let query = format!("port={}&tls={}", options.target_port, options.use_tls);
        self.open(name, ChannelKind::Vsock, Some(&query)).await
    }

    pub async fn serial_console(&self, name: &str) -> Result<StreamHandle, ClientError> {
        self.open(name, ChannelKind::Console, None).await
    }

    pub async fn vnc(&self, name: &str) -> Result<StreamHandle, ClientError> {
        self.open(name, ChannelKind::Vnc, None).await
    }

    async fn open(
        &self,
        name: &str,
        kind: ChannelKind,
        query: Option<&str>,
    ) -> Result<StreamHandle, ClientError> {
        let mut url = format!(
            "{}/apis/subresources.kubevirt.io/v1/namespaces/{}/virtualmachineinstances/{name}/{}",
            self.client.base_url,
            self.namespace,
            kind.as_str()
        );
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        let socket = self.client.connect(&url).await?;
        Ok(StreamHandle { socket })
    }
}

/// An open tunnel, ready to be bridged.
pub struct StreamHandle {
    socket: RemoteStream,
}

impl StreamHandle {
    /// Copy `input` into the tunnel and the tunnel into `output` until either
    /// side closes.
    pub async fn stream<R, W>(self, options: StreamOptions<R, W>) -> Result<(), ClientError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let tunnel = byte_stream(self.socket, None, cancel.clone());
        let stats = relay((options.input, options.output), tunnel, cancel, COPY_BUFFER).await?;
        debug!(
            sent = stats.client_to_remote,
            received = stats.remote_to_client,
            "Stream ended: {}",
            stats.ended_by.as_str()
        );
        Ok(())
    }
}
