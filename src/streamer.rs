//! The tunnel pipeline shared by every channel kind.
//!
//! ```text
//! Pending ─locate─▶ Validating ─validate─▶ Dialing ─dial+open─▶ Streaming ─▶ Closed
//!    │                  │                     │                     │
//!    └─ 404 / 500       └─ 400                └─ 502                └─ Ok(stats) / Err(StreamError)
//! ```
//!
//! [`Streamer::prepare`] covers everything up to an opened device stream and
//! runs before the client connection is upgraded, so every failure there can
//! still be answered with a status code. [`Streamer::stream`] relays bytes
//! once the upgrade is done.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{open_remote, NodeDialer, RemoteStream};
use crate::channel::{require_running, DeviceChannel};
use crate::config::{AgentConfig, StreamConfig};
use crate::error::TunnelError;
use crate::metrics::{ActiveSessions, SessionGuard};
use crate::model::ChannelRequest;
use crate::relay::{relay, RelayStats, StreamError};
use crate::store::{locate, InstanceStore};
use crate::ws::{byte_stream, Keepalive, WsMessage};

/// Session lifecycle phase, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Validating,
    Dialing,
    Streaming,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Dialing => "dialing",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
        })
    }
}

/// Per-session knobs.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub keepalive: Option<Keepalive>,
    pub max_session: Option<Duration>,
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

impl StreamSettings {
    pub fn from_config(stream: &StreamConfig, agent: &AgentConfig) -> Self {
        let keepalive = (stream.keepalive_interval_secs > 0).then(|| Keepalive {
            interval: Duration::from_secs(stream.keepalive_interval_secs),
            timeout: Duration::from_secs(stream.keepalive_timeout_secs),
        });
        Self {
            keepalive,
            max_session: stream.max_session_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_secs(agent.connect_timeout_secs),
            buffer_size: stream.buffer_size,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default(), &AgentConfig::default())
    }
}

/// A session whose device stream is open, waiting for the client upgrade.
///
/// Holds the session's accounting guard; dropping it without streaming
/// releases the count and closes the device stream.
pub struct PreparedSession {
    pub request: ChannelRequest,
    pub id: Uuid,
    remote: RemoteStream,
    guard: SessionGuard,
}

/// Generic tunnel over a store and a node dialer.
pub struct Streamer {
    store: Arc<dyn InstanceStore>,
    dialer: Arc<dyn NodeDialer>,
    sessions: ActiveSessions,
    settings: StreamSettings,
}

impl Streamer {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        dialer: Arc<dyn NodeDialer>,
        sessions: ActiveSessions,
        settings: StreamSettings,
    ) -> Self {
        Self {
            store,
            dialer,
            sessions,
            settings,
        }
    }

    pub fn sessions(&self) -> &ActiveSessions {
        &self.sessions
    }

    /// Locate, validate, count and dial. Nothing is acquired unless the
    /// instance exists and the channel is usable.
    pub async fn prepare(
        &self,
        channel: &dyn DeviceChannel,
        request: ChannelRequest,
    ) -> Result<PreparedSession, TunnelError> {
        debug!(phase = %Phase::Pending, instance = %request.instance, "Locating instance");
        let vmi = locate(self.store.as_ref(), &request.instance).await?;

        debug!(phase = %Phase::Validating, "Validating channel");
        if let Err(rejection) = channel
            .validate(&vmi, &request.params)
            .and_then(|()| require_running(&vmi))
        {
            info!(
                instance = %request.instance,
                kind = %request.kind,
                reason = rejection.kind.as_str(),
                "Rejected channel request: {rejection}"
            );
            return Err(rejection.into());
        }

        let guard = self.sessions.acquire(request.kind, &request.instance);
        debug!(phase = %Phase::Dialing, "Dialing node agent");
        let target = channel.dial_target(&vmi, &request.params)?;
        let dial = self.dialer.dial(&vmi, &target).await.map_err(|e| {
            warn!(instance = %request.instance, "Dial failed: {e}");
            e
        })?;
        let remote = open_remote(&dial, self.settings.connect_timeout)
            .await
            .map_err(|e| {
                warn!(instance = %request.instance, "Opening device stream failed: {e}");
                e
            })?;

        Ok(PreparedSession {
            request,
            id: Uuid::new_v4(),
            remote,
            guard,
        })
    }

    /// Relay between the upgraded client socket and the device stream until
    /// one side closes, a copy fails or `cancel` fires.
    pub async fn stream<S, M, E>(
        &self,
        session: PreparedSession,
        client: S,
        cancel: CancellationToken,
    ) -> Result<RelayStats, StreamError>
    where
        S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
        M: WsMessage,
        E: std::error::Error + Send + Sync + 'static,
    {
        let PreparedSession {
            request,
            id,
            remote,
            guard,
        } = session;
        let started = Instant::now();
        info!(phase = %Phase::Streaming, session = %id, instance = %request.instance, kind = %request.kind, "Session started");

        if let Some(limit) = self.settings.max_session {
            let deadline = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(limit) => {
                        info!("Session reached its {}s limit", limit.as_secs());
                        deadline.cancel();
                    }
                    () = deadline.cancelled() => {}
                }
            });
        }

        let client = byte_stream(client, self.settings.keepalive, cancel.clone());
        let remote = byte_stream(remote, None, cancel.clone());
        let result = relay(client, remote, cancel.clone(), self.settings.buffer_size).await;
        cancel.cancel();
        drop(guard);

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(stats) => info!(
                phase = %Phase::Closed,
                session = %id,
                ended_by = stats.ended_by.as_str(),
                bytes_in = stats.client_to_remote,
                bytes_out = stats.remote_to_client,
                "Session closed after {elapsed:.1}s"
            ),
            Err(e) => warn!(
                phase = %Phase::Closed,
                session = %id,
                "Session failed after {elapsed:.1}s: {e}"
            ),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use crate::agent::{DialError, DialResult};
    use crate::channel::{DialTarget, VsockChannel};
    use crate::error::RejectionKind;
    use crate::model::{ChannelKind, ChannelParams, InstanceRef, VirtualMachineInstance};
    use crate::relay::EndReason;
    use crate::store::MemoryStore;

    /// Answers every dial with a fixed URI (or an error) and counts calls.
    pub(crate) struct RecordingDialer {
        pub calls: AtomicUsize,
        pub uri: Option<String>,
    }

    #[async_trait]
    impl NodeDialer for RecordingDialer {
        async fn dial(
            &self,
            vmi: &VirtualMachineInstance,
            _target: &DialTarget,
        ) -> Result<DialResult, DialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.uri {
                Some(ref uri) => Ok(DialResult {
                    uri: uri.clone(),
                    bearer: None,
                    subprotocol: None,
                }),
                None => Err(DialError::Unscheduled(vmi.instance_ref())),
            }
        }
    }

    /// WebSocket server echoing binary frames back until the peer closes.
    pub(crate) async fn spawn_echo() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                        return;
                    };
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(data) => {
                                if ws.send(Message::Binary(data)).await.is_err() {
                                    return;
                                }
                            }
                            Message::Close(_) => return,
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{addr}/echo")
    }

    pub(crate) fn vsock_vmi(namespace: &str, name: &str) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new(namespace, name);
        vmi.spec.domain.devices.autoattach_vsock = Some(true);
        vmi.status.phase = "Running".into();
        vmi.status.node_name = Some("node01".into());
        vmi.status.vsock_cid = Some(3);
        vmi
    }

    fn request(namespace: &str, name: &str) -> ChannelRequest {
        ChannelRequest::new(
            namespace,
            name,
            ChannelKind::Vsock,
            ChannelParams {
                port: Some(8888),
                tls: false,
            },
        )
    }

    async fn streamer(
        instances: Vec<VirtualMachineInstance>,
        uri: Option<String>,
    ) -> (Streamer, Arc<RecordingDialer>) {
        let dialer = Arc::new(RecordingDialer {
            calls: AtomicUsize::new(0),
            uri,
        });
        let settings = StreamSettings {
            keepalive: None,
            ..StreamSettings::default()
        };
        let streamer = Streamer::new(
            Arc::new(MemoryStore::from_instances(instances)),
            dialer.clone(),
            ActiveSessions::new(),
            settings,
        );
        (streamer, dialer)
    }

    #[tokio::test]
    async fn test_missing_instance_never_dials() {
        let (streamer, dialer) = streamer(vec![], Some(spawn_echo().await)).await;
        let err = streamer
            .prepare(&VsockChannel, request("x", "missing"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::NotFound(_)));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(streamer.sessions().total(), 0);
    }

    #[tokio::test]
    async fn test_detached_channel_never_dials() {
        let mut vmi = vsock_vmi("ns", "vm");
        vmi.spec.domain.devices.autoattach_vsock = Some(false);
        let (streamer, dialer) = streamer(vec![vmi], Some(spawn_echo().await)).await;

        let err = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .err()
            .unwrap();
        match err {
            TunnelError::Rejected(r) => {
                assert_eq!(r.kind, RejectionKind::NotAttached);
                assert_eq!(r.message, "VSOCK is not attached.");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            streamer
                .sessions()
                .get(ChannelKind::Vsock, &InstanceRef::new("ns", "vm")),
            0
        );
    }

    #[tokio::test]
    async fn test_not_running_is_rejected() {
        let mut vmi = vsock_vmi("ns", "vm");
        vmi.status.phase = "Scheduled".into();
        let (streamer, dialer) = streamer(vec![vmi], None).await;
        let err = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Rejected(ref r) if r.kind == RejectionKind::NotRunning));
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_count() {
        let (streamer, dialer) = streamer(vec![vsock_vmi("ns", "vm")], None).await;
        let err = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(streamer.sessions().total(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_releases_count() {
        let (streamer, _) = streamer(
            vec![vsock_vmi("ns", "vm")],
            Some("ws://127.0.0.1:1/nothing".into()),
        )
        .await;
        let err = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Dial(DialError::Open { .. })));
        assert_eq!(streamer.sessions().total(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_count_independently() {
        let (streamer, _) = streamer(
            vec![vsock_vmi("ns", "a"), vsock_vmi("ns", "b")],
            Some(spawn_echo().await),
        )
        .await;
        let a = streamer.prepare(&VsockChannel, request("ns", "a")).await.unwrap();
        let b = streamer.prepare(&VsockChannel, request("ns", "b")).await.unwrap();
        let sessions = streamer.sessions();
        assert_eq!(sessions.get(ChannelKind::Vsock, &InstanceRef::new("ns", "a")), 1);
        assert_eq!(sessions.get(ChannelKind::Vsock, &InstanceRef::new("ns", "b")), 1);

        drop(a);
        assert_eq!(sessions.get(ChannelKind::Vsock, &InstanceRef::new("ns", "a")), 0);
        assert_eq!(sessions.get(ChannelKind::Vsock, &InstanceRef::new("ns", "b")), 1);
        drop(b);
        assert_eq!(sessions.total(), 0);
    }

    #[tokio::test]
    async fn test_stream_round_trip_and_release() {
        use tokio_tungstenite::tungstenite::protocol::Role;
        use tokio_tungstenite::WebSocketStream;

        let (streamer, _) =
            streamer(vec![vsock_vmi("ns", "vm")], Some(spawn_echo().await)).await;
        let session = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .unwrap();
        assert_eq!(streamer.sessions().total(), 1);

        let (client_end, gateway_end) = tokio::io::duplex(64 * 1024);
        let (mut client, gateway) = tokio::join!(
            WebSocketStream::from_raw_socket(client_end, Role::Client, None),
            WebSocketStream::from_raw_socket(gateway_end, Role::Server, None),
        );

        let streamer = Arc::new(streamer);
        let relay = {
            let streamer = streamer.clone();
            tokio::spawn(async move {
                streamer
                    .stream(session, gateway, CancellationToken::new())
                    .await
            })
        };

        client
            .send(Message::Binary(Bytes::from_static(b"Hello World!")))
            .await
            .unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], b"Hello World!"),
            other => panic!("unexpected {other:?}"),
        }
        client.close(None).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(10), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.ended_by, EndReason::ClientClosed);
        assert_eq!(stats.client_to_remote, 12);
        assert_eq!(streamer.sessions().total(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_session() {
        use tokio_tungstenite::tungstenite::protocol::Role;
        use tokio_tungstenite::WebSocketStream;

        let (mut streamer, _) =
            streamer(vec![vsock_vmi("ns", "vm")], Some(spawn_echo().await)).await;
        streamer.settings.max_session = Some(Duration::from_millis(100));
        let session = streamer
            .prepare(&VsockChannel, request("ns", "vm"))
            .await
            .unwrap();

        let (client_end, gateway_end) = tokio::io::duplex(64 * 1024);
        let (_client, gateway) = tokio::join!(
            WebSocketStream::from_raw_socket(client_end, Role::Client, None),
            WebSocketStream::from_raw_socket(gateway_end, Role::Server, None),
        );

        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            streamer.stream(session, gateway, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(stats.ended_by, EndReason::Cancelled);
        assert_eq!(streamer.sessions().total(), 0);
    }
}
