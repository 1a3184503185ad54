//! WebSocket ↔ byte stream adapter.
//!
//! Both ends of a tunnel are WebSockets carrying binary frames: the upgraded
//! client request (axum) and the agent-side device stream (tungstenite).
//! [`byte_stream`] turns either into an `AsyncRead`/`AsyncWrite` pair so the
//! relay only ever copies bytes.
//!
//! Each socket gets a receive task and a send task, both bounded by a small
//! frame queue. The receive task keeps reading while the consumer has room,
//! so a peer that closes or goes quiet is noticed even while the relay is
//! stuck writing the other way. The send task finishes with a Close frame
//! once the writer is shut down, and gives up on a peer that stops reading
//! after the session is cancelled.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{stream, stream::BoxStream, Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, warn};

/// Outbound frames buffered per connection.
const SEND_QUEUE: usize = 32;
/// Inbound frames read ahead of the consumer per connection.
const RECV_QUEUE: usize = 32;
/// Time allowed for queued frames and the closing handshake once the
/// session is over.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// What the adapter cares about in an incoming message.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Pong,
    Close,
    Skip,
}

/// Common surface of the axum and tungstenite message types.
pub trait WsMessage: Send + 'static {
    fn binary(data: Bytes) -> Self;
    fn ping() -> Self;
    fn close() -> Self;
    fn into_frame(self) -> Frame;
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn ping() -> Self {
        Self::Ping(Bytes::new())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Self::Pong(_) => Frame::Pong,
            Self::Close(_) => Frame::Close,
            // Answered by the protocol layer.
            Self::Ping(_) => Frame::Skip,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn ping() -> Self {
        Self::Ping(Bytes::new())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(data) => Frame::Data(data),
            Self::Text(text) => Frame::Data(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Self::Pong(_) => Frame::Pong,
            Self::Close(_) => Frame::Close,
            Self::Ping(_) | Self::Frame(_) => Frame::Skip,
        }
    }
}

/// Ping the peer every `interval`; give up after `timeout` without hearing
/// from it.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub interval: Duration,
    pub timeout: Duration,
}

enum Outbound {
    Data(Bytes),
    Ping,
}

/// Inbound activity, shared by the receive and keepalive tasks.
struct Liveness {
    started: Instant,
    last_seen_ms: AtomicU64,
    /// Set while the receive task waits for the consumer to make room.
    blocked: AtomicBool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(elapsed_ms(self.started), Ordering::Relaxed);
    }

    fn silent_for(&self) -> u64 {
        elapsed_ms(self.started).saturating_sub(self.last_seen_ms.load(Ordering::Relaxed))
    }

    fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Relaxed);
    }
}

/// Read half: the binary payloads of the peer's frames, ending at Close.
pub type WsReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Write half. Each `write` becomes one binary frame.
///
/// Dropping the writer without shutting it down aborts the send task and
/// discards whatever is still queued.
pub struct WsWriter {
    tx: PollSender<Outbound>,
    sender: Option<JoinHandle<()>>,
}

impl AsyncWrite for WsWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| closed())?;
        self.tx
            .send_item(Outbound::Data(Bytes::copy_from_slice(buf)))
            .map_err(|_| closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Stops accepting data, then waits for queued frames and the Close frame
    /// to be sent.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        if let Some(handle) = self.sender.as_mut() {
            let _ = ready!(Pin::new(handle).poll(cx));
            self.sender = None;
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for WsWriter {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.abort();
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
}

/// Split `socket` into a byte reader and writer.
///
/// `cancel` ends the session. It is fired when sending to the peer fails, when
/// the peer closes and its data is not drained within a short grace period,
/// and, with `keepalive` set, when the peer goes silent. Once `cancel` fires
/// the receive task stops and the send task gets the same grace period to
/// finish, so the socket is released even if the peer never reads again.
pub fn byte_stream<S, M, E>(
    socket: S,
    keepalive: Option<Keepalive>,
    cancel: CancellationToken,
) -> (WsReader, WsWriter)
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + 'static,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    let (sink, source) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE);
    let (in_tx, in_rx) = mpsc::channel(RECV_QUEUE);
    let liveness = Arc::new(Liveness::new());
    let released = CancellationToken::new();

    if let Some(keepalive) = keepalive {
        tokio::spawn(keepalive_loop(
            keepalive,
            out_tx.clone(),
            liveness.clone(),
            cancel.clone(),
        ));
    }
    tokio::spawn(recv_loop::<M, _, _>(
        source,
        in_tx,
        liveness,
        released.clone(),
        cancel.clone(),
    ));
    let sender = tokio::spawn(send_loop::<M, _>(sink, out_rx, cancel));

    // The guard lives as long as the reader does.
    let incoming = stream::unfold(
        (in_rx, released.drop_guard()),
        |(mut rx, guard)| async move { rx.recv().await.map(|item| (item, (rx, guard))) },
    )
    .boxed();

    let writer = WsWriter {
        tx: PollSender::new(out_tx),
        sender: Some(sender),
    };
    (StreamReader::new(incoming), writer)
}

async fn recv_loop<M, St, E>(
    mut stream: St,
    tx: mpsc::Sender<io::Result<Bytes>>,
    liveness: Arc<Liveness>,
    released: CancellationToken,
    cancel: CancellationToken,
) where
    M: WsMessage,
    St: Stream<Item = Result<M, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let item = match next {
            None => break,
            Some(Err(e)) => Err(io::Error::other(e)),
            Some(Ok(msg)) => {
                liveness.touch();
                match M::into_frame(msg) {
                    Frame::Data(data) if !data.is_empty() => Ok(data),
                    Frame::Close => break,
                    _ => continue,
                }
            }
        };
        let failed = item.is_err();

        let permit = match tx.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Closed(())) => return,
            Err(TrySendError::Full(())) => {
                liveness.set_blocked(true);
                let permit = tokio::select! {
                    () = cancel.cancelled() => None,
                    permit = tx.reserve() => permit.ok(),
                };
                liveness.set_blocked(false);
                liveness.touch();
                match permit {
                    Some(permit) => permit,
                    None => return,
                }
            }
        };
        permit.send(item);
        if failed {
            break;
        }
    }

    // Peer is gone. The reader sees EOF once it drains the queue.
    drop(tx);
    tokio::select! {
        () = cancel.cancelled() => {}
        () = released.cancelled() => {}
        () = tokio::time::sleep(CLOSE_GRACE) => {
            debug!("Peer closed but its data was not drained, closing session");
            cancel.cancel();
        }
    }
}

async fn send_loop<M, Si>(
    mut sink: Si,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    M: WsMessage,
    Si: Sink<M> + Unpin,
    Si::Error: std::fmt::Display,
{
    let forward = async {
        while let Some(outbound) = rx.recv().await {
            let msg = match outbound {
                Outbound::Data(data) => M::binary(data),
                Outbound::Ping => M::ping(),
            };
            if let Err(e) = sink.send(msg).await {
                debug!("WebSocket send failed: {e}");
                cancel.cancel();
                return;
            }
        }
        let _ = sink.send(M::close()).await;
        let _ = sink.close().await;
    };
    let deadline = async {
        cancel.cancelled().await;
        tokio::time::sleep(CLOSE_GRACE).await;
    };
    tokio::select! {
        () = forward => {}
        () = deadline => debug!("Peer stopped reading, dropping connection"),
    }
}

async fn keepalive_loop(
    keepalive: Keepalive,
    tx: mpsc::Sender<Outbound>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(keepalive.interval);
    interval.tick().await;
    let timeout_ms = u64::try_from(keepalive.timeout.as_millis()).unwrap_or(u64::MAX);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        if liveness.is_blocked() {
            // Pongs are queued behind data nobody is reading yet.
            liveness.touch();
        } else {
            let silent_for = liveness.silent_for();
            if silent_for > timeout_ms {
                warn!("Peer missed keepalive for {silent_for}ms, closing session");
                cancel.cancel();
                return;
            }
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            sent = tx.send(Outbound::Ping) => if sent.is_err() { return },
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
