//! Bidirectional byte relay between a client connection and a device stream.
//!
//! Two pump tasks copy client→remote and remote→client. The first pump to
//! stop, for any reason, cancels the session token; the other pump observes
//! the cancellation and stops too. Each pump shuts down the writer it owns
//! and drops its halves before returning, so neither side is left half-open.
//! [`relay`] returns only after both pumps have finished.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Time a pump waits for its writer to shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientToRemote => "client->remote",
            Self::RemoteToClient => "remote->client",
        })
    }
}

/// Why a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ClientClosed,
    RemoteClosed,
    Cancelled,
}

impl EndReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::RemoteClosed => "remote_closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of a clean session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_remote: u64,
    pub remote_to_client: u64,
    pub ended_by: EndReason,
}

/// A session that ended on an I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{direction} copy failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
    #[error("{0} copy task aborted")]
    Aborted(Direction),
}

enum PumpEnd {
    Eof,
    Cancelled,
    Failed(io::Error),
}

/// Copy bytes both ways until either side closes, fails, or `cancel` fires.
pub async fn relay<CR, CW, RR, RW>(
    client: (CR, CW),
    remote: (RR, RW),
    cancel: CancellationToken,
    buffer_size: usize,
) -> Result<RelayStats, StreamError>
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    RR: AsyncRead + Unpin + Send + 'static,
    RW: AsyncWrite + Unpin + Send + 'static,
{
    let (client_reader, client_writer) = client;
    let (remote_reader, remote_writer) = remote;
    let up = Arc::new(AtomicU64::new(0));
    let down = Arc::new(AtomicU64::new(0));

    let upstream = tokio::spawn(pump(
        client_reader,
        remote_writer,
        up.clone(),
        cancel.clone(),
        buffer_size,
    ));
    let downstream = tokio::spawn(pump(
        remote_reader,
        client_writer,
        down.clone(),
        cancel.clone(),
        buffer_size,
    ));

    let (up_end, down_end) = tokio::join!(upstream, downstream);
    let up_end = up_end.map_err(|_| StreamError::Aborted(Direction::ClientToRemote))?;
    let down_end = down_end.map_err(|_| StreamError::Aborted(Direction::RemoteToClient))?;

    let ended_by = match (up_end, down_end) {
        (PumpEnd::Failed(source), _) => {
            return Err(StreamError::Io {
                direction: Direction::ClientToRemote,
                source,
            })
        }
        (_, PumpEnd::Failed(source)) => {
            return Err(StreamError::Io {
                direction: Direction::RemoteToClient,
                source,
            })
        }
        (PumpEnd::Eof, _) => EndReason::ClientClosed,
        (_, PumpEnd::Eof) => EndReason::RemoteClosed,
        (PumpEnd::Cancelled, PumpEnd::Cancelled) => EndReason::Cancelled,
    };

    Ok(RelayStats {
        client_to_remote: up.load(Ordering::Relaxed),
        remote_to_client: down.load(Ordering::Relaxed),
        ended_by,
    })
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    copied: Arc<AtomicU64>,
    cancel: CancellationToken,
    buffer_size: usize,
) -> PumpEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _cancel_on_panic = cancel.clone().drop_guard();
    let end = tokio::select! {
        result = copy_counted(&mut reader, &mut writer, &copied, buffer_size) => match result {
            Ok(()) => PumpEnd::Eof,
            Err(e) => PumpEnd::Failed(e),
        },
        () = cancel.cancelled() => PumpEnd::Cancelled,
    };
    // First exit closes both sides.
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown())
        .await
        .is_err()
    {
        debug!("Writer shutdown timed out");
    }
    drop(reader);
    end
}

async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    copied: &AtomicU64,
    buffer_size: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return writer.flush().await;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{duplex, split, DuplexStream, ReadBuf};

    /// Spawned relay plus the application ends of both connections.
    fn start(
        cancel: CancellationToken,
    ) -> (
        DuplexStream,
        DuplexStream,
        tokio::task::JoinHandle<Result<RelayStats, StreamError>>,
    ) {
        let (client_app, client_gw) = duplex(1024);
        let (remote_app, remote_gw) = duplex(1024);
        let handle = tokio::spawn(relay(split(client_gw), split(remote_gw), cancel, 64));
        (client_app, remote_app, handle)
    }

    async fn finish(
        handle: tokio::task::JoinHandle<Result<RelayStats, StreamError>>,
    ) -> Result<RelayStats, StreamError> {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not return")
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_fidelity() {
        let (mut client, mut remote, handle) = start(CancellationToken::new());

        client.write_all(b"Hello World!").await.unwrap();
        let mut buf = [0u8; 12];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World!");

        remote.write_all(&buf).await.unwrap();
        let mut back = [0u8; 12];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"Hello World!");

        drop(client);
        let stats = finish(handle).await.unwrap();
        assert_eq!(stats.client_to_remote, 12);
        assert_eq!(stats.remote_to_client, 12);
        assert_eq!(stats.ended_by, EndReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_client_close_closes_remote() {
        let (client, mut remote, handle) = start(CancellationToken::new());
        drop(client);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            finish(handle).await.unwrap().ended_by,
            EndReason::ClientClosed
        );
    }

    #[tokio::test]
    async fn test_remote_close_closes_client() {
        let (mut client, mut remote, handle) = start(CancellationToken::new());
        remote.write_all(b"bye").await.unwrap();
        drop(remote);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest, b"bye");
        assert_eq!(
            finish(handle).await.unwrap().ended_by,
            EndReason::RemoteClosed
        );
    }

    #[tokio::test]
    async fn test_cancel_closes_both() {
        let cancel = CancellationToken::new();
        let (mut client, mut remote, handle) = start(cancel.clone());
        cancel.cancel();

        assert_eq!(finish(handle).await.unwrap().ended_by, EndReason::Cancelled);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    #[tokio::test]
    async fn test_read_failure_is_error_and_closes_other_side() {
        let (client_app, client_gw) = duplex(1024);
        let (_, client_writer) = split(client_gw);
        let (mut remote_app, remote_gw) = duplex(1024);

        let handle = tokio::spawn(relay(
            (Broken, client_writer),
            split(remote_gw),
            CancellationToken::new(),
            64,
        ));

        let err = finish(handle).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Io {
                direction: Direction::ClientToRemote,
                ..
            }
        ));
        let mut rest = Vec::new();
        remote_app.read_to_end(&mut rest).await.unwrap();
        drop(client_app);
    }
}
