//! Full-duplex byte relay between a client and a backend.
//!
//! Each direction is copied by its own task. Both tasks report into a
//! completion channel with one slot per direction, so a task that finishes
//! after the relay stopped listening never blocks. The relay returns as soon
//! as the first direction ends (EOF or error), tearing both sockets down so
//! the other copy cannot linger.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Completion channel capacity: one slot per copy direction.
const COMPLETION_SLOTS: usize = 2;

/// Copy direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client_to_backend"),
            Direction::BackendToClient => f.write_str("backend_to_client"),
        }
    }
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// The direction that finished first, if any reported.
    pub direction: Option<Direction>,
    /// Bytes copied in that direction; `None` when it ended in an error.
    pub bytes: Option<u64>,
}

struct Completion {
    direction: Direction,
    result: io::Result<u64>,
}

/// Relay bytes between `client` and `backend` until either direction ends.
///
/// Both streams are closed by the time this returns.
pub async fn relay(client: TcpStream, backend: TcpStream) -> RelayOutcome {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let (done_tx, mut done_rx) = mpsc::channel(COMPLETION_SLOTS);

    let upstream = spawn_copy(
        Direction::ClientToBackend,
        client_read,
        backend_write,
        done_tx.clone(),
    );
    let downstream = spawn_copy(Direction::BackendToClient, backend_read, client_write, done_tx);

    let first = done_rx.recv().await;

    // Dropping the halves held by the tasks closes both sockets.
    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;

    match first {
        Some(Completion { direction, result }) => {
            match &result {
                Ok(bytes) => debug!(direction = %direction, bytes = bytes, "Relay direction closed"),
                Err(e) => debug!(direction = %direction, error = %e, "Relay direction failed"),
            }
            RelayOutcome {
                direction: Some(direction),
                bytes: result.ok(),
            }
        }
        None => RelayOutcome {
            direction: None,
            bytes: None,
        },
    }
}

fn spawn_copy<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    done: mpsc::Sender<Completion>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = done.try_send(Completion { direction, result });
    })
}
