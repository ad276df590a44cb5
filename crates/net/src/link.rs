//! Peer links
//!
//! Every established connection, inbound or outbound, becomes a link. The
//! owner of the node receives [`PeerEvent`]s for all links on one channel
//! and replies through the [`LinkHandle`] it got when the link joined.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::write_frame;
use crate::protocol::{Blob, Message, PeerInfo};

/// Outgoing queue depth per link
pub(crate) const LINK_QUEUE: usize = 256;

/// A link is dropped after this long without hearing from the peer
pub(crate) const LINK_DEAD_TIMEOUT: Duration = Duration::from_millis(6000);

/// How long the Hello/Welcome exchange may take
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by us
    Outbound,
}

/// Who this node is, presented during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub room: String,
    pub replica_id: Uuid,
    pub secret: Option<String>,
}

impl Identity {
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            replica_id: self.replica_id,
            room: self.room.clone(),
        }
    }
}

/// Sending side of an established link
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub id: LinkId,
    pub peer: PeerInfo,
    pub direction: Direction,
    tx: mpsc::Sender<Message>,
}

impl LinkHandle {
    pub(crate) fn new(peer: PeerInfo, direction: Direction, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: LinkId::next(),
            peer,
            direction,
            tx,
        }
    }

    pub fn replica_id(&self) -> Uuid {
        self.peer.replica_id
    }

    /// Queue a message for the peer
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::NotConnected)
    }

    /// Ask the link to close after flushing queued messages
    pub async fn close(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Something happened on a link
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Joined(LinkHandle),
    Update {
        link: LinkId,
        from: Uuid,
        blob: Blob,
    },
    SyncRequest {
        link: LinkId,
        from: Uuid,
        state: Blob,
    },
    SyncBatch {
        link: LinkId,
        from: Uuid,
        blobs: Vec<Blob>,
    },
    Left {
        link: LinkId,
        replica_id: Uuid,
    },
}

/// What the read loop should do after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

/// Handle a message received on an established link.
///
/// Document traffic is forwarded as events; liveness traffic is answered
/// here.
pub(crate) async fn dispatch(
    msg: Message,
    link: &LinkHandle,
    events: &mpsc::Sender<PeerEvent>,
) -> Flow {
    let from = link.replica_id();
    let event = match msg {
        Message::Update { blob } => PeerEvent::Update {
            link: link.id,
            from,
            blob,
        },
        Message::SyncRequest { state } => PeerEvent::SyncRequest {
            link: link.id,
            from,
            state,
        },
        Message::SyncBatch { blobs } => PeerEvent::SyncBatch {
            link: link.id,
            from,
            blobs,
        },
        Message::Ping => {
            let _ = link.send(Message::Pong).await;
            return Flow::Continue;
        }
        Message::Shutdown => {
            debug!(link = %link.id, "Peer is shutting down");
            return Flow::Close;
        }
        Message::Heartbeat { .. } | Message::Pong => {
            trace!(link = %link.id, "Liveness message");
            return Flow::Continue;
        }
        Message::PeerList { peers } => {
            debug!(link = %link.id, count = peers.len(), "Peer list updated");
            return Flow::Continue;
        }
        Message::PeerLeft { replica_id } => {
            debug!(link = %link.id, replica = %replica_id, "Remote peer left");
            return Flow::Continue;
        }
        other => {
            debug!(link = %link.id, message = ?other, "Ignoring unexpected message");
            return Flow::Continue;
        }
    };

    if events.send(event).await.is_err() {
        debug!(link = %link.id, "Event receiver dropped");
        return Flow::Close;
    }
    Flow::Continue
}

/// Drain a link's outgoing queue onto the socket.
///
/// Stops after writing `Shutdown` or on the first write error.
pub(crate) async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let last = matches!(msg, Message::Shutdown);
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
        if last {
            break;
        }
    }
}

/// Queue a `Shutdown` and give the writer a moment to flush it
pub(crate) async fn close_writer(link: &LinkHandle, writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        link.close().await;
        let _ = writer.await;
    })
    .await;
    if flushed.is_err() {
        abort.abort();
    }
}
