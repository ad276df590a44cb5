//! Outbound links to another node's listener

use std::time::{Duration, Instant};

use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::link::{
    close_writer, dispatch, writer_task, Direction, Flow, Identity, LinkHandle, PeerEvent,
    HANDSHAKE_TIMEOUT, LINK_DEAD_TIMEOUT, LINK_QUEUE,
};
use crate::protocol::{Message, PeerInfo};

/// How often the watchdog checks for silence and pings the listener
const WATCHDOG_INTERVAL_MS: u64 = 1000;

/// Handle to an established outbound link
pub struct Client {
    link: LinkHandle,
    peers: Vec<PeerInfo>,
    closed: watch::Receiver<bool>,
}

impl Client {
    /// Dial `addr` (`host:port`) and complete the handshake.
    ///
    /// On success a `Joined` event has already been sent on `events`, and
    /// the link runs in the background until either side closes it.
    pub async fn connect(
        addr: &str,
        identity: &Identity,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self> {
        info!(addr = %addr, room = %identity.room, "Connecting to peer");

        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", addr)))??;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let hello = Message::Hello {
            room: identity.room.clone(),
            replica_id: identity.replica_id,
            secret: identity.secret.clone(),
        };
        write_frame(&mut writer, &hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| Error::Timeout("waiting for Welcome".into()))??;

        let (peer, peers) = match reply {
            Message::Welcome {
                room,
                replica_id,
                peers,
            } => {
                if room != identity.room {
                    return Err(Error::Protocol(format!("Welcomed into wrong room {}", room)));
                }
                (PeerInfo { replica_id, room }, peers)
            }
            Message::Rejected { reason } => {
                warn!(reason = %reason, "Link rejected");
                return Err(Error::Rejected(reason));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Expected Welcome, got {:?}",
                    other
                )))
            }
        };

        let (tx, rx) = mpsc::channel(LINK_QUEUE);
        let link = LinkHandle::new(peer, Direction::Outbound, tx);

        events
            .send(PeerEvent::Joined(link.clone()))
            .await
            .map_err(|_| Error::NotConnected)?;

        info!(link = %link.id, replica = %link.replica_id(), "Linked to peer");

        let (closed_tx, closed_rx) = watch::channel(false);
        let writer_handle = tokio::spawn(writer_task(writer, rx));
        tokio::spawn(connection_task(
            reader,
            writer_handle,
            link.clone(),
            events,
            closed_tx,
        ));

        Ok(Client {
            link,
            peers,
            closed: closed_rx,
        })
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.link.peer
    }

    /// Other peers the listener had at handshake time
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the link is gone
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the link gracefully
    pub async fn disconnect(&self) {
        self.link.close().await;
    }
}

/// Reads frames off the socket.
///
/// Runs on its own task because `read_frame` must not be cancelled mid-frame.
async fn reader_task(mut reader: ReadHalf<TcpStream>, tx: mpsc::Sender<Result<Message>>) {
    loop {
        let result = read_frame(&mut reader).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// Main link task
async fn connection_task(
    reader: ReadHalf<TcpStream>,
    mut writer_handle: tokio::task::JoinHandle<()>,
    link: LinkHandle,
    events: mpsc::Sender<PeerEvent>,
    closed_tx: watch::Sender<bool>,
) {
    let (incoming_tx, mut incoming) = mpsc::channel(LINK_QUEUE);
    let reader_handle = tokio::spawn(reader_task(reader, incoming_tx));

    let mut watchdog = tokio::time::interval(Duration::from_millis(WATCHDOG_INTERVAL_MS));
    let mut last_heard = Instant::now();
    let mut writer_done = false;

    loop {
        tokio::select! {
            result = incoming.recv() => {
                match result {
                    Some(Ok(msg)) => {
                        last_heard = Instant::now();
                        if dispatch(msg, &link, &events).await == Flow::Close {
                            break;
                        }
                    }
                    Some(Err(Error::ConnectionClosed)) | None => {
                        debug!(link = %link.id, "Peer closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(link = %link.id, error = %e, "Read error");
                        break;
                    }
                }
            }

            _ = watchdog.tick() => {
                let elapsed = last_heard.elapsed();
                if elapsed > LINK_DEAD_TIMEOUT {
                    warn!(
                        link = %link.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Peer appears dead"
                    );
                    break;
                }
                let _ = link.send(Message::Ping).await;
            }

            _ = &mut writer_handle => {
                debug!(link = %link.id, "Writer finished");
                writer_done = true;
                break;
            }
        }
    }

    reader_handle.abort();
    if !writer_done {
        close_writer(&link, writer_handle).await;
    }

    let _ = events
        .send(PeerEvent::Left {
            link: link.id,
            replica_id: link.replica_id(),
        })
        .await;
    let _ = closed_tx.send(true);

    info!(link = %link.id, "Link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Blob;
    use crate::server::Server;
    use uuid::Uuid;

    fn identity(secret: Option<&str>) -> Identity {
        Identity {
            room: "standup".into(),
            replica_id: Uuid::new_v4(),
            secret: secret.map(String::from),
        }
    }

    async fn next_joined(rx: &mut mpsc::Receiver<PeerEvent>) -> LinkHandle {
        loop {
            if let PeerEvent::Joined(link) = rx.recv().await.unwrap() {
                return link;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_exchange_updates() {
        let (server_events, mut server_rx) = mpsc::channel(16);
        let host = identity(None);
        let server = Server::start(0, host.clone(), server_events).await.unwrap();
        let addr = format!("127.0.0.1:{}", server.addr().port());

        let (client_events, mut client_rx) = mpsc::channel(16);
        let guest = identity(None);
        let client = Client::connect(&addr, &guest, client_events).await.unwrap();
        assert_eq!(client.peer().replica_id, host.replica_id);
        assert!(client.peers().is_empty());

        let outbound = next_joined(&mut client_rx).await;
        assert_eq!(outbound.direction, Direction::Outbound);
        let inbound = next_joined(&mut server_rx).await;
        assert_eq!(inbound.replica_id(), guest.replica_id);

        inbound
            .send(Message::Update {
                blob: Blob(vec![9]),
            })
            .await
            .unwrap();

        loop {
            match client_rx.recv().await.unwrap() {
                PeerEvent::Update { from, blob, .. } => {
                    assert_eq!(from, host.replica_id);
                    assert_eq!(blob, Blob(vec![9]));
                    break;
                }
                PeerEvent::Left { .. } => panic!("link dropped"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_with_wrong_secret() {
        let (server_events, _server_rx) = mpsc::channel(16);
        let server = Server::start(0, identity(Some("s3cret")), server_events)
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", server.addr().port());

        let (client_events, _client_rx) = mpsc::channel(16);
        let result = Client::connect(&addr, &identity(Some("nope")), client_events).await;
        assert!(matches!(result, Err(Error::Rejected(_))));
    }

    #[tokio::test]
    async fn test_disconnect_reaches_both_sides() {
        let (server_events, mut server_rx) = mpsc::channel(16);
        let server = Server::start(0, identity(None), server_events)
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", server.addr().port());

        let (client_events, _client_rx) = mpsc::channel(16);
        let guest = identity(None);
        let client = Client::connect(&addr, &guest, client_events).await.unwrap();
        next_joined(&mut server_rx).await;

        client.disconnect().await;
        client.closed().await;
        assert!(client.is_closed());

        loop {
            if let PeerEvent::Left { replica_id, .. } = server_rx.recv().await.unwrap() {
                assert_eq!(replica_id, guest.replica_id);
                break;
            }
        }
    }
}
