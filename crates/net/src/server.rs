//! TCP listener accepting peers into a room
//!
//! Every node that listens runs one of these. Accepted connections become
//! inbound links; their traffic is reported as [`PeerEvent`]s on the
//! channel handed to [`Server::start`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::link::{
    close_writer, dispatch, writer_task, Direction, Flow, Identity, LinkHandle, LinkId,
    PeerEvent, HANDSHAKE_TIMEOUT, LINK_DEAD_TIMEOUT, LINK_QUEUE,
};
use crate::protocol::{Message, PeerInfo};

/// Maximum number of inbound links
const MAX_PEERS: usize = 32;

/// Heartbeat interval in milliseconds
const HEARTBEAT_INTERVAL_MS: u64 = 2000;

struct Link {
    peer: PeerInfo,
    tx: mpsc::Sender<Message>,
}

/// Server state shared across tasks
struct ServerState {
    identity: Identity,
    links: HashMap<LinkId, Link>,
}

impl ServerState {
    fn peer_list(&self, except: Option<LinkId>) -> Vec<PeerInfo> {
        self.links
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .map(|(_, link)| link.peer.clone())
            .collect()
    }
}

/// Listener handle
pub struct Server {
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Start listening on the given port (0 picks a free one)
    pub async fn start(
        port: u16,
        identity: Identity,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, room = %identity.room, "Server started");

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            identity,
            links: HashMap::new(),
        }));

        let state_clone = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(
            listener,
            state_clone,
            events,
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        let state_clone = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(heartbeat_task(state_clone, shutdown_rx));

        Ok(Server {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the server's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Peers currently linked in
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.state.read().await.peer_list(None)
    }

    /// Stop accepting and close every inbound link
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<ServerState>>,
    events: mpsc::Sender<PeerEvent>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(
                            stream,
                            addr,
                            state.clone(),
                            events.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single inbound connection
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RwLock<ServerState>>,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (link, rx) = match handle_hello(&mut reader, &state).await {
        Ok(admitted) => admitted,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            let reason = match e {
                Error::Rejected(reason) => reason,
                other => other.to_string(),
            };
            let _ = write_frame(&mut writer, &Message::Rejected { reason }).await;
            return;
        }
    };

    info!(addr = %addr, link = %link.id, replica = %link.replica_id(), "Peer joined");

    let writer_handle = tokio::spawn(writer_task(writer, rx));

    if events.send(PeerEvent::Joined(link.clone())).await.is_err() {
        debug!("Event receiver dropped, closing link");
    } else {
        let peers = state.read().await.peer_list(None);
        broadcast_to_links(&state, Message::PeerList { peers }, Some(link.id)).await;
        read_loop(&mut reader, &link, &events, &mut shutdown_rx).await;
    }

    // Cleanup
    state.write().await.links.remove(&link.id);
    close_writer(&link, writer_handle).await;
    let _ = events
        .send(PeerEvent::Left {
            link: link.id,
            replica_id: link.replica_id(),
        })
        .await;
    broadcast_to_links(
        &state,
        Message::PeerLeft {
            replica_id: link.replica_id(),
        },
        None,
    )
    .await;

    info!(link = %link.id, "Peer disconnected");
}

async fn read_loop(
    reader: &mut ReadHalf<TcpStream>,
    link: &LinkHandle,
    events: &mpsc::Sender<PeerEvent>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = tokio::time::timeout(LINK_DEAD_TIMEOUT, read_frame(reader)) => {
                match result {
                    Ok(Ok(msg)) => {
                        if dispatch(msg, link, events).await == Flow::Close {
                            break;
                        }
                    }
                    Ok(Err(Error::ConnectionClosed)) => {
                        debug!(link = %link.id, "Connection closed");
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(link = %link.id, error = %e, "Read error");
                        break;
                    }
                    Err(_) => {
                        warn!(link = %link.id, "Peer went silent");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(link = %link.id, "Closing link for shutdown");
                break;
            }
        }
    }
}

/// Read and validate the dialer's Hello, registering the link on success
async fn handle_hello(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<ServerState>>,
) -> Result<(LinkHandle, mpsc::Receiver<Message>)> {
    let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| Error::Timeout("waiting for Hello".into()))??;

    match msg {
        Message::Hello {
            room,
            replica_id,
            secret,
        } => {
            let mut s = state.write().await;

            if room != s.identity.room {
                return Err(Error::Rejected("Wrong room".into()));
            }

            if s.identity.secret.is_some() && secret != s.identity.secret {
                return Err(Error::Rejected("Invalid secret".into()));
            }

            if replica_id == s.identity.replica_id {
                return Err(Error::Rejected("Cannot link to self".into()));
            }

            if s.links.len() >= MAX_PEERS {
                return Err(Error::ServerFull);
            }

            if s.links.values().any(|l| l.peer.replica_id == replica_id) {
                return Err(Error::Rejected("Already connected".into()));
            }

            let peer = PeerInfo { replica_id, room };
            let (tx, rx) = mpsc::channel(LINK_QUEUE);

            // Queued under the write lock so Welcome precedes any broadcast
            let welcome = Message::Welcome {
                room: s.identity.room.clone(),
                replica_id: s.identity.replica_id,
                peers: s.peer_list(None),
            };
            tx.try_send(welcome)
                .map_err(|_| Error::Protocol("Link queue unavailable".into()))?;

            let link = LinkHandle::new(peer.clone(), Direction::Inbound, tx.clone());
            s.links.insert(link.id, Link { peer, tx });

            Ok((link, rx))
        }
        _ => Err(Error::Protocol("Expected Hello".into())),
    }
}

/// Broadcast to all links, optionally excluding one
async fn broadcast_to_links(
    state: &Arc<RwLock<ServerState>>,
    msg: Message,
    except: Option<LinkId>,
) {
    let s = state.read().await;
    for (id, link) in &s.links {
        if except != Some(*id) {
            let _ = link.tx.send(msg.clone()).await;
        }
    }
}

/// Heartbeat task - sends heartbeats to all links every 2s
async fn heartbeat_task(state: Arc<RwLock<ServerState>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = Duration::from_millis(HEARTBEAT_INTERVAL_MS);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let heartbeat = Message::Heartbeat { timestamp: Utc::now() };
                broadcast_to_links(&state, heartbeat, None).await;
            }
            _ = shutdown_rx.recv() => {
                debug!("Heartbeat task shutting down");
                break;
            }
        }
    }
}
