//! Peer synchronization
//!
//! A single actor task owns every link, inbound or outbound. When a link
//! joins, each side sends its version vector and the other answers with the
//! updates it lacks. Updates that land are flooded to every other link; a
//! duplicate lands nothing, so the flood stops on its own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use huddle_core::{
    lock, Committed, ReplicaId, RoomId, SharedReplica, Update, UpdateId, VersionVector,
};
use huddle_net::{
    Blob, Client, Error as NetError, Identity, LinkHandle, LinkId, Message, PeerEvent, PeerUrl,
    Server, SYNC_BATCH_BUDGET,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AppResult;

/// Backoff delays for redialing: 1s, 2s, 5s, 10s, 30s (capped)
const RECONNECT_DELAYS_MS: &[u64] = &[1000, 2000, 5000, 10000, 30000];

const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Accept inbound links on this port (0 picks a free one)
    pub listen_port: Option<u16>,
    /// Peers to keep dialing
    pub peers: Vec<PeerUrl>,
    pub secret: Option<String>,
}

/// Running peer sync for one replica
pub struct PeerSync {
    server: Option<Server>,
    shutdown: watch::Sender<bool>,
    actor: JoinHandle<()>,
    dialers: Vec<JoinHandle<()>>,
}

impl PeerSync {
    pub async fn start(replica: SharedReplica, options: SyncOptions) -> AppResult<Self> {
        let identity = {
            let r = lock(&replica);
            Identity {
                room: r.room().to_string(),
                replica_id: r.id(),
                secret: options.secret.clone(),
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();
        lock(&replica).add_sink(move |committed: &Committed| {
            gossip_tx.send(committed.update.clone()).is_ok()
        });

        let server = match options.listen_port {
            Some(port) => Some(Server::start(port, identity.clone(), events_tx.clone()).await?),
            None => None,
        };

        let mut dialers = Vec::new();
        for url in options.peers {
            if !url.room.is_empty() && RoomId::from_path(&url.room).as_str() != identity.room {
                warn!(peer = %url, room = %identity.room, "Peer URL names another room, skipping");
                continue;
            }
            dialers.push(tokio::spawn(dial_loop(
                url,
                identity.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            )));
        }

        let actor = SyncActor {
            replica,
            links: HashMap::new(),
            arrived_on: HashMap::new(),
            events: events_rx,
            gossip: gossip_rx,
            shutdown: shutdown_rx,
        };
        let actor = tokio::spawn(actor.run());

        info!(
            room = %identity.room,
            replica = %identity.replica_id,
            listening = server.is_some(),
            dialing = dialers.len(),
            "Peer sync started"
        );

        Ok(Self {
            server,
            shutdown,
            actor,
            dialers,
        })
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(Server::addr)
    }

    /// Close every link and stop dialing
    pub async fn shutdown(self) -> AppResult<()> {
        let _ = self.shutdown.send(true);
        if let Some(server) = &self.server {
            server.shutdown();
        }
        for dialer in self.dialers {
            dialer.await?;
        }
        self.actor.await?;
        Ok(())
    }
}

struct SyncActor {
    replica: SharedReplica,
    links: HashMap<LinkId, LinkHandle>,
    /// Link a remote update arrived on, until it has been flooded
    arrived_on: HashMap<UpdateId, LinkId>,
    events: mpsc::Receiver<PeerEvent>,
    gossip: mpsc::UnboundedReceiver<Arc<Update>>,
    shutdown: watch::Receiver<bool>,
}

impl SyncActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(update) = self.gossip.recv() => self.flood(update).await,
                _ = self.shutdown.changed() => break,
            }
        }

        for link in self.links.values() {
            link.close().await;
        }
        info!("Sync actor stopped");
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Joined(link) => {
                info!(
                    link = %link.id,
                    replica = %link.replica_id(),
                    direction = ?link.direction,
                    "Peer linked"
                );
                let state = lock(&self.replica).version().encode();
                match state {
                    Ok(state) => {
                        let request = Message::SyncRequest { state: Blob(state) };
                        if link.send(request).await.is_err() {
                            debug!(link = %link.id, "Link closed before sync request");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode version vector"),
                }
                self.links.insert(link.id, link);
            }
            PeerEvent::Update { link, from, blob } => self.apply(link, from, &blob),
            PeerEvent::SyncRequest { link, from, state } => {
                self.answer_sync(link, from, &state).await
            }
            PeerEvent::SyncBatch { link, from, blobs } => {
                debug!(link = %link, count = blobs.len(), "Sync batch received");
                for blob in &blobs {
                    self.apply(link, from, blob);
                }
            }
            PeerEvent::Left { link, replica_id } => {
                self.links.remove(&link);
                info!(link = %link, replica = %replica_id, "Peer unlinked");
            }
        }
    }

    /// Merge a blob from a peer, remembering where whatever landed came from
    fn apply(&mut self, link: LinkId, from: ReplicaId, blob: &Blob) {
        let landed = lock(&self.replica).apply_remote_blob(blob.as_bytes(), Some(from));
        match landed {
            Ok(ids) => {
                for id in ids {
                    self.arrived_on.insert(id, link);
                }
            }
            Err(e) => warn!(link = %link, error = %e, "Discarding undecodable update"),
        }
    }

    /// Send a peer every update its version vector does not cover
    async fn answer_sync(&self, link_id: LinkId, from: ReplicaId, state: &Blob) {
        let Some(link) = self.links.get(&link_id) else {
            debug!(link = %link_id, "Sync request from unknown link");
            return;
        };

        let version = match VersionVector::decode(state.as_bytes()) {
            Ok(version) => version,
            Err(e) => {
                warn!(link = %link_id, error = %e, "Invalid sync request");
                return;
            }
        };

        let blobs: Vec<Blob> = {
            let replica = lock(&self.replica);
            replica
                .updates_since(&version)
                .iter()
                .filter_map(|update| wire_blob(update))
                .collect()
        };

        debug!(link = %link_id, replica = %from, count = blobs.len(), "Answering sync request");
        for batch in Message::sync_batches(blobs, SYNC_BATCH_BUDGET) {
            if link.send(batch).await.is_err() {
                debug!(link = %link_id, "Link closed during sync");
                break;
            }
        }
    }

    /// Forward a newly landed update to every link except its source
    async fn flood(&mut self, update: Arc<Update>) {
        let source = self.arrived_on.remove(&update.id);
        let targets: Vec<&LinkHandle> = self
            .links
            .values()
            .filter(|link| Some(link.id) != source && link.replica_id() != update.id.replica)
            .collect();
        if targets.is_empty() {
            return;
        }

        let Some(blob) = wire_blob(&update) else {
            return;
        };

        for link in targets {
            let msg = Message::Update { blob: blob.clone() };
            if link.send(msg).await.is_err() {
                debug!(link = %link.id, "Link closed before update was queued");
            }
        }
    }
}

/// Encode an update for the wire, leaving out any that cannot fit in a frame
fn wire_blob(update: &Update) -> Option<Blob> {
    let blob = match update.encode() {
        Ok(bytes) => Blob(bytes),
        Err(e) => {
            warn!(update = %update.id, error = %e, "Failed to encode update");
            return None;
        }
    };
    if !blob.fits_frame() {
        warn!(
            update = %update.id,
            bytes = blob.as_bytes().len(),
            "Update too large to send, skipping"
        );
        return None;
    }
    Some(blob)
}

/// Keep a link to `url` up until shutdown, redialing with backoff
async fn dial_loop(
    url: PeerUrl,
    identity: Identity,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = url.address();
    let mut attempt = 0usize;

    loop {
        if *shutdown.borrow() {
            return;
        }

        debug!(peer = %url, attempt = attempt + 1, "Dialing peer");
        let connected = tokio::select! {
            result = Client::connect(&addr, &identity, events.clone()) => result,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok(client) => {
                attempt = 0;
                tokio::select! {
                    _ = client.closed() => info!(peer = %url, "Link lost"),
                    _ = shutdown.changed() => {
                        client.disconnect().await;
                        client.closed().await;
                        return;
                    }
                }
            }
            Err(NetError::Rejected(reason)) => {
                warn!(peer = %url, reason = %reason, "Peer rejected link")
            }
            Err(e) => warn!(peer = %url, error = %e, "Dial failed"),
        }

        let delay_ms = RECONNECT_DELAYS_MS[attempt.min(RECONNECT_DELAYS_MS.len() - 1)];
        attempt += 1;
        debug!(peer = %url, delay_ms = delay_ms, "Reconnect backoff");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{PersonRecord, Replica, SystemClock};
    use std::sync::Mutex;

    fn replica(room: &str) -> SharedReplica {
        Arc::new(Mutex::new(Replica::new(
            ReplicaId::new_v4(),
            RoomId::from(room),
            Arc::new(SystemClock),
        )))
    }

    fn names(replica: &SharedReplica) -> Vec<String> {
        let mut names: Vec<String> = lock(replica)
            .project()
            .people
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        names
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("replicas did not converge");
    }

    async fn listen(replica: &SharedReplica) -> (PeerSync, u16) {
        let options = SyncOptions {
            listen_port: Some(0),
            ..SyncOptions::default()
        };
        let sync = PeerSync::start(replica.clone(), options).await.unwrap();
        let port = sync.listen_addr().unwrap().port();
        (sync, port)
    }

    async fn dial(replica: &SharedReplica, port: u16) -> PeerSync {
        let options = SyncOptions {
            peers: vec![PeerUrl::new("127.0.0.1", port, "standup")],
            ..SyncOptions::default()
        };
        PeerSync::start(replica.clone(), options).await.unwrap()
    }

    #[tokio::test]
    async fn test_offline_edits_reconcile_on_link() {
        let a = replica("standup");
        let b = replica("standup");

        // Both sides edit before any link exists
        lock(&a).add("Ana").unwrap();
        lock(&b).add("Bo").unwrap();

        let (sync_a, port) = listen(&a).await;
        let sync_b = dial(&b, port).await;

        let expected = vec!["Ana".to_string(), "Bo".to_string()];
        wait_until(|| names(&a) == expected && names(&b) == expected).await;

        // Live edits flow after reconciliation
        let first = lock(&a).advance().unwrap();
        assert!(first.is_some());
        wait_until(|| lock(&b).project().in_progress.map(|s| s.name) == first).await;

        assert_eq!(lock(&a).project().on_deck, lock(&b).project().on_deck);

        sync_b.shutdown().await.unwrap();
        sync_a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_flood_through_hub() {
        let hub = replica("standup");
        let left = replica("standup");
        let right = replica("standup");

        let (sync_hub, port) = listen(&hub).await;
        let sync_left = dial(&left, port).await;
        let sync_right = dial(&right, port).await;

        lock(&left).add("Ana").unwrap();
        wait_until(|| names(&right) == vec!["Ana".to_string()]).await;

        lock(&right).add("Bo").unwrap();
        let expected = vec!["Ana".to_string(), "Bo".to_string()];
        wait_until(|| names(&hub) == expected && names(&left) == expected).await;

        let (l, r) = (lock(&left).version().clone(), lock(&right).version().clone());
        assert_eq!(l, r);

        sync_left.shutdown().await.unwrap();
        sync_right.shutdown().await.unwrap();
        sync_hub.shutdown().await.unwrap();
    }

    #[test]
    fn test_oversized_update_not_sent() {
        let replica = replica("standup");
        let mut r = lock(&replica);
        r.add("Ana").unwrap();
        let huge = "x".repeat(2 * 1024 * 1024);
        r.transact(|tx| tx.set_person(&PersonRecord::new(huge.clone())))
            .unwrap();

        let updates = r.updates_since(&VersionVector::new());
        assert_eq!(updates.len(), 2);
        assert!(wire_blob(&updates[0]).is_some());
        assert!(wire_blob(&updates[1]).is_none());
    }

    #[tokio::test]
    async fn test_other_room_peer_skipped() {
        let a = replica("standup");
        let options = SyncOptions {
            peers: vec![PeerUrl::new("127.0.0.1", 1, "retro")],
            ..SyncOptions::default()
        };
        let sync = PeerSync::start(a, options).await.unwrap();
        assert!(sync.dialers.is_empty());
        sync.shutdown().await.unwrap();
    }
}
