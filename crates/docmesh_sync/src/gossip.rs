//! Remote-heads gossip.
//!
//! Lets a repo observe how far *other* replicas (identified by their
//! durable [`StorageId`], not their per-connection peer id) have caught up
//! on a document. Subscribed peers receive a `RemoteHeadsChanged` message
//! whenever our heads advance, rate-limited per document; received
//! announcements update per-handle bookkeeping and are forwarded to
//! interested third parties, so awareness flows across peers that are not
//! directly connected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use automerge::ChangeHash;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, PeerId, StorageId};
use docmesh_core::protocol::{RemoteHeads, RepoMessage};

use crate::handle::DocHandle;

/// A remote replica's observed heads, delivered to local subscribers.
#[derive(Debug, Clone)]
pub struct RemoteHeadsEvent {
    pub document_id: DocumentId,
    pub storage_id: StorageId,
    pub heads: RemoteHeads,
}

#[derive(Default)]
struct GossipState {
    /// Peers that get every announcement, subscription or not.
    generous_peers: HashSet<PeerId>,
    /// Which peers asked to hear about which storage identities.
    subscriptions: HashMap<StorageId, HashSet<PeerId>>,
    /// Storage identities this repo wants announcements about.
    local_interest: HashSet<StorageId>,
    last_sent: HashMap<DocumentId, Instant>,
    /// Heads suppressed by the rate limit, re-announced once the interval
    /// elapses so the final state of a burst always goes out.
    deferred: HashMap<DocumentId, Vec<String>>,
}

#[derive(Clone)]
pub struct RemoteHeadsGossip {
    local_peer: PeerId,
    local_storage_id: StorageId,
    min_interval: Duration,
    state: Arc<Mutex<GossipState>>,
    outbox: mpsc::UnboundedSender<RepoMessage>,
    events: broadcast::Sender<RemoteHeadsEvent>,
}

impl RemoteHeadsGossip {
    pub fn new(
        local_peer: PeerId,
        local_storage_id: StorageId,
        min_interval: Duration,
        outbox: mpsc::UnboundedSender<RepoMessage>,
        events: broadcast::Sender<RemoteHeadsEvent>,
    ) -> Self {
        Self {
            local_peer,
            local_storage_id,
            min_interval,
            state: Arc::new(Mutex::new(GossipState::default())),
            outbox,
            events,
        }
    }

    /// Always announce our heads to `peer`, whether or not it subscribed.
    pub fn add_generous_peer(&self, peer: PeerId) {
        self.state.lock().unwrap().generous_peers.insert(peer);
    }

    /// Register interest in `storage_ids` and tell `peers` about it.
    pub fn subscribe_to_remotes(
        &self,
        storage_ids: Vec<StorageId>,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .local_interest
            .extend(storage_ids.iter().cloned());
        for peer in peers {
            self.send(RepoMessage::RemoteSubscriptionChange {
                sender_id: self.local_peer.clone(),
                target_id: peer,
                add: storage_ids.clone(),
                remove: Vec::new(),
            })?;
        }
        Ok(())
    }

    /// Tell a newly connected peer what we are interested in.
    pub fn announce_interest_to(&self, peer: PeerId) -> Result<()> {
        let add: Vec<StorageId> = {
            let state = self.state.lock().unwrap();
            if state.local_interest.is_empty() {
                return Ok(());
            }
            state.local_interest.iter().cloned().collect()
        };
        self.send(RepoMessage::RemoteSubscriptionChange {
            sender_id: self.local_peer.clone(),
            target_id: peer,
            add,
            remove: Vec::new(),
        })
    }

    /// A peer changed which storage identities it wants to hear about.
    pub fn handle_subscription_change(
        &self,
        sender: &PeerId,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    ) {
        let mut state = self.state.lock().unwrap();
        for storage_id in add {
            state
                .subscriptions
                .entry(storage_id)
                .or_default()
                .insert(sender.clone());
        }
        for storage_id in remove {
            if let Some(peers) = state.subscriptions.get_mut(&storage_id) {
                peers.remove(sender);
                if peers.is_empty() {
                    state.subscriptions.remove(&storage_id);
                }
            }
        }
    }

    /// Announce our advanced heads for one document.
    ///
    /// Rate-limited per document: an announcement within `min_interval` of
    /// the previous one is deferred and goes out once the interval elapses,
    /// carrying the latest heads at that point. Sync itself is unaffected,
    /// only the gossip is coalesced.
    pub fn note_local_heads_changed(
        &self,
        document_id: DocumentId,
        heads: &[ChangeHash],
    ) -> Result<()> {
        let encoded: Vec<String> = heads.iter().map(ChangeHash::to_string).collect();
        {
            let mut state = self.state.lock().unwrap();
            let last = state.last_sent.get(&document_id).copied();
            if let Some(last) = last {
                let elapsed = last.elapsed();
                if elapsed < self.min_interval {
                    trace!(document = %document_id, "gossip rate-limited, deferring");
                    let arm_timer = !state.deferred.contains_key(&document_id);
                    state.deferred.insert(document_id, encoded);
                    if arm_timer {
                        let gossip = self.clone();
                        let delay = self.min_interval - elapsed;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = gossip.flush_deferred(document_id) {
                                debug!(document = %document_id, error = %e, "deferred gossip failed");
                            }
                        });
                    }
                    return Ok(());
                }
            }
        }
        self.announce(document_id, encoded)
    }

    fn flush_deferred(&self, document_id: DocumentId) -> Result<()> {
        let heads = self.state.lock().unwrap().deferred.remove(&document_id);
        match heads {
            Some(heads) => self.announce(document_id, heads),
            None => Ok(()),
        }
    }

    fn announce(&self, document_id: DocumentId, heads: Vec<String>) -> Result<()> {
        let recipients: HashSet<PeerId> = {
            let mut state = self.state.lock().unwrap();
            let recipients: HashSet<PeerId> = state
                .subscriptions
                .get(&self.local_storage_id)
                .into_iter()
                .flatten()
                .chain(state.generous_peers.iter())
                .cloned()
                .collect();
            if recipients.is_empty() {
                return Ok(());
            }
            state.last_sent.insert(document_id, Instant::now());
            recipients
        };

        let announcement = RemoteHeads {
            heads,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let new_heads: HashMap<StorageId, RemoteHeads> =
            HashMap::from([(self.local_storage_id.clone(), announcement)]);
        for peer in recipients {
            self.send(RepoMessage::RemoteHeadsChanged {
                sender_id: self.local_peer.clone(),
                target_id: peer,
                document_id,
                new_heads: new_heads.clone(),
            })?;
        }
        Ok(())
    }

    /// Process a received heads announcement.
    ///
    /// Updates the handle's per-replica bookkeeping, forwards the
    /// announcement to other subscribed peers (never back to the sender),
    /// and emits local events for storage identities we registered
    /// interest in.
    pub fn handle_remote_heads_changed(
        &self,
        sender: &PeerId,
        document_id: DocumentId,
        new_heads: HashMap<StorageId, RemoteHeads>,
        handle: Option<&DocHandle>,
    ) -> Result<()> {
        let forward_to: HashSet<PeerId> = {
            let state = self.state.lock().unwrap();
            for (storage_id, heads) in &new_heads {
                if let Some(handle) = handle {
                    handle.set_remote_heads(storage_id.clone(), heads.clone());
                }
                if state.local_interest.contains(storage_id) {
                    let _ = self.events.send(RemoteHeadsEvent {
                        document_id,
                        storage_id: storage_id.clone(),
                        heads: heads.clone(),
                    });
                }
            }
            new_heads
                .keys()
                .filter_map(|storage_id| state.subscriptions.get(storage_id))
                .flatten()
                .filter(|peer| *peer != sender)
                .cloned()
                .collect()
        };
        for peer in forward_to {
            debug!(document = %document_id, peer = %peer, "forwarding remote heads");
            self.send(RepoMessage::RemoteHeadsChanged {
                sender_id: self.local_peer.clone(),
                target_id: peer,
                document_id,
                new_heads: new_heads.clone(),
            })?;
        }
        Ok(())
    }

    /// Drop every trace of a disconnected peer.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.generous_peers.remove(peer);
        state.subscriptions.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }

    fn send(&self, message: RepoMessage) -> Result<()> {
        self.outbox
            .send(message)
            .map_err(|_| DocmeshError::Network("outbox closed".to_string()))
    }
}
