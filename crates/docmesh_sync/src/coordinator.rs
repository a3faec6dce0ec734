//! Replication coordinator.
//!
//! Owns the document/driver tables and runs the protocol between the
//! repo's peers: who gets offered which document (share policy), how a
//! `find` resolves (storage first, then the network), and when a document
//! is declared unavailable (every connected transport ready and every
//! known peer answered without it).
//!
//! The coordinator lives inside the repo's event loop and is driven from a
//! single task, so it keeps plain maps with no locking of its own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, PeerId};
use docmesh_core::network::PeerMetadata;
use docmesh_core::protocol::RepoMessage;
use docmesh_core::share::SharePolicy;

use crate::compactor::StorageCompactor;
use crate::driver::DocSyncDriver;
use crate::handle::{DocHandle, HandleState};

/// Progress of a pending `find`, observable while it resolves.
#[derive(Debug, Clone, PartialEq)]
pub enum FindProgress {
    /// Checking storage and/or waiting on peers.
    Loading { percent: u8 },
    Ready,
    Unavailable,
    Failed(String),
}

/// One caller waiting on a pending `find`.
pub(crate) struct FindWaiter {
    pub allow_unavailable: bool,
    pub cancelled: Arc<AtomicBool>,
    pub progress: watch::Sender<FindProgress>,
    pub reply: oneshot::Sender<Result<DocHandle>>,
}

impl FindWaiter {
    fn resolve(self, result: Result<DocHandle>) {
        if self.cancelled.load(Ordering::Relaxed) {
            let _ = self.reply.send(Err(DocmeshError::Aborted));
            return;
        }
        let _ = self.progress.send(match &result {
            Ok(_) => FindProgress::Ready,
            Err(DocmeshError::DocumentUnavailable(_)) => FindProgress::Unavailable,
            Err(e) => FindProgress::Failed(e.to_string()),
        });
        let _ = self.reply.send(result);
    }

    fn note_progress(&self, progress: FindProgress) {
        if !self.cancelled.load(Ordering::Relaxed) {
            let _ = self.progress.send(progress);
        }
    }
}

#[derive(Default)]
struct PendingFind {
    waiters: Vec<FindWaiter>,
    /// Peers we asked for the document.
    requested_from: HashSet<PeerId>,
    /// Peers that answered `DocUnavailable`.
    unavailable_from: HashSet<PeerId>,
}

pub(crate) struct ReplicationCoordinator {
    local_peer: PeerId,
    share: Arc<dyn SharePolicy>,
    denylist: HashSet<DocumentId>,
    handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
    drivers: HashMap<DocumentId, DocSyncDriver>,
    peers: HashMap<PeerId, PeerMetadata>,
    pending: HashMap<DocumentId, PendingFind>,
    compactor: Option<StorageCompactor>,
    /// Connected transports vs those that reported `Ready`. Unavailability
    /// verdicts wait until every transport has settled.
    total_transports: usize,
    ready_transports: usize,
    changed_tx: mpsc::UnboundedSender<DocumentId>,
    outbox: mpsc::UnboundedSender<RepoMessage>,
}

impl ReplicationCoordinator {
    pub fn new(
        local_peer: PeerId,
        share: Arc<dyn SharePolicy>,
        denylist: HashSet<DocumentId>,
        handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
        compactor: Option<StorageCompactor>,
        changed_tx: mpsc::UnboundedSender<DocumentId>,
        outbox: mpsc::UnboundedSender<RepoMessage>,
    ) -> Self {
        Self {
            local_peer,
            share,
            denylist,
            handles,
            drivers: HashMap::new(),
            peers: HashMap::new(),
            pending: HashMap::new(),
            compactor,
            total_transports: 0,
            ready_transports: 0,
            changed_tx,
            outbox,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn handle_of(&self, id: &DocumentId) -> Option<DocHandle> {
        self.handles.read().unwrap().get(id).cloned()
    }

    pub fn is_denied(&self, id: &DocumentId) -> bool {
        self.denylist.contains(id)
    }

    // ==================== Transports ====================

    pub fn transport_added(&mut self) {
        self.total_transports += 1;
    }

    pub async fn transport_ready(&mut self) {
        self.ready_transports += 1;
        self.settle_pending().await;
    }

    pub fn transport_closed(&mut self) {
        self.total_transports = self.total_transports.saturating_sub(1);
        self.ready_transports = self.ready_transports.saturating_sub(1);
    }

    fn transports_settled(&self) -> bool {
        self.ready_transports >= self.total_transports
    }

    // ==================== Peers ====================

    /// A vetted peer joined: offer it shareable documents and re-issue
    /// requests for finds still in flight.
    pub async fn add_peer(&mut self, peer: PeerId, metadata: PeerMetadata) {
        info!(peer = %peer, "peer connected");
        self.peers.insert(peer.clone(), metadata);

        for driver in self.drivers.values_mut() {
            if driver.handle().state() != HandleState::Ready {
                continue;
            }
            let document_id = driver.handle().document_id();
            if self.share.announce(&peer, Some(&document_id)).await {
                if let Err(e) = driver.begin_sync(&peer) {
                    warn!(document = %document_id, peer = %peer, error = %e, "begin_sync failed");
                }
            }
        }

        let pending_docs: Vec<DocumentId> = self.pending.keys().copied().collect();
        for document_id in pending_docs {
            self.request_from(&peer, document_id);
        }
    }

    /// A peer disconnected: tear down its sync sessions and re-check any
    /// pending finds that were waiting on its answer.
    pub async fn remove_peer(&mut self, peer: &PeerId) {
        info!(peer = %peer, "peer disconnected");
        self.peers.remove(peer);
        for driver in self.drivers.values_mut() {
            driver.end_sync(peer);
        }
        for entry in self.pending.values_mut() {
            entry.requested_from.remove(peer);
            entry.unavailable_from.remove(peer);
        }
        self.settle_pending().await;
    }

    // ==================== Documents ====================

    /// Register a locally created (already `ready`) document and offer it
    /// to every peer the policy allows.
    pub async fn add_document(&mut self, handle: DocHandle) {
        let document_id = handle.document_id();
        let driver = self
            .drivers
            .entry(document_id)
            .or_insert_with(|| DocSyncDriver::new(self.local_peer.clone(), handle, self.outbox.clone()));
        for (peer, _) in self.peers.clone() {
            if self.share.announce(&peer, Some(&document_id)).await {
                if let Err(e) = driver.begin_sync(&peer) {
                    warn!(document = %document_id, peer = %peer, error = %e, "begin_sync failed");
                }
            }
        }
    }

    /// Local edit: push the new state to every tracked peer.
    pub fn document_changed(&mut self, document_id: &DocumentId) {
        if let Some(driver) = self.drivers.get_mut(document_id) {
            if let Err(e) = driver.sync_with_peers() {
                warn!(document = %document_id, error = %e, "sync push failed");
            }
        }
    }

    /// Delete a document locally: terminal handle state, driver gone,
    /// stored chunks removed. Peers holding replicas are not affected.
    pub async fn delete_document(&mut self, document_id: &DocumentId) -> Result<()> {
        self.drivers.remove(document_id);
        if let Some(entry) = self.pending.remove(document_id) {
            for waiter in entry.waiters {
                waiter.resolve(Err(DocmeshError::DocumentDeleted(*document_id)));
            }
        }
        let handle = self.handles.write().unwrap().remove(document_id);
        if let Some(handle) = handle {
            handle.mark_deleted();
        }
        if let Some(compactor) = &self.compactor {
            compactor.remove(document_id).await?;
        }
        Ok(())
    }

    /// Re-run the share policy against the current peer set, opening sync
    /// sessions that became allowed and closing ones that no longer are.
    pub async fn reevaluate_share_policy(&mut self) {
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for driver in self.drivers.values_mut() {
            if driver.handle().state() != HandleState::Ready {
                continue;
            }
            let document_id = driver.handle().document_id();
            for peer in &peers {
                let allowed = self.share.announce(peer, Some(&document_id)).await;
                if allowed && !driver.is_tracking(peer) {
                    if let Err(e) = driver.begin_sync(peer) {
                        warn!(document = %document_id, peer = %peer, error = %e, "begin_sync failed");
                    }
                } else if !allowed && driver.is_tracking(peer) {
                    debug!(document = %document_id, peer = %peer, "share revoked, ending sync");
                    driver.end_sync(peer);
                }
            }
        }
    }

    // ==================== Find ====================

    /// Resolve a document by id: cache, then storage, then the network.
    pub async fn find(&mut self, document_id: DocumentId, waiter: FindWaiter) {
        if self.denylist.contains(&document_id) {
            waiter.resolve(Err(DocmeshError::DocumentUnavailable(document_id)));
            return;
        }

        let existing = self.handle_of(&document_id);
        if let Some(handle) = existing {
            match handle.state() {
                HandleState::Ready => waiter.resolve(Ok(handle)),
                HandleState::Deleted => {
                    waiter.resolve(Err(DocmeshError::DocumentDeleted(document_id)));
                }
                HandleState::Unavailable => {
                    if waiter.allow_unavailable {
                        waiter.resolve(Ok(handle));
                    } else {
                        waiter.resolve(Err(DocmeshError::DocumentUnavailable(document_id)));
                    }
                }
                HandleState::Loading | HandleState::Idle => {
                    // The handle may be loading off the back of a spontaneous
                    // offer that never completes; this find still gets its
                    // own requests out and an unavailability verdict if the
                    // network has nothing.
                    self.pending.entry(document_id).or_default().waiters.push(waiter);
                    let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
                    for peer in peers {
                        self.request_from(&peer, document_id);
                    }
                    self.settle_pending().await;
                }
                HandleState::Unloaded => {
                    handle.begin_reload();
                    self.load_or_request(document_id, handle, waiter).await;
                }
            }
            return;
        }

        let handle = DocHandle::new(document_id, HandleState::Loading, self.changed_tx.clone());
        self.handles
            .write()
            .unwrap()
            .insert(document_id, handle.clone());
        self.drivers.entry(document_id).or_insert_with(|| {
            DocSyncDriver::new(self.local_peer.clone(), handle.clone(), self.outbox.clone())
        });
        self.load_or_request(document_id, handle, waiter).await;
    }

    async fn load_or_request(
        &mut self,
        document_id: DocumentId,
        handle: DocHandle,
        waiter: FindWaiter,
    ) {
        if let Some(compactor) = &self.compactor {
            match compactor.load(&document_id).await {
                Ok(Some(doc)) => {
                    handle.install_loaded(doc);
                    self.add_document(handle.clone()).await;
                    waiter.resolve(Ok(handle));
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(document = %document_id, error = %e, "storage load failed");
                    waiter.resolve(Err(e));
                    return;
                }
            }
        }
        waiter.note_progress(FindProgress::Loading { percent: 50 });

        self.pending.entry(document_id).or_default().waiters.push(waiter);
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.request_from(&peer, document_id);
        }
        self.settle_pending().await;
    }

    fn request_from(&mut self, peer: &PeerId, document_id: DocumentId) {
        let Some(entry) = self.pending.get_mut(&document_id) else {
            return;
        };
        if !entry.requested_from.insert(peer.clone()) {
            return;
        }
        let _ = self.outbox.send(RepoMessage::Request {
            sender_id: self.local_peer.clone(),
            target_id: peer.clone(),
            document_id,
        });
        // Also open the sync session from our side: advertising our (empty)
        // heads lets the peer's protocol state recover even if it believes
        // we already hold the document.
        if let Some(driver) = self.drivers.get_mut(&document_id) {
            if let Err(e) = driver.begin_sync(peer) {
                warn!(document = %document_id, peer = %peer, error = %e, "begin_sync failed");
            }
        }
    }

    // ==================== Incoming messages ====================

    /// Dispatch a sync-protocol message. Ephemeral and gossip messages are
    /// routed elsewhere by the repo loop.
    pub async fn receive_message(&mut self, message: RepoMessage) {
        match message {
            RepoMessage::Sync {
                sender_id,
                document_id,
                data,
                ..
            } => self.receive_sync(sender_id, document_id, data).await,
            RepoMessage::Request {
                sender_id,
                document_id,
                ..
            } => self.receive_request(sender_id, document_id).await,
            RepoMessage::DocUnavailable {
                sender_id,
                document_id,
                ..
            } => {
                if let Some(entry) = self.pending.get_mut(&document_id) {
                    entry.unavailable_from.insert(sender_id);
                }
                self.settle_pending().await;
            }
            other => {
                debug!(kind = ?other, "unexpected message kind at coordinator");
            }
        }
    }

    async fn receive_sync(&mut self, sender: PeerId, document_id: DocumentId, data: Vec<u8>) {
        if self.denylist.contains(&document_id) {
            let _ = self.outbox.send(RepoMessage::DocUnavailable {
                sender_id: self.local_peer.clone(),
                target_id: sender,
                document_id,
            });
            return;
        }

        if !self.drivers.contains_key(&document_id) {
            // First contact with this document: a spontaneous offer from a
            // peer. Seed from storage if we hold older chunks.
            let handle =
                DocHandle::new(document_id, HandleState::Loading, self.changed_tx.clone());
            if let Some(compactor) = &self.compactor {
                if let Ok(Some(doc)) = compactor.load(&document_id).await {
                    handle.install_loaded(doc);
                }
            }
            self.handles
                .write()
                .unwrap()
                .insert(document_id, handle.clone());
            self.drivers.insert(
                document_id,
                DocSyncDriver::new(self.local_peer.clone(), handle, self.outbox.clone()),
            );
        }

        // Unsolicited sync for a document we already hold is an access
        // request in disguise; the policy decides before any reply leaks
        // our state. Documents we are still loading accept sync freely.
        let solicited = self
            .drivers
            .get(&document_id)
            .is_some_and(|d| d.is_tracking(&sender));
        if !solicited {
            let ready = self
                .handle_of(&document_id)
                .is_some_and(|h| h.state() == HandleState::Ready);
            if ready && !self.share.access(&sender, &document_id).await {
                let _ = self.outbox.send(RepoMessage::DocUnavailable {
                    sender_id: self.local_peer.clone(),
                    target_id: sender,
                    document_id,
                });
                return;
            }
        }

        let Some(driver) = self.drivers.get_mut(&document_id) else {
            return;
        };
        match driver.receive_sync_message(&sender, &data) {
            Ok(receipt) => {
                if receipt.changed {
                    if let Err(e) = driver.sync_with_peers() {
                        warn!(document = %document_id, error = %e, "sync broadcast failed");
                    }
                }
                // A document we actively requested is complete once a peer
                // holding it has nothing we lack, even when no heads moved
                // (the document may simply be empty). Peers that answered
                // our request with `doc_unavailable` don't count: their
                // empty sync echo proves nothing about who has the
                // document. Transports deliver per-peer in order, so that
                // answer always lands before the echo.
                let fetched = receipt.caught_up
                    && self
                        .pending
                        .get(&document_id)
                        .is_some_and(|entry| !entry.unavailable_from.contains(&sender));
                if fetched {
                    if let Some(handle) = self.handle_of(&document_id) {
                        handle.note_synced();
                    }
                }
            }
            Err(e) => {
                // Scoped to this (document, peer) pair; everything else
                // proceeds untouched.
                warn!(document = %document_id, peer = %sender, error = %e, "dropping sync message");
                return;
            }
        }

        if let Some(handle) = self.handle_of(&document_id) {
            if handle.state() == HandleState::Ready {
                self.resolve_ready(document_id, handle);
            }
        }
    }

    async fn receive_request(&mut self, sender: PeerId, document_id: DocumentId) {
        if self.denylist.contains(&document_id)
            || !self.share.access(&sender, &document_id).await
        {
            let _ = self.outbox.send(RepoMessage::DocUnavailable {
                sender_id: self.local_peer.clone(),
                target_id: sender,
                document_id,
            });
            return;
        }

        let handle = self.handle_of(&document_id);
        let ready = match handle {
            Some(handle) if handle.state() == HandleState::Ready => Some(handle),
            Some(_) => None,
            None => {
                if let Some(compactor) = &self.compactor {
                    if let Ok(Some(doc)) = compactor.load(&document_id).await {
                        let handle = DocHandle::new(
                            document_id,
                            HandleState::Loading,
                            self.changed_tx.clone(),
                        );
                        handle.install_loaded(doc);
                        self.handles
                            .write()
                            .unwrap()
                            .insert(document_id, handle.clone());
                        Some(handle)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        match ready {
            Some(handle) => {
                let driver = self.drivers.entry(document_id).or_insert_with(|| {
                    DocSyncDriver::new(self.local_peer.clone(), handle, self.outbox.clone())
                });
                if let Err(e) = driver.begin_sync(&sender) {
                    warn!(document = %document_id, peer = %sender, error = %e, "begin_sync failed");
                }
            }
            None => {
                let _ = self.outbox.send(RepoMessage::DocUnavailable {
                    sender_id: self.local_peer.clone(),
                    target_id: sender,
                    document_id,
                });
            }
        }
    }

    // ==================== Pending resolution ====================

    fn resolve_ready(&mut self, document_id: DocumentId, handle: DocHandle) {
        if let Some(entry) = self.pending.remove(&document_id) {
            for waiter in entry.waiters {
                waiter.resolve(Ok(handle.clone()));
            }
        }
    }

    /// Declare pending finds unavailable once the network has settled:
    /// every transport reported ready and every connected peer either
    /// answered `DocUnavailable` or is not expected to answer.
    async fn settle_pending(&mut self) {
        if !self.transports_settled() {
            return;
        }
        let verdicts: Vec<DocumentId> = self
            .pending
            .iter()
            .filter(|(_, entry)| {
                self.peers
                    .keys()
                    .all(|peer| entry.unavailable_from.contains(peer))
            })
            .map(|(id, _)| *id)
            .collect();

        for document_id in verdicts {
            let Some(entry) = self.pending.remove(&document_id) else {
                continue;
            };
            let handle = self.handle_of(&document_id);
            if let Some(handle) = &handle {
                handle.set_unavailable();
            }
            info!(document = %document_id, "document unavailable");
            for waiter in entry.waiters {
                match (&handle, waiter.allow_unavailable) {
                    (Some(handle), true) => waiter.resolve(Ok(handle.clone())),
                    _ => waiter.resolve(Err(DocmeshError::DocumentUnavailable(document_id))),
                }
            }
        }
    }
}
