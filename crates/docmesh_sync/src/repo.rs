//! Repo facade and event loop.
//!
//! A [`Repo`] is the single entry point: it owns the handle cache, spawns
//! the event loop task, and exposes async operations that post commands to
//! it. The loop is the only task that touches the coordinator, gossip, and
//! network adapters, so the whole engine runs cooperatively without locks
//! on its hot path.
//!
//! # Responsibilities
//!
//! - surface `create` / `find` / `delete` / `flush` to callers
//! - pump network adapter events into the coordinator
//! - route outbound messages to the adapter that owns the target peer
//! - debounce persistence through the [`StorageCompactor`]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, PeerId, StorageId};
use docmesh_core::network::{NetworkAdapter, NetworkEvent};
use docmesh_core::protocol::RepoMessage;
use docmesh_core::share::{ShareAll, SharePolicy};
use docmesh_core::storage::StorageAdapter;

use crate::compactor::{CompactionPolicy, StorageCompactor};
use crate::coordinator::{FindProgress, FindWaiter, ReplicationCoordinator};
use crate::ephemeral::{EphemeralChannel, EphemeralEvent};
use crate::gossip::{RemoteHeadsEvent, RemoteHeadsGossip};
use crate::handle::{DocHandle, HandleState};

// ==================== Configuration ====================

/// Builder-style configuration for a [`Repo`].
pub struct RepoConfig {
    peer_id: PeerId,
    storage: Option<Arc<dyn StorageAdapter>>,
    storage_id: Option<StorageId>,
    share: Arc<dyn SharePolicy>,
    denylist: HashSet<DocumentId>,
    compaction: CompactionPolicy,
    enable_gossip: bool,
    gossip_min_interval: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::random(),
            storage: None,
            storage_id: None,
            share: Arc::new(ShareAll),
            denylist: HashSet::new(),
            compaction: CompactionPolicy::default(),
            enable_gossip: false,
            gossip_min_interval: Duration::from_millis(500),
        }
    }
}

impl RepoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    /// Attach a storage backend and the durable identity it represents.
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>, storage_id: StorageId) -> Self {
        self.storage = Some(storage);
        self.storage_id = Some(storage_id);
        self
    }

    pub fn with_share_policy(mut self, share: Arc<dyn SharePolicy>) -> Self {
        self.share = share;
        self
    }

    /// Never load, sync, or serve the given document.
    pub fn deny(mut self, document_id: DocumentId) -> Self {
        self.denylist.insert(document_id);
        self
    }

    pub fn with_compaction(mut self, policy: CompactionPolicy) -> Self {
        self.compaction = policy;
        self
    }

    /// Enable remote-heads gossip. Requires storage: the gossip protocol
    /// speaks in durable storage identities.
    pub fn with_gossip(mut self, min_interval: Duration) -> Self {
        self.enable_gossip = true;
        self.gossip_min_interval = min_interval;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.enable_gossip && self.storage_id.is_none() {
            return Err(DocmeshError::Configuration(
                "remote-heads gossip requires a storage identity".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Find requests ====================

/// Options for [`Repo::find_with`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Resolve with the (empty) handle instead of an error when the
    /// document turns out to be unavailable.
    pub allow_unavailable: bool,
}

/// An in-flight `find`, with progress observation and cancellation.
pub struct FindRequest {
    document_id: DocumentId,
    progress: watch::Receiver<FindProgress>,
    reply: oneshot::Receiver<Result<DocHandle>>,
    cancelled: Arc<AtomicBool>,
}

impl FindRequest {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Watch the request's progress while it resolves.
    pub fn progress(&self) -> watch::Receiver<FindProgress> {
        self.progress.clone()
    }

    /// Abandon the request. The engine's loading continues (another caller
    /// may be waiting on the same document); only this caller gets
    /// [`DocmeshError::Aborted`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Wait for the request to resolve.
    pub async fn resolve(self) -> Result<DocHandle> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(DocmeshError::Aborted);
        }
        match self.reply.await {
            Ok(result) => result,
            Err(_) => Err(DocmeshError::Aborted),
        }
    }
}

// ==================== Commands ====================

enum RepoCommand {
    Find {
        document_id: DocumentId,
        waiter: FindWaiter,
    },
    AddDocument {
        handle: DocHandle,
    },
    Delete {
        document_id: DocumentId,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        adapter: Box<dyn NetworkAdapter>,
        reply: oneshot::Sender<Result<()>>,
    },
    BroadcastEphemeral {
        document_id: DocumentId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    AddGenerousPeer {
        peer: PeerId,
    },
    SubscribeRemotes {
        storage_ids: Vec<StorageId>,
        reply: oneshot::Sender<Result<()>>,
    },
    ReevaluateShare {
        reply: oneshot::Sender<()>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
}

// ==================== Repo ====================

/// A collection of replicated documents plus the machinery that loads,
/// syncs, persists, and shares them.
pub struct Repo {
    local_peer: PeerId,
    handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
    commands: mpsc::UnboundedSender<RepoCommand>,
    changed_tx: mpsc::UnboundedSender<DocumentId>,
    ephemeral: Arc<EphemeralChannel>,
    gossip_events: broadcast::Sender<RemoteHeadsEvent>,
}

impl Repo {
    const GOSSIP_EVENT_CAPACITY: usize = 256;

    pub fn new(config: RepoConfig) -> Result<Self> {
        config.validate()?;

        let local_peer = config.peer_id.clone();
        let handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (gossip_events, _) = broadcast::channel(Self::GOSSIP_EVENT_CAPACITY);

        let compactor = config
            .storage
            .as_ref()
            .map(|storage| StorageCompactor::new(Arc::clone(storage), config.compaction.clone()));

        let coordinator = ReplicationCoordinator::new(
            local_peer.clone(),
            config.share,
            config.denylist,
            Arc::clone(&handles),
            compactor.clone(),
            changed_tx.clone(),
            outbox_tx.clone(),
        );

        let gossip = match (config.enable_gossip, config.storage_id) {
            (true, Some(storage_id)) => Some(RemoteHeadsGossip::new(
                local_peer.clone(),
                storage_id,
                config.gossip_min_interval,
                outbox_tx.clone(),
                gossip_events.clone(),
            )),
            _ => None,
        };

        let ephemeral = Arc::new(EphemeralChannel::new(local_peer.clone(), outbox_tx));

        let loop_state = RepoLoop {
            coordinator,
            gossip,
            ephemeral: Arc::clone(&ephemeral),
            compactor,
            handles: Arc::clone(&handles),
            adapters: Vec::new(),
            peer_routes: HashMap::new(),
            commands: commands_rx,
            changed: changed_rx,
            outbox: outbox_rx,
        };
        tokio::spawn(loop_state.run());

        Ok(Self {
            local_peer,
            handles,
            commands: commands_tx,
            changed_tx,
            ephemeral,
            gossip_events,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.local_peer
    }

    /// Create a fresh, empty, immediately usable document.
    pub fn create(&self) -> DocHandle {
        let handle = DocHandle::new(
            DocumentId::random(),
            HandleState::Ready,
            self.changed_tx.clone(),
        );
        self.handles
            .write()
            .unwrap()
            .insert(handle.document_id(), handle.clone());
        let _ = self.commands.send(RepoCommand::AddDocument {
            handle: handle.clone(),
        });
        handle
    }

    /// Resolve a document by id: cache, then storage, then the network.
    pub fn find(&self, document_id: DocumentId) -> FindRequest {
        self.find_with(document_id, FindOptions::default())
    }

    pub fn find_with(&self, document_id: DocumentId, options: FindOptions) -> FindRequest {
        let (progress_tx, progress_rx) = watch::channel(FindProgress::Loading { percent: 0 });
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let waiter = FindWaiter {
            allow_unavailable: options.allow_unavailable,
            cancelled: Arc::clone(&cancelled),
            progress: progress_tx,
            reply: reply_tx,
        };
        // If the loop already stopped, the dropped reply sender resolves
        // the request as aborted.
        let _ = self.commands.send(RepoCommand::Find {
            document_id,
            waiter,
        });
        FindRequest {
            document_id,
            progress: progress_rx,
            reply: reply_rx,
            cancelled,
        }
    }

    /// Delete a document locally: handle becomes terminal, stored chunks
    /// are removed. Replicas on other peers are untouched.
    pub async fn delete(&self, document_id: DocumentId) -> Result<()> {
        self.request(|reply| RepoCommand::Delete { document_id, reply })
            .await?
    }

    /// Attach a network transport. Peers it discovers join the repo after
    /// the adapter (or its auth wrapper) vets them.
    pub async fn connect(&self, adapter: Box<dyn NetworkAdapter>) -> Result<()> {
        self.request(|reply| RepoCommand::Connect { adapter, reply })
            .await?
    }

    /// Broadcast a transient payload to every connected peer. Never stored
    /// or merged into any document.
    pub async fn broadcast_ephemeral(&self, document_id: DocumentId, data: Vec<u8>) -> Result<()> {
        self.request(|reply| RepoCommand::BroadcastEphemeral {
            document_id,
            data,
            reply,
        })
        .await?
    }

    /// Subscribe to ephemeral payloads received from peers.
    pub fn subscribe_ephemeral(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.ephemeral.subscribe()
    }

    /// Subscribe to remote-heads announcements for storage identities
    /// registered via [`Repo::subscribe_to_remotes`].
    pub fn subscribe_remote_heads(&self) -> broadcast::Receiver<RemoteHeadsEvent> {
        self.gossip_events.subscribe()
    }

    /// Gossip our heads to `peer` even without a subscription from it.
    pub fn add_generous_peer(&self, peer: PeerId) {
        let _ = self.commands.send(RepoCommand::AddGenerousPeer { peer });
    }

    /// Register interest in the listed storage identities' heads.
    pub async fn subscribe_to_remotes(&self, storage_ids: Vec<StorageId>) -> Result<()> {
        self.request(|reply| RepoCommand::SubscribeRemotes { storage_ids, reply })
            .await?
    }

    /// Re-run the share policy against every (document, peer) pair.
    pub async fn reevaluate_share_policy(&self) -> Result<()> {
        self.request(|reply| RepoCommand::ReevaluateShare { reply })
            .await
    }

    /// Persist every pending change before returning.
    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| RepoCommand::Flush { reply }).await?
    }

    /// Flush, disconnect every transport, and stop the event loop.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| RepoCommand::Stop { reply }).await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RepoCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| DocmeshError::Aborted)?;
        reply_rx.await.map_err(|_| DocmeshError::Aborted)
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("local_peer", &self.local_peer)
            .field("documents", &self.handles.read().unwrap().len())
            .finish()
    }
}

// ==================== Event loop ====================

struct RepoLoop {
    coordinator: ReplicationCoordinator,
    gossip: Option<RemoteHeadsGossip>,
    ephemeral: Arc<EphemeralChannel>,
    compactor: Option<StorageCompactor>,
    handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
    adapters: Vec<Box<dyn NetworkAdapter>>,
    /// Which adapter owns the route to each peer.
    peer_routes: HashMap<PeerId, usize>,
    commands: mpsc::UnboundedReceiver<RepoCommand>,
    changed: mpsc::UnboundedReceiver<DocumentId>,
    outbox: mpsc::UnboundedReceiver<RepoMessage>,
}

impl RepoLoop {
    async fn run(mut self) {
        let (net_tx, mut net_rx) = mpsc::unbounded_channel::<(usize, NetworkEvent)>();
        loop {
            // Biased: drain change notifications and network traffic before
            // taking the next command, so a flush command never overtakes
            // the changes it is meant to persist.
            tokio::select! {
                biased;
                Some(document_id) = self.changed.recv() => {
                    self.handle_local_change(document_id);
                }
                Some((adapter_idx, event)) = net_rx.recv() => {
                    self.handle_network_event(adapter_idx, event).await;
                }
                Some(message) = self.outbox.recv() => {
                    self.route_outbound(message).await;
                }
                Some(command) = self.commands.recv() => {
                    if self.handle_command(command, &net_tx).await {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("repo event loop stopped");
    }

    /// Returns `true` when the loop should stop.
    async fn handle_command(
        &mut self,
        command: RepoCommand,
        net_tx: &mpsc::UnboundedSender<(usize, NetworkEvent)>,
    ) -> bool {
        match command {
            RepoCommand::Find {
                document_id,
                waiter,
            } => {
                self.coordinator.find(document_id, waiter).await;
            }
            RepoCommand::AddDocument { handle } => {
                self.coordinator.add_document(handle).await;
            }
            RepoCommand::Delete { document_id, reply } => {
                let result = self.coordinator.delete_document(&document_id).await;
                let _ = reply.send(result);
            }
            RepoCommand::Connect { mut adapter, reply } => {
                let result = self.attach_adapter(&mut adapter, net_tx).await;
                if result.is_ok() {
                    self.adapters.push(adapter);
                    self.coordinator.transport_added();
                }
                let _ = reply.send(result);
            }
            RepoCommand::BroadcastEphemeral {
                document_id,
                data,
                reply,
            } => {
                let peers = self.coordinator.connected_peers();
                let _ = reply.send(self.ephemeral.broadcast(document_id, data, peers));
            }
            RepoCommand::AddGenerousPeer { peer } => {
                if let Some(gossip) = &self.gossip {
                    gossip.add_generous_peer(peer);
                }
            }
            RepoCommand::SubscribeRemotes { storage_ids, reply } => {
                let result = match &self.gossip {
                    Some(gossip) => {
                        gossip.subscribe_to_remotes(storage_ids, self.coordinator.connected_peers())
                    }
                    None => Err(DocmeshError::Configuration(
                        "remote-heads gossip is not enabled".to_string(),
                    )),
                };
                let _ = reply.send(result);
            }
            RepoCommand::ReevaluateShare { reply } => {
                self.coordinator.reevaluate_share_policy().await;
                let _ = reply.send(());
            }
            RepoCommand::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            RepoCommand::Stop { reply } => {
                let result = self.flush().await;
                for adapter in &mut self.adapters {
                    if let Err(e) = adapter.disconnect().await {
                        warn!(error = %e, "adapter disconnect failed");
                    }
                }
                info!("repo stopped");
                let _ = reply.send(result);
                return true;
            }
        }
        false
    }

    async fn attach_adapter(
        &mut self,
        adapter: &mut Box<dyn NetworkAdapter>,
        net_tx: &mpsc::UnboundedSender<(usize, NetworkEvent)>,
    ) -> Result<()> {
        adapter.connect(self.coordinator_peer()).await?;
        let mut events = adapter
            .take_events()
            .ok_or_else(|| DocmeshError::Network("adapter events already taken".to_string()))?;
        let adapter_idx = self.adapters.len();
        let net_tx = net_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if net_tx.send((adapter_idx, event)).is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    fn coordinator_peer(&self) -> PeerId {
        // The coordinator and the repo share one local peer id.
        self.coordinator.local_peer().clone()
    }

    fn handle_local_change(&mut self, document_id: DocumentId) {
        self.coordinator.document_changed(&document_id);

        let handle = self.coordinator.handle_of(&document_id);
        if let Some(handle) = &handle {
            if let (Some(gossip), Ok(heads)) = (&self.gossip, handle.heads()) {
                if let Err(e) = gossip.note_local_heads_changed(document_id, &heads) {
                    warn!(document = %document_id, error = %e, "gossip announce failed");
                }
            }
            if let Some(compactor) = &self.compactor {
                compactor.note_change(document_id);
                compactor.schedule_save(handle);
            }
        }
    }

    async fn handle_network_event(&mut self, adapter_idx: usize, event: NetworkEvent) {
        match event {
            NetworkEvent::Ready => {
                self.coordinator.transport_ready().await;
            }
            NetworkEvent::PeerCandidate { peer_id, metadata } => {
                self.peer_routes.insert(peer_id.clone(), adapter_idx);
                if let Some(gossip) = &self.gossip {
                    if let Err(e) = gossip.announce_interest_to(peer_id.clone()) {
                        warn!(peer = %peer_id, error = %e, "interest announcement failed");
                    }
                }
                self.coordinator.add_peer(peer_id, metadata).await;
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                self.peer_routes.remove(&peer_id);
                self.ephemeral.remove_peer(&peer_id);
                if let Some(gossip) = &self.gossip {
                    gossip.remove_peer(&peer_id);
                }
                self.coordinator.remove_peer(&peer_id).await;
            }
            NetworkEvent::Message(message) => self.dispatch_message(message).await,
            NetworkEvent::Error { peer_id, error } => {
                warn!(peer = ?peer_id, error = %error, "network error");
            }
            NetworkEvent::Closed => {
                self.coordinator.transport_closed();
            }
        }
    }

    async fn dispatch_message(&mut self, message: RepoMessage) {
        // The denylist applies before any routing by kind. Sync and request
        // still reach the coordinator, which answers them with
        // `doc_unavailable`; everything else for a denied document is
        // dropped here.
        if let Some(document_id) = message.document_id() {
            if self.coordinator.is_denied(document_id)
                && !matches!(
                    message,
                    RepoMessage::Sync { .. } | RepoMessage::Request { .. }
                )
            {
                debug!(document = %document_id, "dropping message for denied document");
                return;
            }
        }
        match message {
            RepoMessage::Ephemeral {
                sender_id,
                document_id,
                session_id,
                count,
                data,
                ..
            } => {
                self.ephemeral
                    .receive(sender_id, document_id, session_id, count, data);
            }
            RepoMessage::RemoteSubscriptionChange {
                sender_id,
                add,
                remove,
                ..
            } => {
                if let Some(gossip) = &self.gossip {
                    gossip.handle_subscription_change(&sender_id, add, remove);
                }
            }
            RepoMessage::RemoteHeadsChanged {
                sender_id,
                document_id,
                new_heads,
                ..
            } => {
                if let Some(gossip) = &self.gossip {
                    let handle = self.coordinator.handle_of(&document_id);
                    if let Err(e) = gossip.handle_remote_heads_changed(
                        &sender_id,
                        document_id,
                        new_heads,
                        handle.as_ref(),
                    ) {
                        warn!(document = %document_id, error = %e, "gossip relay failed");
                    }
                }
            }
            other => self.coordinator.receive_message(other).await,
        }
    }

    async fn route_outbound(&mut self, message: RepoMessage) {
        let target = message.target_id().clone();
        let Some(adapter_idx) = self.peer_routes.get(&target) else {
            debug!(peer = %target, "dropping message for unrouted peer");
            return;
        };
        let Some(adapter) = self.adapters.get(*adapter_idx) else {
            return;
        };
        if let Err(e) = adapter.send(message).await {
            warn!(peer = %target, error = %e, "send failed");
        }
    }

    async fn flush(&self) -> Result<()> {
        let Some(compactor) = &self.compactor else {
            return Ok(());
        };
        let handles: Vec<DocHandle> = self.handles.read().unwrap().values().cloned().collect();
        compactor.flush(&handles).await
    }
}
