//! Per-document sync driver.
//!
//! A [`DocSyncDriver`] owns the per-peer automerge sync state for one
//! document and turns local snapshot changes and incoming sync payloads
//! into outbound [`RepoMessage::Sync`] messages.
//!
//! # Errors
//!
//! Failures are scoped to one (document, peer) pair. A malformed payload
//! from one peer returns an error the caller logs and drops; the sync
//! states of all other peers are untouched.

use std::collections::HashMap;

use automerge::sync::{Message, State as SyncState, SyncDoc};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, PeerId};
use docmesh_core::protocol::RepoMessage;

use crate::handle::DocHandle;

/// What one incoming sync payload did to the local snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReceipt {
    /// The payload advanced the snapshot's heads.
    pub changed: bool,
    /// Every head the peer announced is already in our snapshot; there is
    /// nothing left to fetch from it.
    pub caught_up: bool,
}

pub struct DocSyncDriver {
    document_id: DocumentId,
    local_peer: PeerId,
    handle: DocHandle,
    peers: HashMap<PeerId, SyncState>,
    outbox: mpsc::UnboundedSender<RepoMessage>,
}

impl DocSyncDriver {
    pub fn new(
        local_peer: PeerId,
        handle: DocHandle,
        outbox: mpsc::UnboundedSender<RepoMessage>,
    ) -> Self {
        Self {
            document_id: handle.document_id(),
            local_peer,
            handle,
            peers: HashMap::new(),
            outbox,
        }
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    /// Whether a sync session with this peer is open.
    pub fn is_tracking(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Peers with an open sync session.
    pub fn tracked_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// Open (or resume) a sync session with `peer` and send the first
    /// message if the protocol has one to offer.
    pub fn begin_sync(&mut self, peer: &PeerId) -> Result<()> {
        self.peers.entry(peer.clone()).or_insert_with(SyncState::new);
        self.generate_for(peer)
    }

    /// Feed one incoming sync payload from `peer` into the protocol.
    ///
    /// The reply (if any) goes out before this returns, so redelivering the
    /// same payload is harmless: the protocol state already covers it and
    /// no duplicate changes are applied.
    pub fn receive_sync_message(&mut self, peer: &PeerId, payload: &[u8]) -> Result<SyncReceipt> {
        let message = Message::decode(payload).map_err(|e| {
            DocmeshError::SyncProtocol(format!("undecodable sync message from {peer}: {e}"))
        })?;

        let state = self.peers.entry(peer.clone()).or_insert_with(SyncState::new);
        let changed = self.handle.with_doc_internal(|doc| {
            let before = doc.get_heads();
            doc.sync()
                .receive_sync_message(state, message)
                .map_err(|e| DocmeshError::SyncProtocol(format!("from {peer}: {e}")))?;
            Ok::<bool, DocmeshError>(before != doc.get_heads())
        })??;

        trace!(document = %self.document_id, peer = %peer, changed, "received sync message");
        if changed {
            let new_heads = self.handle.with_doc_internal(|doc| doc.get_heads())?;
            self.handle.note_heads_changed(new_heads);
        }

        // Caught up means the peer's announced frontier is contained in
        // ours. For an empty document both frontiers are empty, so this is
        // the only completion signal a sync round ever produces.
        let ours = self.handle.with_doc_internal(|doc| doc.get_heads())?;
        let caught_up = self
            .peers
            .get(peer)
            .and_then(|s| s.their_heads.as_ref())
            .is_some_and(|theirs| theirs.iter().all(|h| ours.contains(h)));

        // Always answer the peer directly; broadcasting to the others is
        // the caller's decision.
        self.generate_for(peer)?;
        Ok(SyncReceipt { changed, caught_up })
    }

    /// Push the next sync message to every tracked peer that needs one.
    pub fn sync_with_peers(&mut self) -> Result<()> {
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.generate_for(&peer)?;
        }
        Ok(())
    }

    /// Close the sync session with `peer`, discarding its state.
    pub fn end_sync(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_some() {
            debug!(document = %self.document_id, peer = %peer, "sync session ended");
        }
    }

    fn generate_for(&mut self, peer: &PeerId) -> Result<()> {
        let Some(state) = self.peers.get_mut(peer) else {
            return Ok(());
        };
        let message = self
            .handle
            .with_doc_internal(|doc| doc.sync().generate_sync_message(state))?;
        if let Some(message) = message {
            let msg = RepoMessage::Sync {
                sender_id: self.local_peer.clone(),
                target_id: peer.clone(),
                document_id: self.document_id,
                data: message.encode(),
            };
            self.outbox
                .send(msg)
                .map_err(|_| DocmeshError::Network("outbox closed".to_string()))?;
        }
        Ok(())
    }
}
