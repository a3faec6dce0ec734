//! Share policy: who gets told about which documents.

use async_trait::async_trait;

use crate::ids::{DocumentId, PeerId};

/// Caller-supplied predicates controlling advertisement and access.
///
/// Both predicates are re-evaluated per (peer, document) pair whenever the
/// coordinator reconciles its peer/document sets; implementations should be
/// cheap or cache internally. Policies are never persisted.
#[async_trait]
pub trait SharePolicy: Send + Sync + 'static {
    /// Whether to proactively announce documents to `peer`.
    ///
    /// When `document_id` is `None` the question is about the peer in
    /// general (e.g. whether to advertise newly created documents to it).
    async fn announce(&self, peer: &PeerId, document_id: Option<&DocumentId>) -> bool;

    /// Whether to grant `peer` access to `document_id` when it asks.
    async fn access(&self, peer: &PeerId, document_id: &DocumentId) -> bool;
}

/// Announce and grant everything. The default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareAll;

#[async_trait]
impl SharePolicy for ShareAll {
    async fn announce(&self, _peer: &PeerId, _document_id: Option<&DocumentId>) -> bool {
        true
    }

    async fn access(&self, _peer: &PeerId, _document_id: &DocumentId) -> bool {
        true
    }
}

/// Never announce, never grant. Useful for receive-only replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShareNone;

#[async_trait]
impl SharePolicy for ShareNone {
    async fn announce(&self, _peer: &PeerId, _document_id: Option<&DocumentId>) -> bool {
        false
    }

    async fn access(&self, _peer: &PeerId, _document_id: &DocumentId) -> bool {
        false
    }
}
