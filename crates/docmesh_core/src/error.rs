//! Error taxonomy shared by the whole workspace.

use crate::ids::{DocumentId, PeerId};

/// Result alias used throughout docmesh.
pub type Result<T> = std::result::Result<T, DocmeshError>;

/// Errors surfaced by the replication engine.
///
/// Errors scoped to one (document, peer) pair are isolated by the engine:
/// they are logged and dropped at the driver boundary and never reach
/// callers working with other documents or peers.
#[derive(Debug, thiserror::Error)]
pub enum DocmeshError {
    /// No connected peer could supply the requested document.
    #[error("document {0} is unavailable")]
    DocumentUnavailable(DocumentId),

    /// The document was deleted and its handle is terminal.
    #[error("document {0} has been deleted")]
    DocumentDeleted(DocumentId),

    /// A document URL or id string failed to parse.
    #[error("invalid document id: {0}")]
    InvalidDocumentId(String),

    /// A storage backend operation failed. Not retried at this layer.
    #[error("storage error: {0}")]
    StorageIo(String),

    /// A peer failed authentication at the adapter boundary.
    #[error("authentication failed for peer {peer}: {reason}")]
    AuthenticationFailed { peer: PeerId, reason: String },

    /// A peer was authenticated but denied by policy.
    #[error("authorization denied for peer {peer}: {reason}")]
    AuthorizationDenied { peer: PeerId, reason: String },

    /// The caller cancelled the operation.
    #[error("operation aborted by caller")]
    Aborted,

    /// A handle operation was attempted in a state that does not allow it.
    #[error("document {document} is {state}, operation requires {required}")]
    InvalidHandleState {
        document: DocumentId,
        state: &'static str,
        required: &'static str,
    },

    /// A malformed or out-of-sequence sync message from one peer.
    #[error("sync protocol error: {0}")]
    SyncProtocol(String),

    /// Invalid engine configuration, detected at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The network adapter failed to send or connect.
    #[error("network error: {0}")]
    Network(String),

    /// An error from the underlying CRDT implementation.
    #[error("crdt error: {0}")]
    Crdt(String),
}

impl From<serde_json::Error> for DocmeshError {
    fn from(e: serde_json::Error) -> Self {
        DocmeshError::SyncProtocol(format!("message encoding: {e}"))
    }
}
