//! Wire protocol messages exchanged between repo peers.
//!
//! Every message is discriminated by a `type` tag and carries the sending
//! and receiving peer ids. Sync payloads are opaque bytes produced by the
//! CRDT layer; this module never inspects them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{DocumentId, PeerId, SessionId, StorageId};

/// Heads advertised for one storage identity in a gossip message.
///
/// Heads are hex-encoded change hashes; the engine treats them as opaque
/// strings and only compares them for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHeads {
    /// Frontier of the document as known by that storage identity.
    pub heads: Vec<String>,
    /// Milliseconds since the Unix epoch at the time of observation.
    pub timestamp: i64,
}

/// A protocol message addressed from one peer to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepoMessage {
    /// Opaque CRDT sync payload for one document.
    Sync {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    /// Explicit "I want document X" - sent while resolving a find.
    Request {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
    },
    /// Transient broadcast payload; never persisted by any peer.
    Ephemeral {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        session_id: SessionId,
        /// Strictly increasing per (sender, session).
        count: u64,
        data: Vec<u8>,
    },
    /// The sender does not have the named document.
    DocUnavailable {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
    },
    /// Add/remove interest in storage identities for remote-heads gossip.
    RemoteSubscriptionChange {
        sender_id: PeerId,
        target_id: PeerId,
        #[serde(default)]
        add: Vec<StorageId>,
        #[serde(default)]
        remove: Vec<StorageId>,
    },
    /// Notification that a storage identity's heads advanced.
    RemoteHeadsChanged {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        new_heads: HashMap<StorageId, RemoteHeads>,
    },
}

impl RepoMessage {
    /// The peer that sent this message.
    pub fn sender_id(&self) -> &PeerId {
        match self {
            RepoMessage::Sync { sender_id, .. }
            | RepoMessage::Request { sender_id, .. }
            | RepoMessage::Ephemeral { sender_id, .. }
            | RepoMessage::DocUnavailable { sender_id, .. }
            | RepoMessage::RemoteSubscriptionChange { sender_id, .. }
            | RepoMessage::RemoteHeadsChanged { sender_id, .. } => sender_id,
        }
    }

    /// The peer this message is addressed to.
    pub fn target_id(&self) -> &PeerId {
        match self {
            RepoMessage::Sync { target_id, .. }
            | RepoMessage::Request { target_id, .. }
            | RepoMessage::Ephemeral { target_id, .. }
            | RepoMessage::DocUnavailable { target_id, .. }
            | RepoMessage::RemoteSubscriptionChange { target_id, .. }
            | RepoMessage::RemoteHeadsChanged { target_id, .. } => target_id,
        }
    }

    /// The document this message concerns, if it names one.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            RepoMessage::Sync { document_id, .. }
            | RepoMessage::Request { document_id, .. }
            | RepoMessage::Ephemeral { document_id, .. }
            | RepoMessage::DocUnavailable { document_id, .. }
            | RepoMessage::RemoteHeadsChanged { document_id, .. } => Some(document_id),
            RepoMessage::RemoteSubscriptionChange { .. } => None,
        }
    }

    /// Encode the message for the transport layer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message received from the transport layer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> (PeerId, PeerId) {
        (PeerId::from("alice"), PeerId::from("bob"))
    }

    #[test]
    fn test_sync_message_round_trip() {
        let (a, b) = peers();
        let msg = RepoMessage::Sync {
            sender_id: a,
            target_id: b,
            document_id: DocumentId::random(),
            data: vec![1, 2, 3],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(RepoMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_tag_is_snake_case() {
        let (a, b) = peers();
        let msg = RepoMessage::DocUnavailable {
            sender_id: a,
            target_id: b,
            document_id: DocumentId::random(),
        };
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains(r#""type":"doc_unavailable""#), "{json}");
    }

    #[test]
    fn test_subscription_change_defaults() {
        let json = r#"{"type":"remote_subscription_change","sender_id":"a","target_id":"b"}"#;
        let msg = RepoMessage::decode(json.as_bytes()).unwrap();
        match msg {
            RepoMessage::RemoteSubscriptionChange { add, remove, .. } => {
                assert!(add.is_empty());
                assert!(remove.is_empty());
            }
            other => panic!("expected RemoteSubscriptionChange, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RepoMessage::decode(b"not json").is_err());
        assert!(RepoMessage::decode(br#"{"type":"unknown_kind"}"#).is_err());
    }
}
