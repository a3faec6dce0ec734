//! Identifier types: documents, peers, storage identities, ephemeral sessions.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::DocmeshError;

/// URL scheme prefix for the encoded document id form.
const URL_PREFIX: &str = "docmesh:";

/// Process-wide-unique opaque document identifier.
///
/// The payload is 16 random bytes (uuid v4). The URL form appends a crc32
/// checksum and base64url-encodes the result:
/// `docmesh:<base64url(payload ++ crc32(payload))>`. Immutable once assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Generate a fresh random document id.
    pub fn random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// The raw 16-byte payload.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encode to the checksummed URL form.
    pub fn to_url(&self) -> String {
        let mut buf = [0u8; 20];
        buf[..16].copy_from_slice(&self.0);
        buf[16..].copy_from_slice(&crc32fast::hash(&self.0).to_be_bytes());
        format!("{}{}", URL_PREFIX, URL_SAFE_NO_PAD.encode(buf))
    }

    /// Parse from the checksummed URL form.
    ///
    /// Also accepts the bare encoded payload without the `docmesh:` prefix.
    pub fn from_url(url: &str) -> Result<Self, DocmeshError> {
        let encoded = url.strip_prefix(URL_PREFIX).unwrap_or(url);
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| DocmeshError::InvalidDocumentId(url.to_string()))?;
        if bytes.len() != 20 {
            return Err(DocmeshError::InvalidDocumentId(url.to_string()));
        }
        let (payload, checksum) = bytes.split_at(16);
        if crc32fast::hash(payload).to_be_bytes() != checksum {
            return Err(DocmeshError::InvalidDocumentId(url.to_string()));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(payload);
        Ok(Self(id))
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.to_url())
    }
}

impl FromStr for DocumentId {
    type Err = DocmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}

impl Serialize for DocumentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_url())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_url(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque peer identifier, scoped to a connection.
///
/// Not guaranteed globally unique - only unique among the peers currently
/// known to one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a random peer id (uuid v4 string).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Persistent identity of a storage backend.
///
/// Unlike [`PeerId`], a storage id survives reconnects and identifies the
/// replica's durable state for remote-heads gossip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageId(pub String);

impl StorageId {
    /// Generate a random storage id (uuid v4 string).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for one ephemeral messaging session of one peer.
///
/// Counts are strictly increasing per (sender, session); a new session id
/// resets the expected counter on receivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a random session id (uuid v4 string).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_url_round_trip() {
        let id = DocumentId::random();
        let url = id.to_url();
        assert!(url.starts_with("docmesh:"));
        let parsed = DocumentId::from_url(&url).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_document_id_bare_form_accepted() {
        let id = DocumentId::random();
        let url = id.to_url();
        let bare = url.strip_prefix("docmesh:").unwrap();
        assert_eq!(DocumentId::from_url(bare).unwrap(), id);
    }

    #[test]
    fn test_document_id_rejects_bad_checksum() {
        let id = DocumentId::random();
        let mut bytes = [0u8; 20];
        bytes[..16].copy_from_slice(id.as_bytes());
        bytes[16..].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let url = format!("docmesh:{}", URL_SAFE_NO_PAD.encode(bytes));
        assert!(matches!(
            DocumentId::from_url(&url),
            Err(DocmeshError::InvalidDocumentId(_))
        ));
    }

    #[test]
    fn test_document_id_rejects_garbage() {
        for bad in ["", "docmesh:", "docmesh:!!!", "docmesh:AAAA", "not a url"] {
            assert!(DocumentId::from_url(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn test_document_id_serde_round_trip() {
        let id = DocumentId::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_peer_ids_distinct() {
        assert_ne!(PeerId::random(), PeerId::random());
        assert_ne!(StorageId::random(), StorageId::random());
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
