//! Network adapter abstraction.
//!
//! Concrete transports (WebSocket, broadcast channel, in-process) are thin
//! I/O wrappers behind [`NetworkAdapter`]: they move [`RepoMessage`] bytes
//! and report peer lifecycle as [`NetworkEvent`]s. The engine never talks to
//! a socket directly.
//!
//! [`ChannelAdapter`] is the in-process reference implementation, used by
//! the engine's integration tests to wire two repos together.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DocmeshError, Result};
use crate::ids::{PeerId, StorageId};
use crate::protocol::RepoMessage;

/// Metadata a peer announces about itself when it becomes a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMetadata {
    /// Durable storage identity of the peer, if it persists documents.
    pub storage_id: Option<StorageId>,
}

/// Events emitted by a network adapter.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// The transport has finished connecting and knows its peer set.
    Ready,
    /// A remote peer is available on this transport.
    PeerCandidate {
        peer_id: PeerId,
        metadata: PeerMetadata,
    },
    /// A previously announced peer went away.
    PeerDisconnected { peer_id: PeerId },
    /// A protocol message arrived.
    Message(RepoMessage),
    /// A transport-level failure (including auth rejection) for one peer.
    Error {
        peer_id: Option<PeerId>,
        error: String,
    },
    /// The transport shut down; no further events will be emitted.
    Closed,
}

/// Pluggable transport for repo-to-repo messaging.
///
/// Implementations must deliver messages from one peer in send order; the
/// engine's per-document ordering guarantee depends on it.
#[async_trait]
pub trait NetworkAdapter: Send + Sync + 'static {
    /// Start the transport, announcing `local_peer` to the other side.
    async fn connect(&mut self, local_peer: PeerId) -> Result<()>;

    /// Take the event stream. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>>;

    /// Send a message to the peer named by its `target_id`.
    async fn send(&self, message: RepoMessage) -> Result<()>;

    /// Shut the transport down.
    async fn disconnect(&mut self) -> Result<()>;
}

/// Greeting exchanged when the two ends of a channel pair connect.
#[derive(Debug)]
struct Hello {
    peer_id: PeerId,
    metadata: PeerMetadata,
}

/// In-process transport connecting exactly two repos over tokio channels.
///
/// Each side announces itself on `connect`; once both ends have connected,
/// both emit `Ready` followed by a `PeerCandidate` for the other end.
pub struct ChannelAdapter {
    metadata: PeerMetadata,
    to_remote: mpsc::UnboundedSender<RepoMessage>,
    from_remote: Option<mpsc::UnboundedReceiver<RepoMessage>>,
    hello_tx: Option<tokio::sync::oneshot::Sender<Hello>>,
    hello_rx: Option<tokio::sync::oneshot::Receiver<Hello>>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
}

impl ChannelAdapter {
    /// Create a connected pair of adapters with the given peer metadata.
    pub fn pair(left: PeerMetadata, right: PeerMetadata) -> (Self, Self) {
        let (l2r_tx, l2r_rx) = mpsc::unbounded_channel();
        let (r2l_tx, r2l_rx) = mpsc::unbounded_channel();
        let (hello_l_tx, hello_l_rx) = tokio::sync::oneshot::channel();
        let (hello_r_tx, hello_r_rx) = tokio::sync::oneshot::channel();

        let build = |metadata,
                     to_remote,
                     from_remote,
                     hello_tx,
                     hello_rx|
         -> ChannelAdapter {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            ChannelAdapter {
                metadata,
                to_remote,
                from_remote: Some(from_remote),
                hello_tx: Some(hello_tx),
                hello_rx: Some(hello_rx),
                events_tx,
                events_rx: Some(events_rx),
            }
        };

        (
            build(left, l2r_tx, r2l_rx, hello_l_tx, hello_r_rx),
            build(right, r2l_tx, l2r_rx, hello_r_tx, hello_l_rx),
        )
    }
}

#[async_trait]
impl NetworkAdapter for ChannelAdapter {
    async fn connect(&mut self, local_peer: PeerId) -> Result<()> {
        let hello_tx = self
            .hello_tx
            .take()
            .ok_or_else(|| DocmeshError::Network("adapter already connected".to_string()))?;
        let hello_rx = self
            .hello_rx
            .take()
            .ok_or_else(|| DocmeshError::Network("adapter already connected".to_string()))?;
        let mut from_remote = self
            .from_remote
            .take()
            .ok_or_else(|| DocmeshError::Network("adapter already connected".to_string()))?;

        hello_tx
            .send(Hello {
                peer_id: local_peer,
                metadata: self.metadata.clone(),
            })
            .map_err(|_| DocmeshError::Network("peer end dropped before connect".to_string()))?;

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let Ok(hello) = hello_rx.await else {
                let _ = events.send(NetworkEvent::Closed);
                return;
            };
            let remote = hello.peer_id.clone();
            let _ = events.send(NetworkEvent::Ready);
            let _ = events.send(NetworkEvent::PeerCandidate {
                peer_id: hello.peer_id,
                metadata: hello.metadata,
            });
            while let Some(message) = from_remote.recv().await {
                if events.send(NetworkEvent::Message(message)).is_err() {
                    return;
                }
            }
            let _ = events.send(NetworkEvent::PeerDisconnected { peer_id: remote });
            let _ = events.send(NetworkEvent::Closed);
        });
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.events_rx.take()
    }

    async fn send(&self, message: RepoMessage) -> Result<()> {
        self.to_remote
            .send(message)
            .map_err(|_| DocmeshError::Network("channel peer disconnected".to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Dropping the sender closes the remote's receive loop; replace it
        // with a channel nobody reads.
        let (dead_tx, _) = mpsc::unbounded_channel();
        self.to_remote = dead_tx;
        Ok(())
    }
}
