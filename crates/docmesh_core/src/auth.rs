//! Authentication wrapper for network adapters.
//!
//! An [`AuthProvider`] vets peer candidates before the engine ever sees them
//! and may transform the opaque payload bytes of sync/ephemeral messages
//! (e.g. to encrypt them). [`AuthenticatedAdapter`] wraps any
//! [`NetworkAdapter`] and exposes the same event surface; rejections show up
//! as [`NetworkEvent::Error`] instead of peer candidates.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{DocmeshError, Result};
use crate::ids::PeerId;
use crate::network::{NetworkAdapter, NetworkEvent, PeerMetadata};
use crate::protocol::RepoMessage;

/// Authenticates peers and transforms message payload bytes.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Vet a peer candidate. `Err` suppresses the candidate event.
    async fn authenticate(&self, peer: &PeerId, metadata: &PeerMetadata) -> Result<()>;

    /// Transform an outgoing sync/ephemeral payload. Identity by default.
    fn transform_outgoing(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        Ok(payload)
    }

    /// Transform an incoming sync/ephemeral payload. Identity by default.
    fn transform_incoming(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        Ok(payload)
    }
}

/// Apply `f` to the opaque payload of a message, leaving the rest intact.
fn map_payload(
    message: RepoMessage,
    f: impl FnOnce(Vec<u8>) -> Result<Vec<u8>>,
) -> Result<RepoMessage> {
    Ok(match message {
        RepoMessage::Sync {
            sender_id,
            target_id,
            document_id,
            data,
        } => RepoMessage::Sync {
            sender_id,
            target_id,
            document_id,
            data: f(data)?,
        },
        RepoMessage::Ephemeral {
            sender_id,
            target_id,
            document_id,
            session_id,
            count,
            data,
        } => RepoMessage::Ephemeral {
            sender_id,
            target_id,
            document_id,
            session_id,
            count,
            data: f(data)?,
        },
        other => other,
    })
}

/// A [`NetworkAdapter`] wrapped with peer authentication.
pub struct AuthenticatedAdapter<A, P> {
    inner: A,
    provider: Arc<P>,
    allowed: Arc<RwLock<HashSet<PeerId>>>,
    events_rx: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl<A: NetworkAdapter, P: AuthProvider> AuthenticatedAdapter<A, P> {
    pub fn new(inner: A, provider: P) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            provider: Arc::new(provider),
            allowed: Arc::new(RwLock::new(HashSet::new())),
            events_rx: Some(events_rx),
            events_tx,
        }
    }
}

#[async_trait]
impl<A: NetworkAdapter, P: AuthProvider> NetworkAdapter for AuthenticatedAdapter<A, P> {
    async fn connect(&mut self, local_peer: PeerId) -> Result<()> {
        self.inner.connect(local_peer).await?;
        let mut inner_events = self
            .inner
            .take_events()
            .ok_or_else(|| DocmeshError::Network("inner adapter events already taken".into()))?;

        let provider = Arc::clone(&self.provider);
        let allowed = Arc::clone(&self.allowed);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = inner_events.recv().await {
                let forwarded = match event {
                    NetworkEvent::PeerCandidate { peer_id, metadata } => {
                        match provider.authenticate(&peer_id, &metadata).await {
                            Ok(()) => {
                                allowed.write().unwrap().insert(peer_id.clone());
                                NetworkEvent::PeerCandidate { peer_id, metadata }
                            }
                            Err(e) => {
                                warn!(peer = %peer_id, error = %e, "peer failed authentication");
                                NetworkEvent::Error {
                                    peer_id: Some(peer_id),
                                    error: e.to_string(),
                                }
                            }
                        }
                    }
                    NetworkEvent::PeerDisconnected { peer_id } => {
                        allowed.write().unwrap().remove(&peer_id);
                        NetworkEvent::PeerDisconnected { peer_id }
                    }
                    NetworkEvent::Message(message) => {
                        let sender = message.sender_id().clone();
                        if !allowed.read().unwrap().contains(&sender) {
                            warn!(peer = %sender, "dropping message from unauthenticated peer");
                            continue;
                        }
                        match map_payload(message, |p| provider.transform_incoming(p)) {
                            Ok(message) => NetworkEvent::Message(message),
                            Err(e) => NetworkEvent::Error {
                                peer_id: Some(sender),
                                error: e.to_string(),
                            },
                        }
                    }
                    other => other,
                };
                if events.send(forwarded).is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.events_rx.take()
    }

    async fn send(&self, message: RepoMessage) -> Result<()> {
        let message = map_payload(message, |p| self.provider.transform_outgoing(p))?;
        self.inner.send(message).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.inner.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ChannelAdapter;

    /// Rejects any peer whose id starts with "evil" and XORs payloads.
    struct TestProvider;

    #[async_trait]
    impl AuthProvider for TestProvider {
        async fn authenticate(&self, peer: &PeerId, _metadata: &PeerMetadata) -> Result<()> {
            if peer.0.starts_with("evil") {
                Err(DocmeshError::AuthenticationFailed {
                    peer: peer.clone(),
                    reason: "untrusted peer".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn transform_outgoing(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
            Ok(payload.iter().map(|b| b ^ 0xFF).collect())
        }

        fn transform_incoming(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
            Ok(payload.iter().map(|b| b ^ 0xFF).collect())
        }
    }

    #[tokio::test]
    async fn test_rejected_peer_surfaces_as_error_event() {
        let (a, mut b) = ChannelAdapter::pair(PeerMetadata::default(), PeerMetadata::default());
        let mut wrapped = AuthenticatedAdapter::new(a, TestProvider);
        let mut events = wrapped.take_events().unwrap();
        wrapped.connect(PeerId::from("good")).await.unwrap();
        b.connect(PeerId::from("evil-twin")).await.unwrap();

        assert!(matches!(events.recv().await, Some(NetworkEvent::Ready)));
        match events.recv().await {
            Some(NetworkEvent::Error { peer_id, .. }) => {
                assert_eq!(peer_id, Some(PeerId::from("evil-twin")));
            }
            other => panic!("expected Error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_payload_transform_round_trips_between_wrapped_ends() {
        let (a, b) = ChannelAdapter::pair(PeerMetadata::default(), PeerMetadata::default());
        let mut left = AuthenticatedAdapter::new(a, TestProvider);
        let mut right = AuthenticatedAdapter::new(b, TestProvider);
        let mut left_events = left.take_events().unwrap();
        let mut right_events = right.take_events().unwrap();
        left.connect(PeerId::from("alice")).await.unwrap();
        right.connect(PeerId::from("bob")).await.unwrap();

        // Drain Ready + PeerCandidate on both sides.
        left_events.recv().await;
        left_events.recv().await;
        right_events.recv().await;
        right_events.recv().await;

        let doc = crate::ids::DocumentId::random();
        left.send(RepoMessage::Sync {
            sender_id: PeerId::from("alice"),
            target_id: PeerId::from("bob"),
            document_id: doc,
            data: vec![1, 2, 3],
        })
        .await
        .unwrap();

        match right_events.recv().await {
            Some(NetworkEvent::Message(RepoMessage::Sync { data, .. })) => {
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("expected Sync message, got {other:?}"),
        }
    }
}
