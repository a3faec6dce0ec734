//! Ephemeral (non-persistent) messaging scoped to documents.
//!
//! Ephemeral payloads ride the same peer connections as sync traffic but
//! never touch a document's history or storage. Each sender stamps its
//! messages with a per-process session id and a monotonically increasing
//! count; receivers drop anything at or below the highest count already
//! seen from that (peer, session), so redelivered or reordered messages
//! never reach subscribers twice.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, PeerId, SessionId};
use docmesh_core::protocol::RepoMessage;

/// An ephemeral payload delivered to local subscribers.
#[derive(Debug, Clone)]
pub struct EphemeralEvent {
    pub document_id: DocumentId,
    pub sender_id: PeerId,
    pub data: Vec<u8>,
}

pub struct EphemeralChannel {
    local_peer: PeerId,
    session_id: SessionId,
    count: AtomicU64,
    /// Highest count seen per (peer, session). Stale sessions are cleared
    /// when the peer disconnects.
    last_seen: Mutex<HashMap<(PeerId, SessionId), u64>>,
    outbox: mpsc::UnboundedSender<RepoMessage>,
    incoming: broadcast::Sender<EphemeralEvent>,
}

impl EphemeralChannel {
    const EVENT_CAPACITY: usize = 256;

    pub fn new(local_peer: PeerId, outbox: mpsc::UnboundedSender<RepoMessage>) -> Self {
        let (incoming, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            local_peer,
            session_id: SessionId::random(),
            count: AtomicU64::new(0),
            last_seen: Mutex::new(HashMap::new()),
            outbox,
            incoming,
        }
    }

    /// Subscribe to ephemeral payloads received from peers.
    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.incoming.subscribe()
    }

    /// Send `data` for `document_id` to every peer in `peers`.
    ///
    /// The whole batch shares one count so a peer relaying it onward
    /// cannot create duplicates.
    pub fn broadcast(
        &self,
        document_id: DocumentId,
        data: Vec<u8>,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> Result<()> {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        for peer in peers {
            self.outbox
                .send(RepoMessage::Ephemeral {
                    sender_id: self.local_peer.clone(),
                    target_id: peer,
                    document_id,
                    session_id: self.session_id.clone(),
                    count,
                    data: data.clone(),
                })
                .map_err(|_| DocmeshError::Network("outbox closed".to_string()))?;
        }
        Ok(())
    }

    /// Handle an incoming ephemeral message.
    ///
    /// Duplicates (count at or below the last seen for the sender's
    /// session) are dropped silently.
    pub fn receive(
        &self,
        sender_id: PeerId,
        document_id: DocumentId,
        session_id: SessionId,
        count: u64,
        data: Vec<u8>,
    ) {
        {
            let mut last_seen = self.last_seen.lock().unwrap();
            let entry = last_seen.entry((sender_id.clone(), session_id)).or_insert(0);
            if count <= *entry {
                trace!(peer = %sender_id, count, "dropping duplicate ephemeral message");
                return;
            }
            *entry = count;
        }
        let _ = self.incoming.send(EphemeralEvent {
            document_id,
            sender_id,
            data,
        });
    }

    /// Forget session counters for a disconnected peer.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut last_seen = self.last_seen.lock().unwrap();
        let before = last_seen.len();
        last_seen.retain(|(p, _), _| p != peer);
        if last_seen.len() != before {
            debug!(peer = %peer, "cleared ephemeral session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (EphemeralChannel, mpsc::UnboundedReceiver<RepoMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EphemeralChannel::new(PeerId::from("local"), tx), rx)
    }

    #[test]
    fn test_broadcast_stamps_session_and_count() {
        let (channel, mut outbox) = channel();
        let doc = DocumentId::random();
        channel
            .broadcast(doc, vec![1, 2], [PeerId::from("a"), PeerId::from("b")])
            .unwrap();
        channel.broadcast(doc, vec![3], [PeerId::from("a")]).unwrap();

        let mut counts = Vec::new();
        let mut sessions = Vec::new();
        while let Ok(RepoMessage::Ephemeral {
            session_id, count, ..
        }) = outbox.try_recv()
        {
            counts.push(count);
            sessions.push(session_id);
        }
        // Both recipients of the first batch share a count; the next
        // broadcast increments it.
        assert_eq!(counts, vec![1, 1, 2]);
        assert!(sessions.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_duplicate_and_stale_counts_dropped() {
        let (channel, _outbox) = channel();
        let mut events = channel.subscribe();
        let doc = DocumentId::random();
        let session = SessionId::random();
        let sender = PeerId::from("remote");

        channel.receive(sender.clone(), doc, session.clone(), 1, vec![1]);
        channel.receive(sender.clone(), doc, session.clone(), 1, vec![1]);
        channel.receive(sender.clone(), doc, session.clone(), 3, vec![3]);
        channel.receive(sender.clone(), doc, session.clone(), 2, vec![2]);

        assert_eq!(events.try_recv().unwrap().data, vec![1]);
        assert_eq!(events.try_recv().unwrap().data, vec![3]);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_new_session_resets_counting() {
        let (channel, _outbox) = channel();
        let mut events = channel.subscribe();
        let doc = DocumentId::random();
        let sender = PeerId::from("remote");

        channel.receive(sender.clone(), doc, SessionId::random(), 5, vec![5]);
        // A restarted peer begins a fresh session at count 1.
        channel.receive(sender.clone(), doc, SessionId::random(), 1, vec![1]);

        assert_eq!(events.try_recv().unwrap().data, vec![5]);
        assert_eq!(events.try_recv().unwrap().data, vec![1]);
    }

    #[test]
    fn test_remove_peer_clears_sessions() {
        let (channel, _outbox) = channel();
        let mut events = channel.subscribe();
        let doc = DocumentId::random();
        let session = SessionId::random();
        let sender = PeerId::from("remote");

        channel.receive(sender.clone(), doc, session.clone(), 7, vec![7]);
        channel.remove_peer(&sender);
        // After reconnect the same session restarts low and is accepted.
        channel.receive(sender, doc, session, 1, vec![1]);

        assert_eq!(events.try_recv().unwrap().data, vec![7]);
        assert_eq!(events.try_recv().unwrap().data, vec![1]);
    }
}
