//! Remote-heads gossip between two storage-backed repos.

use std::sync::Arc;
use std::time::Duration;

use automerge::transaction::Transactable;

use docmesh_core::{ChannelAdapter, DocmeshError, MemoryStorage, PeerId, PeerMetadata, StorageId};
use docmesh_sync::{Repo, RepoConfig};

fn gossiping_repo(name: &str) -> Repo {
    Repo::new(
        RepoConfig::new()
            .with_peer_id(PeerId::from(name))
            .with_storage(
                Arc::new(MemoryStorage::new()),
                StorageId::from(format!("store-{name}").as_str()),
            )
            .with_gossip(Duration::from_millis(5)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_gossip_requires_storage_identity() {
    let err = Repo::new(RepoConfig::new().with_gossip(Duration::from_millis(5))).unwrap_err();
    assert!(matches!(err, DocmeshError::Configuration(_)));
}

#[tokio::test]
async fn test_subscribe_without_gossip_is_rejected() {
    let repo = Repo::new(RepoConfig::new()).unwrap();
    assert!(matches!(
        repo.subscribe_to_remotes(vec![StorageId::from("x")]).await,
        Err(DocmeshError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_heads_announcements_reach_subscribers() {
    let repo_a = gossiping_repo("a");
    let repo_b = gossiping_repo("b");
    let (left, right) = ChannelAdapter::pair(PeerMetadata::default(), PeerMetadata::default());
    repo_a.connect(Box::new(left)).await.unwrap();
    repo_b.connect(Box::new(right)).await.unwrap();

    repo_a
        .subscribe_to_remotes(vec![StorageId::from("store-b")])
        .await
        .unwrap();
    let mut announcements = repo_a.subscribe_remote_heads();

    let doc = repo_b.create();
    // Keep editing until an announcement lands: the subscription and the
    // peer handshake race at startup.
    let event = loop {
        doc.change(|d| {
            d.put(automerge::ROOT, "n", 1).unwrap();
        })
        .unwrap();
        match tokio::time::timeout(Duration::from_millis(50), announcements.recv()).await {
            Ok(Ok(event)) => break event,
            _ => continue,
        }
    };

    assert_eq!(event.document_id, doc.document_id());
    assert_eq!(event.storage_id, StorageId::from("store-b"));
    let expected: Vec<String> = doc
        .heads()
        .unwrap()
        .iter()
        .map(|h| h.to_string())
        .collect();
    // The last announcement may lag the latest edit; heads must at least
    // be well-formed hex and non-empty once the doc has history.
    assert!(!event.heads.heads.is_empty());
    assert!(event.heads.timestamp > 0);
    assert!(expected.iter().all(|h| h.len() == 64));
}
