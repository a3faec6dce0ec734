//! # docmesh replication engine
//!
//! Local-first document replication over pluggable storage and network
//! adapters. A [`Repo`] manages a set of CRDT documents: it hands out
//! [`DocHandle`]s for reading and mutating, keeps connected peers in sync,
//! persists snapshots with debounced compaction, and carries transient
//! (ephemeral) payloads and remote-heads gossip over the same peer
//! connections.
//!
//! ```no_run
//! use docmesh_sync::{Repo, RepoConfig};
//! use automerge::transaction::Transactable;
//!
//! # async fn demo() -> docmesh_core::Result<()> {
//! let repo = Repo::new(RepoConfig::new())?;
//! let doc = repo.create();
//! doc.change(|d| {
//!     let _ = d.put(automerge::ROOT, "title", "hello");
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod compactor;
pub mod coordinator;
pub mod driver;
pub mod ephemeral;
pub mod gossip;
pub mod handle;
pub mod repo;

pub use compactor::{CompactionPolicy, StorageCompactor};
pub use coordinator::FindProgress;
pub use ephemeral::{EphemeralChannel, EphemeralEvent};
pub use gossip::{RemoteHeadsEvent, RemoteHeadsGossip};
pub use handle::{DocHandle, DocHandleEvent, HandleState};
pub use repo::{FindOptions, FindRequest, Repo, RepoConfig};
