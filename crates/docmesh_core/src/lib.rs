//! # docmesh core types
//!
//! Shared vocabulary for the docmesh replication engine:
//!
//! - **Identifiers**: [`DocumentId`] (checksummed URL form), [`PeerId`],
//!   [`StorageId`], [`SessionId`]
//! - **Protocol**: [`RepoMessage`] wire messages
//! - **Adapters**: the [`StorageAdapter`] and [`NetworkAdapter`] traits with
//!   in-memory / in-process reference implementations
//! - **Policy**: [`SharePolicy`] and the [`AuthProvider`] adapter wrapper
//! - **Errors**: [`DocmeshError`] and the crate-wide [`Result`] alias
//!
//! The engine itself lives in `docmesh_sync`.

pub mod auth;
pub mod error;
pub mod ids;
pub mod network;
pub mod protocol;
pub mod share;
pub mod storage;

pub use auth::{AuthProvider, AuthenticatedAdapter};
pub use error::{DocmeshError, Result};
pub use ids::{DocumentId, PeerId, SessionId, StorageId};
pub use network::{ChannelAdapter, NetworkAdapter, NetworkEvent, PeerMetadata};
pub use protocol::{RemoteHeads, RepoMessage};
pub use share::{ShareAll, ShareNone, SharePolicy};
pub use storage::{Chunk, MemoryStorage, StorageAdapter, StorageKey};
