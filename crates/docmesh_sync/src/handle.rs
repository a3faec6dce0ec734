//! Per-document handle and lifecycle state machine.
//!
//! A [`DocHandle`] owns exactly one document's in-memory snapshot. Handles
//! are keyed 1:1 by [`DocumentId`]; the repo's handle cache guarantees there
//! are never two live handles for the same id in one process.
//!
//! # States
//!
//! ```text
//! idle → loading → { ready | unavailable }
//! ready ↔ unloaded
//! { ready, unavailable } → deleted   (terminal)
//! ```
//!
//! `unavailable` is not sticky: a sync message arriving later for the same
//! document moves the handle to `ready`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use automerge::{AutoCommit, ChangeHash};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::{DocumentId, StorageId};
use docmesh_core::protocol::RemoteHeads;

/// Lifecycle state of a document handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created but not yet asked to load anything.
    Idle,
    /// Waiting on storage and/or the network.
    Loading,
    /// Snapshot available and mutable.
    Ready,
    /// All transports reported ready and no known peer had the document.
    Unavailable,
    /// Snapshot dropped from memory; the id mapping is retained.
    Unloaded,
    /// Deleted locally. Terminal.
    Deleted,
}

impl HandleState {
    /// Whether the state terminates the handle's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandleState::Deleted)
    }

    fn name(&self) -> &'static str {
        match self {
            HandleState::Idle => "idle",
            HandleState::Loading => "loading",
            HandleState::Ready => "ready",
            HandleState::Unavailable => "unavailable",
            HandleState::Unloaded => "unloaded",
            HandleState::Deleted => "deleted",
        }
    }
}

/// Events emitted by a handle on its broadcast channel.
#[derive(Debug, Clone)]
pub enum DocHandleEvent {
    /// The snapshot's heads advanced (local edit or remote sync).
    HeadsChanged { new_heads: Vec<ChangeHash> },
    /// The handle became unavailable.
    Unavailable,
    /// The handle was deleted. No further events follow.
    Deleted,
}

struct HandleInner {
    document_id: DocumentId,
    doc: Mutex<Option<AutoCommit>>,
    state: RwLock<HandleState>,
    remote_heads: RwLock<HashMap<StorageId, RemoteHeads>>,
    events: broadcast::Sender<DocHandleEvent>,
    changed: mpsc::UnboundedSender<DocumentId>,
}

/// Cheaply cloneable handle to one replicated document.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<HandleInner>,
}

impl DocHandle {
    /// Event channel capacity; laggy subscribers lose oldest events.
    const EVENT_CAPACITY: usize = 256;

    pub(crate) fn new(
        document_id: DocumentId,
        state: HandleState,
        changed: mpsc::UnboundedSender<DocumentId>,
    ) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            inner: Arc::new(HandleInner {
                document_id,
                doc: Mutex::new(Some(AutoCommit::new())),
                state: RwLock::new(state),
                remote_heads: RwLock::new(HashMap::new()),
                events,
                changed,
            }),
        }
    }

    /// The document this handle owns.
    pub fn document_id(&self) -> DocumentId {
        self.inner.document_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        *self.inner.state.read().unwrap()
    }

    /// Subscribe to lifecycle and heads-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<DocHandleEvent> {
        self.inner.events.subscribe()
    }

    /// Run a closure against the snapshot.
    ///
    /// This is read access; it never emits a change event even if the
    /// closure mutates. Use [`DocHandle::change`] for mutations.
    pub fn with_doc<R>(&self, f: impl FnOnce(&mut AutoCommit) -> R) -> Result<R> {
        let mut guard = self.inner.doc.lock().unwrap();
        match guard.as_mut() {
            Some(doc) => Ok(f(doc)),
            None => Err(self.no_snapshot_error()),
        }
    }

    /// Apply a local mutation to the snapshot.
    ///
    /// The mutation runs synchronously under the handle's lock; two
    /// mutations of the same handle never interleave. If the heads changed,
    /// a `HeadsChanged` event is emitted and the repo is notified so it can
    /// push sync messages and schedule persistence.
    pub fn change<R>(&self, f: impl FnOnce(&mut AutoCommit) -> R) -> Result<R> {
        match self.state() {
            HandleState::Ready => {}
            HandleState::Deleted => {
                return Err(DocmeshError::DocumentDeleted(self.inner.document_id));
            }
            _ => return Err(DocmeshError::DocumentUnavailable(self.inner.document_id)),
        }

        let (result, new_heads) = {
            let mut guard = self.inner.doc.lock().unwrap();
            let doc = guard.as_mut().ok_or_else(|| self.no_snapshot_error())?;
            let before = doc.get_heads();
            let result = f(doc);
            doc.commit();
            let after = doc.get_heads();
            (result, (before != after).then_some(after))
        };

        if let Some(new_heads) = new_heads {
            self.emit_heads_changed(new_heads);
        }
        Ok(result)
    }

    /// The snapshot's current heads.
    pub fn heads(&self) -> Result<Vec<ChangeHash>> {
        self.with_doc(|doc| doc.get_heads())
    }

    /// Drop the in-memory snapshot, retaining the id mapping.
    ///
    /// Only valid from `ready`; a subsequent `find` for the same id
    /// re-triggers a load instead of creating a duplicate handle.
    pub fn unload(&self) -> Result<()> {
        let mut state = self.inner.state.write().unwrap();
        if *state != HandleState::Ready {
            return Err(DocmeshError::InvalidHandleState {
                document: self.inner.document_id,
                state: state.name(),
                required: "ready",
            });
        }
        *state = HandleState::Unloaded;
        *self.inner.doc.lock().unwrap() = None;
        debug!(document = %self.inner.document_id, "handle unloaded");
        Ok(())
    }

    /// Remote-heads bookkeeping: last known heads per storage identity.
    pub fn remote_heads(&self) -> HashMap<StorageId, RemoteHeads> {
        self.inner.remote_heads.read().unwrap().clone()
    }

    /// Snapshot access for the engine itself: no state check, no events.
    ///
    /// The sync driver and compactor use this while the handle is still
    /// `loading`, where the public accessors would refuse.
    pub(crate) fn with_doc_internal<R>(&self, f: impl FnOnce(&mut AutoCommit) -> R) -> Result<R> {
        let mut guard = self.inner.doc.lock().unwrap();
        match guard.as_mut() {
            Some(doc) => Ok(f(doc)),
            None => Err(self.no_snapshot_error()),
        }
    }

    /// Record gossiped heads for a storage identity.
    pub(crate) fn set_remote_heads(&self, storage_id: StorageId, heads: RemoteHeads) {
        self.inner
            .remote_heads
            .write()
            .unwrap()
            .insert(storage_id, heads);
    }

    /// Install a snapshot loaded from storage and become `ready`.
    pub(crate) fn install_loaded(&self, doc: AutoCommit) {
        *self.inner.doc.lock().unwrap() = Some(doc);
        *self.inner.state.write().unwrap() = HandleState::Ready;
    }

    /// Re-enter `loading` from `unloaded` with a fresh empty snapshot.
    pub(crate) fn begin_reload(&self) {
        *self.inner.doc.lock().unwrap() = Some(AutoCommit::new());
        *self.inner.state.write().unwrap() = HandleState::Loading;
    }

    /// Mark the handle unavailable. Only meaningful while `loading`.
    pub(crate) fn set_unavailable(&self) {
        let mut state = self.inner.state.write().unwrap();
        if *state == HandleState::Loading {
            *state = HandleState::Unavailable;
            drop(state);
            let _ = self.inner.events.send(DocHandleEvent::Unavailable);
        }
    }

    /// Mark the handle deleted and drop the snapshot. Irreversible.
    pub(crate) fn mark_deleted(&self) {
        *self.inner.state.write().unwrap() = HandleState::Deleted;
        *self.inner.doc.lock().unwrap() = None;
        let _ = self.inner.events.send(DocHandleEvent::Deleted);
    }

    /// Record that a sync message changed the snapshot's heads.
    ///
    /// Also promotes a `loading` or `unavailable` handle to `ready`: a peer
    /// supplying data resolves the handle even after an unavailability
    /// verdict.
    pub(crate) fn note_heads_changed(&self, new_heads: Vec<ChangeHash>) {
        {
            let mut state = self.inner.state.write().unwrap();
            if matches!(*state, HandleState::Loading | HandleState::Unavailable) {
                *state = HandleState::Ready;
            }
        }
        self.emit_heads_changed(new_heads);
    }

    /// A requested document caught up with a peer that holds it.
    ///
    /// Promotes a `loading` handle to `ready` even when no heads moved: the
    /// document may simply be empty. Unlike [`DocHandle::note_heads_changed`]
    /// this never revives an `unavailable` handle; leaving unavailability
    /// takes actual data.
    pub(crate) fn note_synced(&self) {
        let mut state = self.inner.state.write().unwrap();
        if *state == HandleState::Loading {
            *state = HandleState::Ready;
        }
    }

    fn emit_heads_changed(&self, new_heads: Vec<ChangeHash>) {
        let _ = self
            .inner
            .events
            .send(DocHandleEvent::HeadsChanged { new_heads });
        let _ = self.inner.changed.send(self.inner.document_id);
    }

    fn no_snapshot_error(&self) -> DocmeshError {
        match self.state() {
            HandleState::Deleted => DocmeshError::DocumentDeleted(self.inner.document_id),
            _ => DocmeshError::DocumentUnavailable(self.inner.document_id),
        }
    }
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("document_id", &self.inner.document_id)
            .field("state", &self.state())
            .finish()
    }
}
