//! Debounced persistence and snapshot compaction.
//!
//! Documents persist as one full snapshot chunk plus a run of contiguously
//! numbered incremental chunks under the document's URL prefix:
//!
//! ```text
//! [<url>, "snapshot"]
//! [<url>, "incremental", "00000000"]
//! [<url>, "incremental", "00000001"]
//! ```
//!
//! Change notifications are debounced; once the changes since the last
//! compaction reach the policy limit, the next save writes a full snapshot
//! and clears the incremental run atomically from the engine's point of
//! view (snapshot first, then the range delete).
//!
//! # Errors
//!
//! Storage failures during background saves are logged and dropped; the
//! in-memory snapshot is unaffected and the next save retries from scratch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use automerge::AutoCommit;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use docmesh_core::error::{DocmeshError, Result};
use docmesh_core::ids::DocumentId;
use docmesh_core::storage::{StorageAdapter, StorageKey};

use crate::handle::DocHandle;

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";

/// Tuning knobs for persistence.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    /// Changes since the last compaction that trigger a full snapshot.
    pub incremental_limit: usize,
    /// Debounce window between a change and the save that persists it.
    pub flush_delay: Duration,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            incremental_limit: 20,
            flush_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct DocCounters {
    /// Index of the next incremental chunk to write.
    next_index: u64,
    /// Changes noted since the last compaction (or initial load).
    since_compact: usize,
}

struct CompactorInner {
    storage: Arc<dyn StorageAdapter>,
    policy: CompactionPolicy,
    counters: Mutex<HashMap<DocumentId, DocCounters>>,
    pending: Mutex<HashMap<DocumentId, JoinHandle<()>>>,
}

/// Persists document snapshots with debouncing and compaction.
#[derive(Clone)]
pub struct StorageCompactor {
    inner: Arc<CompactorInner>,
}

impl StorageCompactor {
    pub fn new(storage: Arc<dyn StorageAdapter>, policy: CompactionPolicy) -> Self {
        Self {
            inner: Arc::new(CompactorInner {
                storage,
                policy,
                counters: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn snapshot_key(id: &DocumentId) -> StorageKey {
        StorageKey::new(vec![id.to_url(), SNAPSHOT.to_string()])
    }

    fn incremental_prefix(id: &DocumentId) -> StorageKey {
        StorageKey::new(vec![id.to_url(), INCREMENTAL.to_string()])
    }

    fn incremental_key(id: &DocumentId, index: u64) -> StorageKey {
        Self::incremental_prefix(id).with_component(format!("{index:08}"))
    }

    /// Record one change notification for `id`.
    pub fn note_change(&self, id: DocumentId) {
        self.inner
            .counters
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .since_compact += 1;
    }

    /// Schedule a debounced save for the handle's document.
    ///
    /// Multiple calls within the debounce window coalesce into one save, so
    /// a burst of changes persists as a single chunk.
    pub fn schedule_save(&self, handle: &DocHandle) {
        let id = handle.document_id();
        let mut pending = self.inner.pending.lock().unwrap();
        if pending.contains_key(&id) {
            return;
        }

        let compactor = self.clone();
        let handle = handle.clone();
        let delay = self.inner.policy.flush_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            compactor.inner.pending.lock().unwrap().remove(&id);
            if let Err(e) = compactor.save_now(&handle).await {
                warn!(document = %id, error = %e, "background save failed");
            }
        });
        pending.insert(id, task);
    }

    /// Persist the handle's snapshot immediately.
    ///
    /// A no-op when nothing changed since the last save. Writes a full
    /// snapshot and clears the incremental run when the change count has
    /// reached the policy limit, an incremental chunk otherwise.
    pub async fn save_now(&self, handle: &DocHandle) -> Result<()> {
        let id = handle.document_id();
        let (since_compact, next_index) = {
            let counters = self.inner.counters.lock().unwrap();
            match counters.get(&id) {
                Some(c) if c.since_compact > 0 => (c.since_compact, c.next_index),
                _ => return Ok(()),
            }
        };

        // Counters are only decremented by the count observed above: a
        // change noted while a write is in flight keeps its count and gets
        // persisted by the next save.
        if since_compact >= self.inner.policy.incremental_limit {
            let data = handle.with_doc_internal(|doc| doc.save())?;
            self.inner
                .storage
                .save(&Self::snapshot_key(&id), &data)
                .await?;
            self.inner
                .storage
                .remove_range(&Self::incremental_prefix(&id))
                .await?;
            let mut counters = self.inner.counters.lock().unwrap();
            let entry = counters.entry(id).or_default();
            entry.next_index = 0;
            entry.since_compact = entry.since_compact.saturating_sub(since_compact);
            debug!(document = %id, changes = since_compact, "compacted to snapshot");
        } else {
            let data = handle.with_doc_internal(|doc| doc.save_incremental())?;
            let wrote = !data.is_empty();
            if wrote {
                self.inner
                    .storage
                    .save(&Self::incremental_key(&id, next_index), &data)
                    .await?;
            }
            let mut counters = self.inner.counters.lock().unwrap();
            let entry = counters.entry(id).or_default();
            if wrote {
                // Advancing past a chunk that was never written would leave
                // exactly the gap the load path truncates at.
                entry.next_index = next_index + 1;
            }
            entry.since_compact = entry.since_compact.saturating_sub(since_compact);
        }
        Ok(())
    }

    /// Load a document from storage, if any of its chunks exist.
    ///
    /// Incrementals apply in index order and stop at the first gap. Chunks
    /// beyond a gap are unreachable and ignored; the loaded snapshot is the
    /// contiguous prefix, which the CRDT merge reconciles on the next sync.
    pub async fn load(&self, id: &DocumentId) -> Result<Option<AutoCommit>> {
        let snapshot = self.inner.storage.load(&Self::snapshot_key(id)).await?;
        let incrementals = self
            .inner
            .storage
            .load_range(&Self::incremental_prefix(id))
            .await?;
        if snapshot.is_none() && incrementals.is_empty() {
            return Ok(None);
        }

        let mut doc = match snapshot {
            Some(data) => AutoCommit::load(&data)
                .map_err(|e| DocmeshError::Crdt(format!("corrupt snapshot for {id}: {e}")))?,
            None => AutoCommit::new(),
        };

        let mut by_index: HashMap<u64, Vec<u8>> = HashMap::new();
        for chunk in incrementals {
            if let Some(index) = chunk.key.last().and_then(|c| c.parse::<u64>().ok()) {
                by_index.insert(index, chunk.data);
            }
        }
        let total = by_index.len();
        let mut next_index = 0u64;
        while let Some(data) = by_index.remove(&next_index) {
            doc.load_incremental(&data)
                .map_err(|e| DocmeshError::Crdt(format!("corrupt incremental for {id}: {e}")))?;
            next_index += 1;
        }
        if !by_index.is_empty() {
            warn!(
                document = %id,
                applied = next_index,
                total,
                "gap in incremental run, later chunks ignored"
            );
        }

        let mut counters = self.inner.counters.lock().unwrap();
        let entry = counters.entry(*id).or_default();
        entry.next_index = next_index;
        entry.since_compact = 0;
        Ok(Some(doc))
    }

    /// Flush every pending debounced save and wait for the writes.
    pub async fn flush(&self, handles: &[DocHandle]) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.abort();
        }
        for handle in handles {
            self.save_now(handle).await?;
        }
        Ok(())
    }

    /// Remove every stored chunk for `id` and forget its counters.
    pub async fn remove(&self, id: &DocumentId) -> Result<()> {
        if let Some(task) = self.inner.pending.lock().unwrap().remove(id) {
            task.abort();
        }
        self.inner
            .storage
            .remove_range(&StorageKey::new(vec![id.to_url()]))
            .await?;
        self.inner.counters.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleState;
    use async_trait::async_trait;
    use automerge::ReadDoc;
    use automerge::transaction::Transactable;
    use docmesh_core::storage::{Chunk, MemoryStorage};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{Notify, Semaphore, mpsc};

    fn ready_handle() -> DocHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        DocHandle::new(DocumentId::random(), HandleState::Ready, tx)
    }

    fn compactor(storage: Arc<MemoryStorage>, limit: usize) -> StorageCompactor {
        StorageCompactor::new(
            storage,
            CompactionPolicy {
                incremental_limit: limit,
                flush_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_below_limit_writes_incremental() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 20);
        let handle = ready_handle();
        let id = handle.document_id();

        handle
            .change(|doc| doc.put(automerge::ROOT, "k", "v").unwrap())
            .unwrap();
        compactor.note_change(id);
        compactor.save_now(&handle).await.unwrap();

        let keys = storage.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].last(), Some("00000000"));
    }

    #[tokio::test]
    async fn test_limit_reached_compacts_to_single_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 20);
        let handle = ready_handle();
        let id = handle.document_id();

        // A burst of changes coalesced into one save: limit reached means
        // the save is a full snapshot with no incrementals left behind.
        for i in 0..25 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
        }
        compactor.save_now(&handle).await.unwrap();

        let keys = storage.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].last(), Some(SNAPSHOT));
    }

    #[tokio::test]
    async fn test_compaction_clears_earlier_incrementals() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 3);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..2 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
            compactor.save_now(&handle).await.unwrap();
        }
        assert_eq!(storage.keys().len(), 2);

        for i in 2..5 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
        }
        compactor.save_now(&handle).await.unwrap();

        let keys = storage.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].last(), Some(SNAPSHOT));
    }

    #[tokio::test]
    async fn test_load_round_trips_snapshot_and_incrementals() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 100);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..3 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
            compactor.save_now(&handle).await.unwrap();
        }

        let mut loaded = compactor.load(&id).await.unwrap().unwrap();
        for i in 0..3 {
            assert!(
                loaded
                    .get(automerge::ROOT, format!("k{i}"))
                    .unwrap()
                    .is_some()
            );
        }
        assert_eq!(loaded.get_heads(), handle.heads().unwrap());
    }

    #[tokio::test]
    async fn test_load_stops_at_gap_in_incrementals() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 100);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..3 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
            compactor.save_now(&handle).await.unwrap();
        }
        storage
            .remove(&StorageCompactor::incremental_key(&id, 1))
            .await
            .unwrap();

        let mut loaded = compactor.load(&id).await.unwrap().unwrap();
        assert!(loaded.get(automerge::ROOT, "k0").unwrap().is_some());
        assert!(loaded.get(automerge::ROOT, "k1").unwrap().is_none());
        assert!(loaded.get(automerge::ROOT, "k2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_missing_document_is_none() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage, 20);
        assert!(
            compactor
                .load(&DocumentId::random())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_save_without_changes_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 20);
        let handle = ready_handle();

        compactor.save_now(&handle).await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_save_debounces() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 100);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..5 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
            compactor.schedule_save(&handle);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Five changes, one debounced save, one chunk.
        assert_eq!(storage.len(), 1);
    }

    /// Delegates to [`MemoryStorage`] but blocks the first `save` until the
    /// test opens the gate, so a write can be held in flight.
    struct GatedStorage {
        inner: MemoryStorage,
        armed: AtomicBool,
        entered: Notify,
        release: Semaphore,
    }

    impl GatedStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                armed: AtomicBool::new(true),
                entered: Notify::new(),
                release: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageAdapter for GatedStorage {
        async fn load(&self, key: &StorageKey) -> docmesh_core::error::Result<Option<Vec<u8>>> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &StorageKey, data: &[u8]) -> docmesh_core::error::Result<()> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                let _ = self.release.acquire().await;
            }
            self.inner.save(key, data).await
        }

        async fn remove(&self, key: &StorageKey) -> docmesh_core::error::Result<()> {
            self.inner.remove(key).await
        }

        async fn load_range(&self, prefix: &StorageKey) -> docmesh_core::error::Result<Vec<Chunk>> {
            self.inner.load_range(prefix).await
        }

        async fn remove_range(&self, prefix: &StorageKey) -> docmesh_core::error::Result<()> {
            self.inner.remove_range(prefix).await
        }
    }

    #[tokio::test]
    async fn test_change_during_in_flight_save_is_flushed() {
        let storage = Arc::new(GatedStorage::new());
        let compactor = StorageCompactor::new(
            storage.clone(),
            CompactionPolicy {
                incremental_limit: 100,
                flush_delay: Duration::from_millis(1),
            },
        );
        let handle = ready_handle();
        let id = handle.document_id();

        handle
            .change(|doc| doc.put(automerge::ROOT, "first", 1).unwrap())
            .unwrap();
        compactor.note_change(id);
        let save = {
            let compactor = compactor.clone();
            let handle = handle.clone();
            tokio::spawn(async move { compactor.save_now(&handle).await.unwrap() })
        };
        storage.entered.notified().await;

        // Lands while the first save is blocked inside the backend; its
        // count must survive that save's bookkeeping.
        handle
            .change(|doc| doc.put(automerge::ROOT, "second", 2).unwrap())
            .unwrap();
        compactor.note_change(id);

        storage.release.add_permits(1);
        save.await.unwrap();
        compactor.flush(&[handle.clone()]).await.unwrap();

        let mut loaded = compactor.load(&id).await.unwrap().unwrap();
        assert!(loaded.get(automerge::ROOT, "second").unwrap().is_some());
        assert_eq!(loaded.get_heads(), handle.heads().unwrap());
    }

    #[tokio::test]
    async fn test_skipped_empty_incremental_leaves_no_gap() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 100);
        let handle = ready_handle();
        let id = handle.document_id();

        // A noted change with nothing new in the document produces no
        // chunk and must not burn an index.
        compactor.note_change(id);
        compactor.save_now(&handle).await.unwrap();
        assert!(storage.is_empty());

        handle
            .change(|doc| doc.put(automerge::ROOT, "k", "v").unwrap())
            .unwrap();
        compactor.note_change(id);
        compactor.save_now(&handle).await.unwrap();

        let keys = storage.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].last(), Some("00000000"));

        let mut loaded = compactor.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), handle.heads().unwrap());
    }

    #[tokio::test]
    async fn test_compaction_round_trips_identical_heads() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 20);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..25 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
        }
        compactor.save_now(&handle).await.unwrap();
        assert_eq!(storage.keys().len(), 1);

        let mut loaded = compactor.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.get_heads(), handle.heads().unwrap());
        for i in 0..25 {
            assert!(
                loaded
                    .get(automerge::ROOT, format!("k{i}"))
                    .unwrap()
                    .is_some()
            );
        }
    }

    #[tokio::test]
    async fn test_remove_deletes_all_chunks() {
        let storage = Arc::new(MemoryStorage::new());
        let compactor = compactor(storage.clone(), 100);
        let handle = ready_handle();
        let id = handle.document_id();

        for i in 0..3 {
            handle
                .change(|doc| doc.put(automerge::ROOT, format!("k{i}"), i).unwrap())
                .unwrap();
            compactor.note_change(id);
            compactor.save_now(&handle).await.unwrap();
        }
        assert!(!storage.is_empty());

        compactor.remove(&id).await.unwrap();
        assert!(storage.is_empty());
    }
}
