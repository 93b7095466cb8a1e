//! Per-document chunk progress and its event topic.
//!
//! Each tracked document owns one entry: a mutex-guarded snapshot plus a
//! broadcast channel. Every mutation happens under the entry lock and the
//! resulting event is sent before the lock is released, so subscribers see
//! events in exactly the order the counters changed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::model::{
    ChunkProgress, ChunkStatus, DocumentId, ProcessingStatus, ProgressEvent, ProgressEventKind,
};

/// Default time-to-live for tracker entries (1 hour).
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(3600);

const CHANNEL_CAPACITY: usize = 256;

struct EntryState {
    progress: ChunkProgress,
    chunks: BTreeMap<usize, ChunkStatus>,
    seq: u64,
    closed: bool,
    last_terminal: Option<ProgressEvent>,
    touched: Instant,
}

struct Entry {
    state: Mutex<EntryState>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl Entry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(EntryState {
                progress: ChunkProgress::default(),
                chunks: BTreeMap::new(),
                seq: 0,
                closed: false,
                last_terminal: None,
                touched: Instant::now(),
            }),
            tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stamp `event` with the next sequence number and broadcast it.
/// Must be called with the entry lock held.
fn publish(
    state: &mut EntryState,
    tx: &broadcast::Sender<ProgressEvent>,
    mut event: ProgressEvent,
) -> ProgressEvent {
    state.seq += 1;
    state.touched = Instant::now();
    event.seq = state.seq;
    event.emitted_at = Utc::now();
    // No receivers is fine: nobody is watching this document yet.
    let _ = tx.send(event.clone());
    event
}

fn draft(
    document_id: &DocumentId,
    kind: ProgressEventKind,
    snapshot: ChunkProgress,
) -> ProgressEvent {
    ProgressEvent {
        seq: 0,
        document_id: document_id.clone(),
        kind,
        chunk_index: None,
        chunk_status: None,
        overall_progress: snapshot.overall_progress(),
        snapshot,
        status: None,
        error: None,
        emitted_at: Utc::now(),
    }
}

/// Current state as a `progress` event, or the terminal event once closed.
fn snapshot_event(document_id: &DocumentId, state: &EntryState) -> ProgressEvent {
    if let Some(terminal) = &state.last_terminal {
        return terminal.clone();
    }
    let mut event = draft(document_id, ProgressEventKind::Progress, state.progress);
    event.seq = state.seq;
    event
}

/// Terminal snapshot; documents that never initialized count as one unit.
fn terminal_snapshot(progress: ChunkProgress, failed: bool) -> ChunkProgress {
    if progress.total > 0 {
        return progress;
    }
    ChunkProgress {
        total: 1,
        completed: usize::from(!failed),
        failed: usize::from(failed),
        processing: 0,
    }
}

pub struct ProgressTracker {
    entries: DashMap<DocumentId, Arc<Entry>>,
    ttl: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_TTL)
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn entry(&self, document_id: &DocumentId) -> Arc<Entry> {
        Arc::clone(
            self.entries
                .entry(document_id.clone())
                .or_insert_with(|| Arc::new(Entry::new()))
                .value(),
        )
    }

    fn existing(&self, document_id: &DocumentId) -> Option<Arc<Entry>> {
        self.entries.get(document_id).map(|e| Arc::clone(e.value()))
    }

    /// Reset the document to `total` pending chunks and emit `initialized`.
    pub fn initialize(&self, document_id: &DocumentId, total: usize) -> ProgressEvent {
        self.sweep_expired();
        let entry = self.entry(document_id);
        let mut state = entry.lock();
        state.progress = ChunkProgress::new(total);
        state.chunks = (1..=total).map(|i| (i, ChunkStatus::Pending)).collect();
        state.closed = false;
        state.last_terminal = None;
        tracing::debug!(document_id = %document_id, total, "progress initialized");
        let event = draft(document_id, ProgressEventKind::Initialized, state.progress);
        publish(&mut state, &entry.tx, event)
    }

    /// Atomically move one chunk to `status` and emit the matching event.
    ///
    /// Returns the new snapshot, or `None` when the transition was ignored:
    /// unknown document or chunk, closed document, a chunk that already
    /// finished, or a move back to pending.
    pub fn transition(
        &self,
        document_id: &DocumentId,
        chunk_index: usize,
        status: ChunkStatus,
        error: Option<String>,
    ) -> Option<ChunkProgress> {
        let Some(entry) = self.existing(document_id) else {
            tracing::warn!(document_id = %document_id, chunk = chunk_index, "transition for untracked document");
            return None;
        };
        let mut state = entry.lock();
        if state.closed {
            return None;
        }
        let Some(previous) = state.chunks.get(&chunk_index).copied() else {
            tracing::warn!(document_id = %document_id, chunk = chunk_index, "transition for unknown chunk");
            return None;
        };
        if previous.is_terminal() || status == ChunkStatus::Pending {
            tracing::debug!(
                document_id = %document_id,
                chunk = chunk_index,
                from = previous.as_str(),
                to = status.as_str(),
                "ignored chunk transition"
            );
            return None;
        }

        if previous == ChunkStatus::Processing {
            state.progress.processing = state.progress.processing.saturating_sub(1);
        }
        match status {
            ChunkStatus::Processing => state.progress.processing += 1,
            ChunkStatus::Completed => state.progress.completed += 1,
            ChunkStatus::Failed => state.progress.failed += 1,
            ChunkStatus::Pending => {}
        }
        state.chunks.insert(chunk_index, status);

        let kind = if status == ChunkStatus::Completed {
            ProgressEventKind::ChunkCompleted
        } else {
            ProgressEventKind::Progress
        };
        let mut event = draft(document_id, kind, state.progress);
        event.chunk_index = Some(chunk_index);
        event.chunk_status = Some(status);
        event.error = error;
        let snapshot = state.progress;
        publish(&mut state, &entry.tx, event);
        Some(snapshot)
    }

    /// Emit the terminal `completed` event. `final_status` distinguishes full
    /// from partial success. Returns `None` if the document was already closed.
    pub fn mark_completed(
        &self,
        document_id: &DocumentId,
        final_status: ProcessingStatus,
    ) -> Option<ProgressEvent> {
        self.close(document_id, ProgressEventKind::Completed, final_status, None)
    }

    /// Emit the terminal `error` event.
    pub fn mark_failed(&self, document_id: &DocumentId, error: &str) -> Option<ProgressEvent> {
        self.close(
            document_id,
            ProgressEventKind::Error,
            ProcessingStatus::Error,
            Some(error.to_string()),
        )
    }

    fn close(
        &self,
        document_id: &DocumentId,
        kind: ProgressEventKind,
        status: ProcessingStatus,
        error: Option<String>,
    ) -> Option<ProgressEvent> {
        let entry = self.entry(document_id);
        let mut state = entry.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        let failed = kind == ProgressEventKind::Error;
        let snapshot = terminal_snapshot(state.progress, failed);
        let mut event = draft(document_id, kind, snapshot);
        if !failed {
            event.overall_progress = 100.0;
        }
        event.status = Some(status);
        event.error = error;
        let event = publish(&mut state, &entry.tx, event);
        state.last_terminal = Some(event.clone());
        tracing::debug!(document_id = %document_id, kind = kind.as_str(), %status, "progress closed");
        Some(event)
    }

    pub fn read(&self, document_id: &DocumentId) -> Option<ChunkProgress> {
        self.existing(document_id).map(|e| e.lock().progress)
    }

    /// Per-chunk statuses in index order.
    pub fn chunk_statuses(&self, document_id: &DocumentId) -> Option<Vec<(usize, ChunkStatus)>> {
        self.existing(document_id)
            .map(|e| e.lock().chunks.iter().map(|(i, s)| (*i, *s)).collect())
    }

    /// Number of events emitted for the document so far.
    pub fn emitted_count(&self, document_id: &DocumentId) -> u64 {
        self.existing(document_id).map_or(0, |e| e.lock().seq)
    }

    pub fn is_tracked(&self, document_id: &DocumentId) -> bool {
        self.entries.contains_key(document_id)
    }

    /// Follow a document: a snapshot first, then every later event.
    pub fn subscribe(&self, document_id: &DocumentId) -> Subscription {
        let entry = self.entry(document_id);
        let state = entry.lock();
        let rx = entry.tx.subscribe();
        let initial = snapshot_event(document_id, &state);
        let last_seq = initial.seq;
        drop(state);
        Subscription {
            document_id: document_id.clone(),
            entry: Arc::downgrade(&entry),
            rx,
            initial: Some(initial),
            last_seq,
            done: false,
        }
    }

    /// Forget a document. Open subscriptions end once nothing else holds the entry.
    pub fn clear(&self, document_id: &DocumentId) -> bool {
        self.entries.remove(document_id).is_some()
    }

    /// Forget a document whose topic is already closed, so a new run can
    /// publish its own terminal event. Live topics are left alone.
    pub fn clear_closed(&self, document_id: &DocumentId) -> bool {
        self.entries
            .remove_if(document_id, |_, entry| entry.lock().closed)
            .is_some()
    }

    /// Drop entries untouched for longer than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.lock().touched.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "expired progress entries swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered view of one document's topic.
pub struct Subscription {
    document_id: DocumentId,
    entry: Weak<Entry>,
    rx: broadcast::Receiver<ProgressEvent>,
    initial: Option<ProgressEvent>,
    last_seq: u64,
    done: bool,
}

impl Subscription {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Next event, or `None` once a terminal event has been delivered or the
    /// document stopped being tracked.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.initial.take() {
            return Some(self.deliver(event));
        }
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.seq <= self.last_seq => continue,
                Ok(event) => return Some(self.deliver(event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(document_id = %self.document_id, skipped, "subscriber lagged, resyncing");
                    let entry = self.entry.upgrade()?;
                    let state = entry.lock();
                    // Drain whatever is queued: the fresh snapshot covers it.
                    while self.rx.try_recv().is_ok() {}
                    let event = snapshot_event(&self.document_id, &state);
                    drop(state);
                    return Some(self.deliver(event));
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_seq = self.last_seq.max(event.seq);
        if event.kind.is_terminal() {
            self.done = true;
        }
        event
    }

    pub fn into_stream(self) -> impl tokio_stream::Stream<Item = ProgressEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn doc() -> DocumentId {
        DocumentId::from("doc-1")
    }

    #[test]
    fn initialize_resets_and_emits() {
        let tracker = ProgressTracker::default();
        let event = tracker.initialize(&doc(), 3);
        assert_eq!(event.kind, ProgressEventKind::Initialized);
        assert_eq!(event.seq, 1);
        assert_eq!(tracker.read(&doc()), Some(ChunkProgress::new(3)));
        assert_eq!(
            tracker.chunk_statuses(&doc()).unwrap(),
            vec![
                (1, ChunkStatus::Pending),
                (2, ChunkStatus::Pending),
                (3, ChunkStatus::Pending)
            ]
        );
    }

    #[test]
    fn transitions_move_counters() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 2);
        let p = tracker
            .transition(&doc(), 1, ChunkStatus::Processing, None)
            .unwrap();
        assert_eq!(p.processing, 1);
        let p = tracker
            .transition(&doc(), 1, ChunkStatus::Completed, None)
            .unwrap();
        assert_eq!((p.processing, p.completed), (0, 1));
        assert!((p.overall_progress() - 50.0).abs() < f64::EPSILON);
        let p = tracker
            .transition(&doc(), 2, ChunkStatus::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!((p.completed, p.failed, p.processing), (1, 1, 0));
        assert!(p.is_done());
    }

    #[test]
    fn terminal_chunks_are_never_double_counted() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 2);
        tracker.transition(&doc(), 1, ChunkStatus::Completed, None);
        assert!(tracker
            .transition(&doc(), 1, ChunkStatus::Completed, None)
            .is_none());
        assert!(tracker
            .transition(&doc(), 1, ChunkStatus::Failed, None)
            .is_none());
        assert!(tracker
            .transition(&doc(), 2, ChunkStatus::Pending, None)
            .is_none());
        assert!(tracker
            .transition(&doc(), 9, ChunkStatus::Processing, None)
            .is_none());
        assert_eq!(tracker.read(&doc()).unwrap().completed, 1);
        assert_eq!(tracker.emitted_count(&doc()), 2);
    }

    #[test]
    fn retry_reemits_without_changing_counts() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 1);
        tracker.transition(&doc(), 1, ChunkStatus::Processing, None);
        let p = tracker
            .transition(&doc(), 1, ChunkStatus::Processing, Some("503".into()))
            .unwrap();
        assert_eq!(p.processing, 1);
        assert_eq!(tracker.emitted_count(&doc()), 3);
    }

    #[test]
    fn untracked_document_transitions_are_ignored() {
        let tracker = ProgressTracker::default();
        assert!(tracker
            .transition(&doc(), 1, ChunkStatus::Processing, None)
            .is_none());
        assert!(!tracker.is_tracked(&doc()));
    }

    #[test]
    fn terminal_events_close_the_entry_once() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 2);
        tracker.transition(&doc(), 1, ChunkStatus::Completed, None);
        tracker.transition(&doc(), 2, ChunkStatus::Failed, None);
        let event = tracker
            .mark_completed(&doc(), ProcessingStatus::PartialError)
            .unwrap();
        assert_eq!(event.kind, ProgressEventKind::Completed);
        assert_eq!(event.status, Some(ProcessingStatus::PartialError));
        assert_eq!(event.overall_progress, 100.0);
        assert!(tracker.mark_failed(&doc(), "late").is_none());
        assert!(tracker
            .transition(&doc(), 1, ChunkStatus::Processing, None)
            .is_none());
    }

    #[test]
    fn single_unit_documents_get_one_unit_snapshots() {
        let tracker = ProgressTracker::default();
        let event = tracker
            .mark_completed(&doc(), ProcessingStatus::Completed)
            .unwrap();
        assert_eq!(
            event.snapshot,
            ChunkProgress {
                total: 1,
                completed: 1,
                failed: 0,
                processing: 0
            }
        );
        assert_eq!(tracker.emitted_count(&doc()), 1);

        let other = DocumentId::from("doc-2");
        let event = tracker.mark_failed(&other, "bad pdf").unwrap();
        assert_eq!(event.snapshot.failed, 1);
        assert_eq!(event.error.as_deref(), Some("bad pdf"));
        assert_eq!(event.status, Some(ProcessingStatus::Error));
    }

    #[tokio::test]
    async fn subscriber_gets_snapshot_then_deltas() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 2);
        tracker.transition(&doc(), 1, ChunkStatus::Processing, None);

        let mut sub = tracker.subscribe(&doc());
        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, ProgressEventKind::Progress);
        assert_eq!(first.chunk_index, None);
        assert_eq!(first.snapshot.processing, 1);
        assert_eq!(first.seq, 2);

        tracker.transition(&doc(), 1, ChunkStatus::Completed, None);
        tracker.transition(&doc(), 2, ChunkStatus::Completed, None);
        tracker.mark_completed(&doc(), ProcessingStatus::Completed);

        let kinds: Vec<_> = sub.into_stream().map(|e| e.kind).collect().await;
        assert_eq!(
            kinds,
            vec![
                ProgressEventKind::ChunkCompleted,
                ProgressEventKind::ChunkCompleted,
                ProgressEventKind::Completed
            ]
        );
    }

    #[tokio::test]
    async fn late_subscriber_sees_terminal_event_and_ends() {
        let tracker = ProgressTracker::default();
        tracker.mark_failed(&doc(), "soft limit");
        let mut sub = tracker.subscribe(&doc());
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, ProgressEventKind::Error);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_resyncs_with_snapshot() {
        let tracker = ProgressTracker::default();
        let total = CHANNEL_CAPACITY + 50;
        tracker.initialize(&doc(), total);
        let mut sub = tracker.subscribe(&doc());
        assert_eq!(sub.next().await.unwrap().seq, 1);

        for i in 1..=total {
            tracker.transition(&doc(), i, ChunkStatus::Completed, None);
        }
        let resync = sub.next().await.unwrap();
        assert_eq!(resync.kind, ProgressEventKind::Progress);
        assert_eq!(resync.snapshot.completed, total);

        tracker.mark_completed(&doc(), ProcessingStatus::Completed);
        let last = sub.next().await.unwrap();
        assert_eq!(last.kind, ProgressEventKind::Completed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn clear_ends_open_subscriptions() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 1);
        let mut sub = tracker.subscribe(&doc());
        sub.next().await.unwrap();
        assert!(tracker.clear(&doc()));
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn clear_closed_keeps_live_topics() {
        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 2);
        assert!(!tracker.clear_closed(&doc()));
        assert!(tracker.is_tracked(&doc()));

        tracker.mark_failed(&doc(), "boom");
        assert!(tracker.clear_closed(&doc()));
        assert!(!tracker.is_tracked(&doc()));
        assert!(tracker.mark_completed(&doc(), ProcessingStatus::Completed).is_some());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.initialize(&doc(), 1);
        assert_eq!(tracker.sweep_expired(), 1);
        assert!(tracker.is_empty());

        let tracker = ProgressTracker::default();
        tracker.initialize(&doc(), 1);
        assert_eq!(tracker.sweep_expired(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_lose_no_updates() {
        let tracker = Arc::new(ProgressTracker::default());
        let total = 200;
        tracker.initialize(&doc(), total);
        let mut sub = tracker.subscribe(&doc());

        let mut handles = Vec::new();
        for i in 1..=total {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker.transition(&doc(), i, ChunkStatus::Processing, None);
                tokio::task::yield_now().await;
                let status = if i % 7 == 0 {
                    ChunkStatus::Failed
                } else {
                    ChunkStatus::Completed
                };
                tracker.transition(&doc(), i, status, None);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let p = tracker.read(&doc()).unwrap();
        assert_eq!(p.completed + p.failed, total);
        assert_eq!(p.failed, total / 7);
        assert_eq!(p.processing, 0);

        tracker.mark_completed(&doc(), ProcessingStatus::PartialError);
        let mut last_touched = 0;
        let mut last_seq = 0;
        while let Some(event) = sub.next().await {
            assert!(event.snapshot.touched() <= event.snapshot.total);
            assert!(event.snapshot.touched() >= last_touched);
            assert!(event.seq > last_seq || event.seq == 0);
            last_touched = event.snapshot.touched();
            last_seq = event.seq;
        }
    }
}
