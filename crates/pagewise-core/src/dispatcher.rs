//! Bounded fan-out of chunk jobs and the completion barrier that gathers them.
//!
//! Architecture: every job goes onto one `async_channel` queue; `min(C, N)`
//! worker tasks pull from it, so at most C chunks of a document are in flight.
//! Each finished job reports into a [`JobGroup`]; the task that fills the
//! last slot fires the group's completion handler, exactly once.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::extract::ExtractionError;
use crate::model::{ChunkStatus, DocumentId, PageRange};
use crate::progress::ProgressTracker;
use crate::worker::{ChunkJob, ChunkOutcome, ExtractionWorker, WorkerEvent};

/// Completion barrier over a fixed number of result slots.
///
/// Each slot accepts one value; later reports for a filled slot are ignored.
/// When the last slot fills, all values are sent, in slot order, on the
/// receiver returned by [`JobGroup::new`].
pub struct JobGroup<T> {
    slots: Mutex<Vec<Option<T>>>,
    /// Slots still empty. Each slot decrements once.
    remaining: AtomicUsize,
    /// Taken exactly once by [`JobGroup::finalize`].
    done_tx: Mutex<Option<oneshot::Sender<Vec<T>>>>,
}

impl<T> JobGroup<T> {
    pub fn new(size: usize) -> (Arc<Self>, oneshot::Receiver<Vec<T>>) {
        let (tx, rx) = oneshot::channel();
        let group = Arc::new(Self {
            slots: Mutex::new((0..size).map(|_| None).collect()),
            remaining: AtomicUsize::new(size),
            done_tx: Mutex::new(Some(tx)),
        });
        if size == 0 {
            group.finalize();
        }
        (group, rx)
    }

    /// Record the value for `slot`. Returns `false` if the slot was already
    /// filled or does not exist.
    pub fn complete(&self, slot: usize, value: T) -> bool {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(slot) {
                Some(s) if s.is_none() => *s = Some(value),
                _ => return false,
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
        true
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn finalize(&self) {
        let Some(tx) = self
            .done_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let values: Vec<T> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .flatten()
            .collect();
        let _ = tx.send(values);
    }
}

pub struct Dispatcher {
    worker: Arc<ExtractionWorker>,
    per_document: usize,
}

struct Slot {
    position: usize,
    job: ChunkJob,
}

impl Dispatcher {
    /// `per_document` of zero is treated as one.
    pub fn new(worker: Arc<ExtractionWorker>, per_document: usize) -> Self {
        Self {
            worker,
            per_document: per_document.max(1),
        }
    }

    pub fn per_document(&self) -> usize {
        self.per_document
    }

    pub fn worker(&self) -> &Arc<ExtractionWorker> {
        &self.worker
    }

    /// Run every job to a terminal outcome and return the outcomes in
    /// submission order. Chunk transitions are reported to `tracker`.
    ///
    /// After `cancel` fires, jobs still waiting in the queue and jobs in
    /// flight end as failures, so the group always completes.
    pub async fn dispatch(
        &self,
        document_id: &DocumentId,
        jobs: Vec<ChunkJob>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Vec<ChunkOutcome> {
        let total = jobs.len();
        let index_ranges: Vec<(usize, PageRange)> =
            jobs.iter().map(|j| (j.index, j.range)).collect();
        let (group, done_rx) = JobGroup::<ChunkOutcome>::new(total);
        let (job_tx, job_rx) = async_channel::unbounded::<Slot>();
        for (position, job) in jobs.into_iter().enumerate() {
            let _ = job_tx.send(Slot { position, job }).await;
        }
        job_tx.close();

        let workers = self.per_document.min(total);
        tracing::info!(document_id = %document_id, chunks = total, workers, "dispatching chunks");

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(tokio::spawn(chunk_loop(
                job_rx.clone(),
                Arc::clone(&self.worker),
                Arc::clone(&tracker),
                Arc::clone(&group),
                document_id.clone(),
                cancel.clone(),
            )));
        }
        drop(job_rx);
        drop(group);

        let outcomes = match done_rx.await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                // Every worker task exited without filling all slots.
                tracing::error!(document_id = %document_id, "chunk workers exited early");
                index_ranges
                    .into_iter()
                    .map(|(index, range)| ChunkOutcome {
                        index,
                        range,
                        attempts: 0,
                        result: Err(ExtractionError::Other("chunk worker exited".to_string())),
                    })
                    .collect()
            }
        };

        for h in handles {
            let _ = h.await;
        }
        outcomes
    }
}

async fn chunk_loop(
    rx: async_channel::Receiver<Slot>,
    worker: Arc<ExtractionWorker>,
    tracker: Arc<ProgressTracker>,
    group: Arc<JobGroup<ChunkOutcome>>,
    document_id: DocumentId,
    cancel: CancellationToken,
) {
    while let Ok(Slot { position, job }) = rx.recv().await {
        let outcome = if cancel.is_cancelled() {
            tracing::debug!(document_id = %document_id, chunk = job.index, "skipping: cancelled");
            ChunkOutcome::failed(&job, 0, "cancelled before start")
        } else {
            run_one(&worker, &tracker, &document_id, &job, &cancel).await
        };

        // A worker may stop without reporting its own terminal transition
        // (cancelled, panicked); the tracker ignores duplicates otherwise.
        let status = if outcome.is_success() {
            ChunkStatus::Completed
        } else {
            ChunkStatus::Failed
        };
        tracker.transition(&document_id, job.index, status, outcome.error_message());
        group.complete(position, outcome);
    }
}

async fn run_one(
    worker: &ExtractionWorker,
    tracker: &ProgressTracker,
    document_id: &DocumentId,
    job: &ChunkJob,
    cancel: &CancellationToken,
) -> ChunkOutcome {
    let on_event = |event: WorkerEvent| {
        let (status, error) = match event {
            WorkerEvent::Started => (ChunkStatus::Processing, None),
            WorkerEvent::Retrying { error, .. } => (ChunkStatus::Processing, Some(error)),
            WorkerEvent::Succeeded => (ChunkStatus::Completed, None),
            WorkerEvent::Failed { error } => (ChunkStatus::Failed, Some(error)),
        };
        tracker.transition(document_id, job.index, status, error);
    };

    let run = AssertUnwindSafe(worker.run(job, &on_event)).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => ChunkOutcome::failed(job, 0, "cancelled"),
        result = run => match result {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(document_id = %document_id, chunk = job.index, "chunk worker panicked");
                ChunkOutcome::failed(job, 0, "chunk worker panicked")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{
        ExtractionBackend, ExtractionError, ExtractionRequest, MockExtractor, MockResponse,
    };
    use crate::gate::ConcurrencyGate;
    use crate::planner::PlannedChunk;
    use crate::retry::RetryPolicy;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    fn jobs(total_pages: usize, size: usize) -> Vec<ChunkJob> {
        let planner = crate::planner::ChunkPlanner::new(size, 0, 0.0);
        let ranges = planner.page_ranges(total_pages);
        let n = ranges.len();
        ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| {
                ChunkJob::chunk(
                    PlannedChunk {
                        index: i + 1,
                        range,
                        payload: vec![],
                    },
                    n,
                )
            })
            .collect()
    }

    fn dispatcher(backend: Arc<dyn ExtractionBackend>, global: usize, per_doc: usize) -> Dispatcher {
        let worker = ExtractionWorker::new(
            backend,
            ConcurrencyGate::new(global),
            Duration::from_secs(120),
            RetryPolicy::new(5),
        );
        Dispatcher::new(Arc::new(worker), per_doc)
    }

    #[test]
    fn group_fires_once_after_all_slots() {
        let (group, mut rx) = JobGroup::<u32>::new(3);
        assert!(group.complete(2, 30));
        assert!(group.complete(0, 10));
        assert!(!group.complete(0, 11));
        assert!(!group.complete(7, 0));
        assert!(rx.try_recv().is_err());
        assert!(group.complete(1, 20));
        assert_eq!(rx.try_recv().unwrap(), vec![10, 20, 30]);
        assert_eq!(group.remaining(), 0);
        assert!(!group.complete(1, 21));
    }

    #[test]
    fn empty_group_completes_immediately() {
        let (_group, mut rx) = JobGroup::<u32>::new(0);
        assert_eq!(rx.try_recv().unwrap(), Vec::<u32>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn per_document_bound_holds_with_many_chunks() {
        let mock = Arc::new(MockExtractor::pages().with_delay(Duration::from_millis(100)));
        let d = dispatcher(mock.clone(), 16, 3);
        let tracker = Arc::new(ProgressTracker::default());
        let doc = DocumentId::from("many");
        let jobs = jobs(200, 5);
        tracker.initialize(&doc, jobs.len());

        let outcomes = d
            .dispatch(&doc, jobs, Arc::clone(&tracker), CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 40);
        assert!(outcomes.iter().all(ChunkOutcome::is_success));
        assert_eq!(mock.peak_in_flight(), 3);
        assert_eq!(tracker.read(&doc).unwrap().completed, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_keep_submission_order_despite_completion_order() {
        // Earlier chunks are slower, so they finish last.
        let mut mock = MockExtractor::pages();
        for (i, range) in crate::planner::ChunkPlanner::new(10, 0, 0.0)
            .page_ranges(50)
            .into_iter()
            .enumerate()
        {
            mock = mock.with_range_delay(range, Duration::from_millis(500 - 100 * i as u64));
        }
        let d = dispatcher(Arc::new(mock), 8, 8);
        let tracker = Arc::new(ProgressTracker::default());
        let doc = DocumentId::from("order");
        tracker.initialize(&doc, 5);

        let outcomes = d
            .dispatch(&doc, jobs(50, 10), tracker, CancellationToken::new())
            .await;
        let indices: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_chunk_does_not_stop_siblings() {
        let mock = Arc::new(MockExtractor::pages().script_range(
            PageRange::new(11, 20),
            vec![MockResponse::Fail(ExtractionError::Server {
                code: 503,
                message: "overloaded".into(),
            })],
        ));
        let d = dispatcher(mock.clone(), 4, 2);
        let tracker = Arc::new(ProgressTracker::default());
        let doc = DocumentId::from("partial");
        tracker.initialize(&doc, 3);

        let outcomes = d
            .dispatch(&doc, jobs(30, 10), Arc::clone(&tracker), CancellationToken::new())
            .await;

        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
        assert_eq!(mock.calls_for(Some(PageRange::new(11, 20))), 5);
        let p = tracker.read(&doc).unwrap();
        assert_eq!((p.completed, p.failed, p.processing), (2, 1, 0));
    }

    struct PanickingBackend;

    impl ExtractionBackend for PanickingBackend {
        fn name(&self) -> &str {
            "panics"
        }

        fn extract<'a>(
            &'a self,
            request: &'a ExtractionRequest,
        ) -> Pin<Box<dyn Future<Output = Result<String, ExtractionError>> + Send + 'a>> {
            Box::pin(async move {
                if request.pages == Some(PageRange::new(1, 10)) {
                    panic!("backend bug");
                }
                Ok("--- PAGE 11 ---\nok".to_string())
            })
        }
    }

    #[tokio::test]
    async fn panics_become_chunk_failures() {
        let d = dispatcher(Arc::new(PanickingBackend), 2, 2);
        let tracker = Arc::new(ProgressTracker::default());
        let doc = DocumentId::from("panic");
        tracker.initialize(&doc, 2);

        let outcomes = d
            .dispatch(&doc, jobs(20, 10), Arc::clone(&tracker), CancellationToken::new())
            .await;

        assert_eq!(
            outcomes[0].error_message().as_deref(),
            Some("chunk worker panicked")
        );
        assert!(outcomes[1].is_success());
        assert_eq!(tracker.read(&doc).unwrap().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_remaining_chunks() {
        let mock = Arc::new(MockExtractor::pages().with_delay(Duration::from_secs(10)));
        let d = dispatcher(mock.clone(), 1, 1);
        let tracker = Arc::new(ProgressTracker::default());
        let doc = DocumentId::from("cancel");
        tracker.initialize(&doc, 4);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let outcomes = d.dispatch(&doc, jobs(40, 10), Arc::clone(&tracker), cancel).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].is_success());
        assert!(outcomes[1..].iter().all(|o| !o.is_success()));
        assert_eq!(mock.call_count(), 2);
        let p = tracker.read(&doc).unwrap();
        assert_eq!((p.completed, p.failed, p.processing), (1, 3, 0));
    }
}
