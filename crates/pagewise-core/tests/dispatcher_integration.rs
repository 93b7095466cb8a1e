//! Integration tests for [`Dispatcher`] and [`ExtractionWorker`] together.
//!
//! Every test runs on a paused clock with a [`MockExtractor`], so backoff
//! sleeps and per-call latency cost no real time.

use std::sync::Arc;
use std::time::Duration;

use pagewise_core::extract::{MockExtractor, MockResponse};
use pagewise_core::{
    ChunkJob, ChunkOutcome, ChunkPlanner, ConcurrencyGate, Dispatcher, DocumentId,
    ExtractionError, ExtractionWorker, PageRange, PlannedChunk, ProgressTracker, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

fn jobs(total_pages: usize, chunk_size: usize) -> Vec<ChunkJob> {
    let ranges = ChunkPlanner::new(chunk_size, 0, 0.0).page_ranges(total_pages);
    let total = ranges.len();
    ranges
        .into_iter()
        .enumerate()
        .map(|(i, range)| {
            ChunkJob::chunk(
                PlannedChunk {
                    index: i + 1,
                    range,
                    payload: b"%PDF-1.7".to_vec(),
                },
                total,
            )
        })
        .collect()
}

fn worker(mock: Arc<MockExtractor>, gate: ConcurrencyGate) -> Arc<ExtractionWorker> {
    Arc::new(ExtractionWorker::new(
        mock,
        gate,
        Duration::from_secs(120),
        RetryPolicy::default(),
    ))
}

async fn run(
    dispatcher: &Dispatcher,
    tracker: &Arc<ProgressTracker>,
    id: &str,
    jobs: Vec<ChunkJob>,
) -> Vec<ChunkOutcome> {
    let doc = DocumentId::from(id);
    tracker.initialize(&doc, jobs.len());
    dispatcher
        .dispatch(&doc, jobs, Arc::clone(tracker), CancellationToken::new())
        .await
}

#[tokio::test(start_paused = true)]
async fn global_gate_caps_calls_across_documents() {
    let mock = Arc::new(MockExtractor::pages().with_delay(Duration::from_millis(250)));
    let gate = ConcurrencyGate::new(2);
    let shared = worker(mock.clone(), gate.clone());
    // Each document alone could run four chunks at once.
    let a = Dispatcher::new(Arc::clone(&shared), 4);
    let b = Dispatcher::new(shared, 4);
    let tracker = Arc::new(ProgressTracker::default());

    let (first, second) = tokio::join!(
        run(&a, &tracker, "doc-a", jobs(80, 10)),
        run(&b, &tracker, "doc-b", jobs(60, 10)),
    );

    assert_eq!(first.len(), 8);
    assert_eq!(second.len(), 6);
    assert!(first.iter().chain(&second).all(ChunkOutcome::is_success));
    assert_eq!(mock.call_count(), 14);
    assert_eq!(mock.peak_in_flight(), 2);
    assert_eq!(gate.peak(), 2);
    assert_eq!(gate.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_the_attempt_budget() {
    let failing = PageRange::new(11, 20);
    let mock = Arc::new(MockExtractor::pages().script_range(
        failing,
        vec![MockResponse::Fail(ExtractionError::Server {
            code: 502,
            message: "bad gateway".into(),
        })],
    ));
    let dispatcher = Dispatcher::new(worker(mock.clone(), ConcurrencyGate::new(4)), 4);
    let tracker = Arc::new(ProgressTracker::default());

    let outcomes = run(&dispatcher, &tracker, "budget", jobs(30, 10)).await;

    assert_eq!(mock.calls_for(Some(failing)), 5);
    assert_eq!(outcomes[1].attempts, 5);
    assert_eq!(
        outcomes[1].error_message().as_deref(),
        Some("server error 502: bad gateway")
    );
    assert_eq!(mock.calls_for(Some(PageRange::new(1, 10))), 1);
    assert_eq!(mock.calls_for(Some(PageRange::new(21, 30))), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_is_not_retried() {
    let failing = PageRange::new(1, 10);
    let mock = Arc::new(MockExtractor::pages().script_range(
        failing,
        vec![MockResponse::Fail(ExtractionError::Server {
            code: 400,
            message: "invalid pdf".into(),
        })],
    ));
    let dispatcher = Dispatcher::new(worker(mock.clone(), ConcurrencyGate::new(4)), 2);
    let tracker = Arc::new(ProgressTracker::default());

    let outcomes = run(&dispatcher, &tracker, "fatal", jobs(20, 10)).await;

    assert_eq!(mock.calls_for(Some(failing)), 1);
    assert_eq!(outcomes[0].attempts, 1);
    assert!(outcomes[1].is_success());
}

#[tokio::test(start_paused = true)]
async fn rate_limit_hint_stretches_the_wait() {
    let range = PageRange::new(1, 10);
    let mock = Arc::new(MockExtractor::pages().script_range(
        range,
        vec![
            MockResponse::Fail(ExtractionError::RateLimited {
                retry_after: Some(Duration::from_secs(90)),
            }),
            MockResponse::Pages { confidence: "High" },
        ],
    ));
    let dispatcher = Dispatcher::new(worker(mock.clone(), ConcurrencyGate::new(1)), 1);
    let tracker = Arc::new(ProgressTracker::default());

    let started = tokio::time::Instant::now();
    let outcomes = run(&dispatcher, &tracker, "limited", jobs(10, 10)).await;
    let waited = started.elapsed();

    assert!(outcomes[0].is_success());
    assert_eq!(outcomes[0].attempts, 2);
    assert!(waited >= Duration::from_secs(90), "waited {waited:?}");
    assert!(waited < Duration::from_secs(100), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn hanging_calls_hit_the_per_call_timeout() {
    let range = PageRange::new(1, 5);
    let mock = Arc::new(
        MockExtractor::pages().script_range(range, vec![MockResponse::Hang]),
    );
    let short = Arc::new(ExtractionWorker::new(
        mock.clone(),
        ConcurrencyGate::new(2),
        Duration::from_secs(5),
        RetryPolicy::new(2),
    ));
    let dispatcher = Dispatcher::new(short, 2);
    let tracker = Arc::new(ProgressTracker::default());

    let outcomes = run(&dispatcher, &tracker, "hang", jobs(10, 5)).await;

    assert_eq!(mock.calls_for(Some(range)), 2);
    assert_eq!(
        outcomes[0].result,
        Err(ExtractionError::Timeout(Duration::from_secs(5)))
    );
    assert!(outcomes[1].is_success());
    let p = tracker.read(&DocumentId::from("hang")).unwrap();
    assert_eq!((p.completed, p.failed, p.processing), (1, 1, 0));
}
