//! Parallel bulk indexing (write path).
//!
//! A write flattens its series into documents and runs a call-scoped bulk
//! session:
//!
//! ```text
//!                             ┌──▶ worker 0 ──▶ bulk_index
//! documents ──▶ [sync_channel]├──▶ worker 1 ──▶ bulk_index
//!                             └──▶ ...
//! ```
//!
//! All workers drain one bounded submission queue, so a worker stalled on a
//! slow commit does not hold documents back from the others. Each worker
//! buffers documents until their serialized size reaches the flush
//! threshold, then commits them in one bulk request. When the dispatcher
//! closes the queue every worker commits what it still holds,
//! so nothing stays buffered once [`write`] returns. Workers are scoped
//! threads and are always joined before [`write`] returns, on success and on
//! error alike.
//!
//! Failed commits are retried at the transport level only. Documents the
//! backend rejects individually are counted and logged, never retried.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{BulkResponse, SearchBackend};
use crate::codec;
use crate::config::AdapterConfig;
use crate::error::{BackendError, BulkError};
use crate::model::FlatDocument;
use crate::proto::TimeSeries;

/// Tuning of a bulk session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Buffered bytes per worker that trigger a commit.
    pub flush_bytes: usize,
    /// Bounded length of the shared submission queue.
    pub queue_capacity: usize,
    /// Transport-level retries per commit.
    pub retries: u32,
    /// Delay before the first retry; doubles with each attempt.
    pub retry_backoff: Duration,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            flush_bytes: 1 << 20,
            queue_capacity: 1000,
            retries: 0,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl BulkConfig {
    /// Extracts bulk tuning from the adapter configuration.
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            workers: config.workers,
            flush_bytes: config.flush_bytes(),
            queue_capacity: config.queue_capacity,
            retries: config.bulk_retries,
            ..Self::default()
        }
    }
}

/// Per-worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker index.
    pub index: usize,
    /// Documents currently buffered by the worker.
    pub queued: usize,
    /// Commits issued by the worker.
    pub commits: u64,
    /// Duration of the worker's most recent commit.
    pub last_duration: Duration,
}

/// Cumulative statistics of one bulk session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Commits attempted.
    pub flushed: u64,
    /// Commits the backend answered.
    pub committed: u64,
    /// Documents sent in answered commits.
    pub indexed: u64,
    /// Documents created.
    pub created: u64,
    /// Documents updated.
    pub updated: u64,
    /// Documents deleted.
    pub deleted: u64,
    /// Documents accepted.
    pub succeeded: u64,
    /// Documents rejected or lost in a failed commit.
    pub failed: u64,
    /// Per-worker breakdown.
    pub workers: Vec<WorkerStats>,
}

impl BulkStats {
    fn with_workers(count: usize) -> Self {
        Self {
            workers: (0..count)
                .map(|index| WorkerStats {
                    index,
                    ..WorkerStats::default()
                })
                .collect(),
            ..Self::default()
        }
    }

    fn log(&self, execution_id: u64) {
        tracing::info!(
            execution_id,
            flushed = self.flushed,
            committed = self.committed,
            indexed = self.indexed,
            created = self.created,
            updated = self.updated,
            deleted = self.deleted,
            succeeded = self.succeeded,
            failed = self.failed,
            "bulk stats"
        );
        for w in &self.workers {
            tracing::debug!(
                worker = w.index,
                queued = w.queued,
                commits = w.commits,
                last_duration_ms = w.last_duration.as_millis(),
                "bulk worker stats"
            );
        }
    }
}

/// State shared by the workers of one session.
struct Session {
    stats: Mutex<BulkStats>,
    queued: Vec<AtomicUsize>,
    executions: AtomicU64,
    first_error: Mutex<Option<BulkError>>,
}

impl Session {
    fn new(workers: usize) -> Self {
        Self {
            stats: Mutex::new(BulkStats::with_workers(workers)),
            queued: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            executions: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    fn stats(&self) -> MutexGuard<'_, BulkStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_error(&self, error: BulkError) {
        let mut slot = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn into_result(self, total: u64) -> Result<BulkStats, BulkError> {
        if let Some(error) = self
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }

        let mut stats = self.stats.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (w, queued) in stats.workers.iter_mut().zip(&self.queued) {
            w.queued = queued.load(Ordering::Relaxed);
        }
        if stats.failed > 0 {
            return Err(BulkError::ItemsRejected {
                failed: stats.failed,
                total,
            });
        }
        Ok(stats)
    }
}

/// Flattens `series` and indexes every resulting document.
///
/// # Errors
///
/// Returns the first `BulkError::CommitFailed` if any commit failed after
/// its retries, `BulkError::ItemsRejected` if the backend rejected
/// individual documents, or a session setup error. Documents already
/// committed stay in the backend either way.
pub fn write<B: SearchBackend + ?Sized>(
    backend: &B,
    config: &BulkConfig,
    series: &[TimeSeries],
) -> Result<BulkStats, BulkError> {
    if config.workers == 0 {
        return Err(BulkError::NoWorkers);
    }

    let documents = codec::flatten(series);
    let total = documents.len() as u64;
    let session = Session::new(config.workers);
    if documents.is_empty() {
        return session.into_result(0);
    }

    let (tx, rx) = mpsc::sync_channel::<FlatDocument>(config.queue_capacity.max(1));
    let queue = Mutex::new(rx);

    thread::scope(|scope| -> Result<(), BulkError> {
        for worker in 0..config.workers {
            let (queue, session) = (&queue, &session);
            thread::Builder::new()
                .name(format!("bulk-worker-{worker}"))
                .spawn_scoped(scope, move || run_worker(worker, queue, backend, config, session))
                .map_err(|source| BulkError::WorkerSpawn { worker, source })?;
        }

        for doc in documents {
            // Blocks while the queue is full.
            tx.send(doc).map_err(|_| BulkError::WorkerGone)?;
        }

        // Closing the queue triggers the final flush.
        drop(tx);
        Ok(())
    })?;

    session.into_result(total)
}

fn run_worker<B: SearchBackend + ?Sized>(
    worker: usize,
    queue: &Mutex<Receiver<FlatDocument>>,
    backend: &B,
    config: &BulkConfig,
    session: &Session,
) {
    let mut buffer = Vec::new();
    let mut buffered_bytes = 0usize;

    loop {
        // The guard is released before the document is handled.
        let received = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(doc) = received else {
            break;
        };
        buffered_bytes += encoded_len(&doc);
        buffer.push(doc);
        session.queued[worker].store(buffer.len(), Ordering::Relaxed);

        if buffered_bytes >= config.flush_bytes {
            commit(worker, &buffer, backend, config, session);
            buffer.clear();
            buffered_bytes = 0;
        }
    }

    if !buffer.is_empty() {
        commit(worker, &buffer, backend, config, session);
    }
}

/// Approximate size of a document in the bulk payload.
fn encoded_len(doc: &FlatDocument) -> usize {
    // action line: {"index":{"_index":"..."}}
    const ACTION_LEN: usize = 32;
    serde_json::to_vec(doc).map_or(0, |v| v.len()) + ACTION_LEN
}

fn commit<B: SearchBackend + ?Sized>(
    worker: usize,
    batch: &[FlatDocument],
    backend: &B,
    config: &BulkConfig,
    session: &Session,
) {
    let execution_id = session.executions.fetch_add(1, Ordering::Relaxed) + 1;
    let started = Instant::now();
    let result = index_with_retry(backend, config, batch, execution_id);
    let elapsed = started.elapsed();
    session.queued[worker].store(0, Ordering::Relaxed);

    let mut stats = session.stats();
    stats.flushed += 1;
    let w = &mut stats.workers[worker];
    w.commits += 1;
    w.last_duration = elapsed;

    match result {
        Ok(response) => {
            stats.committed += 1;
            stats.indexed += batch.len() as u64;
            tally(&mut stats, &response, batch, execution_id);
        }
        Err(e) => {
            stats.failed += batch.len() as u64;
            tracing::error!(
                execution_id,
                worker,
                documents = batch.len(),
                error = %e,
                "bulk commit failed"
            );
            for doc in batch {
                tracing::debug!(
                    execution_id,
                    source = %source_json(doc),
                    "document in failed commit"
                );
            }
            session.record_error(BulkError::CommitFailed {
                execution_id,
                source: e,
            });
        }
    }

    for (w, queued) in stats.workers.iter_mut().zip(&session.queued) {
        w.queued = queued.load(Ordering::Relaxed);
    }
    stats.log(execution_id);
}

fn tally(
    stats: &mut BulkStats,
    response: &BulkResponse,
    batch: &[FlatDocument],
    execution_id: u64,
) {
    for (item, doc) in response.items.iter().zip(batch) {
        match item.result.as_deref() {
            Some("created") => stats.created += 1,
            Some("updated") => stats.updated += 1,
            Some("deleted") => stats.deleted += 1,
            _ => {}
        }
        if item.succeeded() {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
            tracing::warn!(
                execution_id,
                status = item.status,
                error = item.error.as_deref().unwrap_or("unknown"),
                source = %source_json(doc),
                "document rejected"
            );
        }
    }

    let unanswered = batch.len().saturating_sub(response.items.len());
    if unanswered > 0 {
        stats.failed += unanswered as u64;
        tracing::warn!(execution_id, unanswered, "bulk response is missing items");
    }
}

fn index_with_retry<B: SearchBackend + ?Sized>(
    backend: &B,
    config: &BulkConfig,
    batch: &[FlatDocument],
    execution_id: u64,
) -> Result<BulkResponse, BackendError> {
    let mut backoff = config.retry_backoff;
    let mut attempt = 0;

    loop {
        match backend.bulk_index(batch) {
            Ok(response) => return Ok(response),
            Err(e) if attempt < config.retries => {
                attempt += 1;
                tracing::warn!(execution_id, attempt, error = %e, "bulk request failed, retrying");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

fn source_json(doc: &FlatDocument) -> String {
    serde_json::to_string(doc).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::proto::{Label, Sample};

    fn series(job: &str, samples: usize) -> TimeSeries {
        TimeSeries {
            labels: vec![
                Label {
                    name: "__name__".to_string(),
                    value: "req".to_string(),
                },
                Label {
                    name: "job".to_string(),
                    value: job.to_string(),
                },
            ],
            samples: (0..samples)
                .map(|i| Sample {
                    value: 1.0,
                    timestamp: i as i64,
                })
                .collect(),
        }
    }

    fn config(workers: usize, flush_bytes: usize) -> BulkConfig {
        BulkConfig {
            workers,
            flush_bytes,
            queue_capacity: 4,
            retries: 0,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_all_documents_indexed() {
        let backend = MemoryBackend::new();
        let input = vec![series("a", 20), series("b", 15), series("c", 1)];

        let stats = write(&backend, &config(4, 1 << 20), &input).unwrap();

        assert_eq!(backend.document_count(), 36);
        assert_eq!(stats.indexed, 36);
        assert_eq!(stats.succeeded, 36);
        assert_eq!(stats.created, 36);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.workers.len(), 4);
        assert!(stats.workers.iter().all(|w| w.queued == 0));
    }

    #[test]
    fn test_final_flush_commits_each_worker_at_most_once() {
        let backend = MemoryBackend::new();

        let stats = write(&backend, &config(2, 1 << 20), &[series("a", 10)]).unwrap();

        // threshold never reached: only the final flush commits
        assert!((1..=2).contains(&backend.bulk_requests()));
        assert_eq!(stats.flushed, backend.bulk_requests() as u64);
        assert_eq!(stats.committed, stats.flushed);
        assert!(stats.workers.iter().all(|w| w.commits <= 1));
        assert_eq!(backend.document_count(), 10);
    }

    #[test]
    fn test_size_threshold_triggers_commits() {
        let backend = MemoryBackend::new();

        write(&backend, &config(1, 1), &[series("a", 5)]).unwrap();

        assert_eq!(backend.bulk_requests(), 5);
        assert_eq!(backend.document_count(), 5);
    }

    #[test]
    fn test_more_workers_than_documents() {
        let backend = MemoryBackend::new();

        let stats = write(&backend, &config(8, 1 << 20), &[series("a", 3)]).unwrap();

        assert!(backend.bulk_requests() <= 3);
        assert_eq!(backend.document_count(), 3);
        assert_eq!(stats.workers.len(), 8);
    }

    /// Delays the bulk request holding `slow_timestamp` and records when
    /// each request completed.
    struct StallingBackend {
        inner: MemoryBackend,
        slow_timestamp: i64,
        delay: Duration,
        completed: Mutex<Vec<(bool, Instant)>>,
    }

    impl SearchBackend for StallingBackend {
        fn ensure_collection(&self, mapping: &serde_json::Value) -> Result<(), BackendError> {
            self.inner.ensure_collection(mapping)
        }

        fn bulk_index(&self, documents: &[FlatDocument]) -> Result<BulkResponse, BackendError> {
            let slow = documents
                .iter()
                .any(|d| d.timestamp == self.slow_timestamp);
            if slow {
                thread::sleep(self.delay);
            }
            let response = self.inner.bulk_index(documents);
            self.completed.lock().unwrap().push((slow, Instant::now()));
            response
        }

        fn open_scroll(
            &self,
            query: &crate::query::BackendQuery,
            page_size: usize,
            keep_alive: Duration,
        ) -> Result<crate::backend::ScrollPage, BackendError> {
            self.inner.open_scroll(query, page_size, keep_alive)
        }

        fn next_page(
            &self,
            scroll_id: &str,
            keep_alive: Duration,
        ) -> Result<crate::backend::ScrollPage, BackendError> {
            self.inner.next_page(scroll_id, keep_alive)
        }

        fn clear_scroll(&self, scroll_id: &str) -> Result<(), BackendError> {
            self.inner.clear_scroll(scroll_id)
        }
    }

    #[test]
    fn test_stalled_worker_does_not_block_others() {
        let backend = StallingBackend {
            inner: MemoryBackend::new(),
            slow_timestamp: 0,
            delay: Duration::from_millis(500),
            completed: Mutex::new(Vec::new()),
        };
        let mut cfg = config(2, 1);
        cfg.queue_capacity = 1;

        let stats = write(&backend, &cfg, &[series("a", 20)]).unwrap();

        assert_eq!(stats.succeeded, 20);
        let completed = backend.completed.into_inner().unwrap();
        assert_eq!(completed.len(), 20);
        let slow_done = completed
            .iter()
            .find(|(slow, _)| *slow)
            .map(|(_, at)| *at)
            .unwrap();
        // the idle worker drains everything else while the other is stalled
        let drained_meanwhile = completed
            .iter()
            .filter(|(slow, at)| !slow && *at < slow_done)
            .count();
        assert_eq!(drained_meanwhile, 19);
    }

    #[test]
    fn test_nan_stored_as_zero() {
        let backend = MemoryBackend::new();
        let mut input = series("a", 1);
        input.samples[0].value = f64::NAN;

        write(&backend, &config(1, 1 << 20), &[input]).unwrap();

        assert_eq!(backend.documents()[0].value, 0.0);
    }

    #[test]
    fn test_commit_failure_is_reported_after_retries() {
        let backend = MemoryBackend::new();
        backend.fail_bulk_requests("cluster_block_exception");
        let mut cfg = config(1, 1 << 20);
        cfg.retries = 2;

        let err = write(&backend, &cfg, &[series("a", 4)]).unwrap_err();

        assert!(matches!(err, BulkError::CommitFailed { execution_id: 1, .. }));
        assert_eq!(backend.bulk_requests(), 3);
    }

    #[test]
    fn test_rejected_items_are_counted() {
        let backend = MemoryBackend::new();
        backend.reject_documents_with_label("bad");
        let mut poisoned = series("a", 2);
        poisoned.labels.push(Label {
            name: "bad".to_string(),
            value: "1".to_string(),
        });

        let err = write(&backend, &config(2, 1 << 20), &[series("b", 3), poisoned]).unwrap_err();

        assert!(matches!(
            err,
            BulkError::ItemsRejected {
                failed: 2,
                total: 5
            }
        ));
        // accepted documents are kept
        assert_eq!(backend.document_count(), 3);
    }

    #[test]
    fn test_empty_write() {
        let backend = MemoryBackend::new();

        let stats = write(&backend, &config(2, 1 << 20), &[series("a", 0)]).unwrap();

        assert_eq!(stats.flushed, 0);
        assert_eq!(backend.bulk_requests(), 0);
    }

    #[test]
    fn test_zero_workers() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            write(&backend, &config(0, 1), &[series("a", 1)]),
            Err(BulkError::NoWorkers)
        ));
    }

    #[test]
    fn test_config_from_adapter_config() {
        let adapter = AdapterConfig {
            workers: 3,
            bulk_size_mb: 2,
            bulk_retries: 5,
            ..AdapterConfig::default()
        };

        let cfg = BulkConfig::from_config(&adapter);

        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.flush_bytes, 2 << 20);
        assert_eq!(cfg.retries, 5);
        assert_eq!(cfg.retry_backoff, Duration::from_millis(100));
    }
}
