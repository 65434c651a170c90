use crate::lock::RepositoryLock;
use crate::scanner::scan_repository;
use crate::status::StatusStore;
use anyhow::Context;
use mnemolite_cache::{CascadeCache, SharedCache};
use mnemolite_core::config::AppConfig;
use mnemolite_core::error::{ErrorKind, KindedError};
use mnemolite_core::events::{new_trace_id, CoreEvent, EventKind, EventSink};
use mnemolite_core::model::{now_rfc3339, IndexingState, IndexingStatus};
use mnemolite_ingestion::{
    FileIndexResult, FileStatus, GraphBuildReport, GraphConstructor, IndexingPipeline,
};
use mnemolite_storage::{MetaStore, StoreError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexOptions {
    pub workers: usize,
    pub include_ignored: bool,
    pub force_reindex: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            include_ignored: false,
            force_reindex: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSummary {
    pub repository: String,
    pub total_files: usize,
    pub indexed: usize,
    pub cached: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-file results for everything that did not succeed.
    pub failures: Vec<FileIndexResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphBuildReport>,
    pub cancelled: bool,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("indexing already in progress for {0}")]
    LockDenied(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl KindedError for CoordinatorError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::LockDenied(_) => ErrorKind::LockDenied,
            CoordinatorError::Store(_) => ErrorKind::PersistError,
        }
    }
}

/// Decides sequential vs parallel execution, owns the worker pool,
/// serializes destructive repository work behind the advisory lock, and
/// reports progress. The graph pass runs afterwards as the single writer.
pub struct WorkCoordinator {
    pipeline: Arc<IndexingPipeline>,
    graph: Arc<GraphConstructor>,
    store: Arc<MetaStore>,
    cascade: Arc<CascadeCache>,
    lock: RepositoryLock,
    status: StatusStore,
    events: Arc<dyn EventSink>,
    config: AppConfig,
    cancelled: Arc<AtomicBool>,
}

impl WorkCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<IndexingPipeline>,
        graph: Arc<GraphConstructor>,
        store: Arc<MetaStore>,
        cascade: Arc<CascadeCache>,
        l2: Arc<dyn SharedCache>,
        events: Arc<dyn EventSink>,
        config: AppConfig,
    ) -> Self {
        let lock = RepositoryLock::new(l2.clone(), Duration::from_secs(config.lock.ttl_s));
        let status = StatusStore::new(l2);
        Self {
            pipeline,
            graph,
            store,
            cascade,
            lock,
            status,
            events,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation: no new files start, in-flight files
    /// finish, already committed work stays committed.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.status
    }

    pub async fn indexing_status(&self, repository: &str) -> IndexingStatus {
        self.status.get(repository).await
    }

    pub async fn index_repository(
        &self,
        repository: &str,
        root: &Path,
        options: IndexOptions,
    ) -> Result<IndexSummary, CoordinatorError> {
        let trace_id = new_trace_id();

        let Some(token) = self.lock.acquire(repository).await else {
            let _ = self.events.record(
                CoreEvent::new(EventKind::LockDenied, &trace_id).with_repository(repository),
            );
            return Err(CoordinatorError::LockDenied(repository.to_string()));
        };
        let _ = self.events.record(
            CoreEvent::new(EventKind::LockAcquired, &trace_id).with_repository(repository),
        );

        let result = self.run(repository, root, options, &trace_id).await;

        // Deferred, best-effort: a lost release is reclaimed by the TTL.
        let _ = self.lock.release(&token).await;
        let _ = self.events.record(
            CoreEvent::new(EventKind::LockReleased, &trace_id).with_repository(repository),
        );

        result
    }

    async fn run(
        &self,
        repository: &str,
        root: &Path,
        options: IndexOptions,
        trace_id: &str,
    ) -> Result<IndexSummary, CoordinatorError> {
        let started = Instant::now();
        let workers = options.workers.max(1);
        self.cancelled.store(false, Ordering::SeqCst);

        let scan = scan_repository(root, options.include_ignored, self.config.repo.max_files);
        let total = scan.files.len();

        let mut warnings = Vec::new();
        if scan.truncated {
            warnings.push(format!(
                "file cap of {} reached; remaining files skipped",
                self.config.repo.max_files
            ));
        }

        let mut status = IndexingStatus {
            repository: repository.to_string(),
            state: IndexingState::InProgress,
            total_files: total,
            indexed_files: 0,
            started_at: Some(now_rfc3339()),
            completed_at: None,
            error: None,
        };
        self.status.set(&status).await;
        let _ = self.events.record(
            CoreEvent::new(EventKind::IndexRepoStart, trace_id)
                .with_repository(repository)
                .with_detail("total_files", total.to_string()),
        );

        if options.force_reindex {
            self.purge_repository(repository).await?;
        }

        let sequential = workers == 1 || total < self.config.workers.sequential_threshold;
        info!(
            %repository,
            total,
            workers,
            mode = if sequential { "sequential" } else { "parallel" },
            "starting repository index"
        );

        let results = if sequential {
            self.run_sequential(repository, root, &scan.files, trace_id, &mut status)
                .await
        } else {
            let (results, worker_errors) = self
                .run_parallel(repository, root, &scan.files, workers, trace_id, &mut status)
                .await;
            warnings.extend(worker_errors);
            results
        };

        let cancelled = self.cancelled.load(Ordering::SeqCst);

        let mut summary = IndexSummary {
            repository: repository.to_string(),
            total_files: total,
            indexed: 0,
            cached: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            graph: None,
            cancelled,
            warnings,
            elapsed_ms: 0,
        };
        for result in results {
            match result.status {
                FileStatus::Indexed => summary.indexed += 1,
                FileStatus::Cached => summary.cached += 1,
                FileStatus::Skipped => summary.skipped += 1,
                FileStatus::Failed => {
                    summary.failed += 1;
                    summary.failures.push(result);
                }
            }
        }

        if cancelled {
            status.state = IndexingState::Failed;
            status.error = Some("cancelled".to_string());
            status.completed_at = Some(now_rfc3339());
            self.status.set(&status).await;
            let _ = self.events.record(
                CoreEvent::new(EventKind::IndexRepoFailed, trace_id)
                    .with_repository(repository)
                    .with_detail("error", "cancelled".to_string()),
            );
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        // Cross-file phase: one single-writer pass over nodes and edges.
        summary.graph = Some(self.graph.build(repository, trace_id).await);

        status.state = IndexingState::Completed;
        status.indexed_files = summary.indexed + summary.cached;
        status.completed_at = Some(now_rfc3339());
        self.status.set(&status).await;

        let _ = self.events.record(
            CoreEvent::new(EventKind::IndexRepoEnd, trace_id)
                .with_repository(repository)
                .with_detail("indexed", summary.indexed.to_string())
                .with_detail("failed", summary.failed.to_string()),
        );

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    async fn purge_repository(&self, repository: &str) -> Result<(), CoordinatorError> {
        let file_paths: BTreeSet<String> = self
            .store
            .chunks_for_repository(repository)
            .await
            .into_iter()
            .map(|chunk| chunk.file_path)
            .collect();
        for file_path in file_paths {
            self.cascade.invalidate(&file_path).await;
        }
        self.store.delete_repository(repository).await?;
        Ok(())
    }

    async fn run_sequential(
        &self,
        repository: &str,
        root: &Path,
        files: &[PathBuf],
        trace_id: &str,
        status: &mut IndexingStatus,
    ) -> Vec<FileIndexResult> {
        let mut results = Vec::with_capacity(files.len());
        let mut throttle = ProgressThrottle::new();

        for path in files {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let result = index_one(&self.pipeline, repository, root, path, trace_id).await;
            results.push(result);

            if throttle.should_emit(results.len(), files.len()) {
                self.emit_progress(repository, trace_id, results.len(), files.len(), status)
                    .await;
            }
        }

        results
    }

    /// Worker-pool mode: files are pre-partitioned round-robin over the
    /// pool; each worker owns its slice and streams results back. Worker
    /// outcomes are joined afterwards so a panicked or stopped worker is
    /// surfaced in the summary instead of silently shrinking the result
    /// set.
    async fn run_parallel(
        &self,
        repository: &str,
        root: &Path,
        files: &[PathBuf],
        workers: usize,
        trace_id: &str,
        status: &mut IndexingStatus,
    ) -> (Vec<FileIndexResult>, Vec<String>) {
        let (result_tx, mut result_rx) = mpsc::channel(files.len().max(1));
        let mut pool: Vec<tokio::task::JoinHandle<anyhow::Result<()>>> = Vec::new();

        for slice in partition(files, workers) {
            let pipeline = self.pipeline.clone();
            let cancelled = self.cancelled.clone();
            let result_tx = result_tx.clone();
            let repository = repository.to_string();
            let root = root.to_path_buf();
            let trace_id = trace_id.to_string();

            pool.push(tokio::spawn(async move {
                for path in slice {
                    if cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    let result =
                        index_one(&pipeline, &repository, &root, &path, &trace_id).await;
                    result_tx
                        .send(result)
                        .await
                        .context("coordinator dropped the result channel")?;
                }
                Ok(())
            }));
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(files.len());
        let mut throttle = ProgressThrottle::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
            if throttle.should_emit(results.len(), files.len()) {
                self.emit_progress(repository, trace_id, results.len(), files.len(), status)
                    .await;
            }
        }

        let mut worker_errors = Vec::new();
        for handle in pool {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "worker stopped before finishing its slice");
                    worker_errors.push(format!("worker stopped early: {err:#}"));
                }
                Err(join_err) => {
                    let err = anyhow::Error::new(join_err).context("worker task panicked");
                    warn!(error = %err, "worker task panicked");
                    worker_errors.push(format!("{err:#}"));
                }
            }
        }

        (results, worker_errors)
    }

    async fn emit_progress(
        &self,
        repository: &str,
        trace_id: &str,
        current: usize,
        total: usize,
        status: &mut IndexingStatus,
    ) {
        status.indexed_files = current;
        self.status.set(status).await;
        let _ = self.events.record(
            CoreEvent::new(EventKind::IndexRepoProgress, trace_id)
                .with_repository(repository)
                .with_detail("current", current.to_string())
                .with_detail("total", total.to_string()),
        );
    }
}

async fn index_one(
    pipeline: &IndexingPipeline,
    repository: &str,
    root: &Path,
    path: &Path,
    trace_id: &str,
) -> FileIndexResult {
    let file_path = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();

    match tokio::fs::read(path).await {
        Ok(bytes) => {
            pipeline
                .index_file(repository, &file_path, &bytes, trace_id)
                .await
        }
        Err(err) => {
            warn!(%file_path, error = %err, "file became unreadable during indexing");
            FileIndexResult::skipped(
                repository,
                &file_path,
                ErrorKind::SkippedFile,
                &format!("unreadable: {err}"),
            )
        }
    }
}

fn partition(files: &[PathBuf], workers: usize) -> Vec<Vec<PathBuf>> {
    let workers = workers.max(1);
    let mut slices: Vec<Vec<PathBuf>> = vec![Vec::new(); workers];
    for (i, file) in files.iter().enumerate() {
        slices[i % workers].push(file.clone());
    }
    slices.retain(|slice| !slice.is_empty());
    slices
}

/// At most one progress emission per second or per ten files, whichever
/// comes first; the final file always emits.
struct ProgressThrottle {
    last_emit: Instant,
    last_count: usize,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self {
            last_emit: Instant::now(),
            last_count: 0,
        }
    }

    fn should_emit(&mut self, current: usize, total: usize) -> bool {
        let due = current == total
            || current - self.last_count >= 10
            || self.last_emit.elapsed() >= Duration::from_secs(1);
        if due {
            self.last_emit = Instant::now();
            self.last_count = current;
        }
        due
    }
}
