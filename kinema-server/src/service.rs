//! Worker pool, supervisor and the administrative surface of the engine.

use crate::cleanup::{self, CleanupReport};
use crate::config::TranscodeConfig;
use crate::dbsync;
use crate::hardware::HardwareProvider;
use crate::queue::{
    persist, EngineState, EnqueueOutcome, FailureOutcome, JobHandle, TranscodeJob,
};
use crate::stats::{self, DiskUsageCache, TranscodeStats, DISK_USAGE_REFRESH};
use crate::transcoder::Transcoder;
use crate::watcher::FileWatcher;
use chrono::Utc;
use kinema_core::database::MetadataStore;
use kinema_core::{is_transcoded, layout, MediaScanner, Result, TranscodeError};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Idle back-off when a worker sees the pool saturated.
const WORKER_BACKOFF: Duration = Duration::from_millis(250);

/// Structured result of an administrative operation. Never raises.
#[derive(Debug, Clone, Serialize)]
pub struct AdminOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdminOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn success_with(reason: impl Into<String>) -> Self {
        Self {
            ok: true,
            reason: Some(reason.into()),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

pub(crate) struct ServiceInner {
    pub config: Arc<TranscodeConfig>,
    pub state: Arc<Mutex<EngineState>>,
    pub store: Arc<dyn MetadataStore>,
    pub transcoder: Transcoder,
    pub disk_usage: Mutex<DiskUsageCache>,
    pub workers_alive: AtomicUsize,
    pub auto_start: AtomicBool,
}

/// The owned engine instance. Created once at process start; every admin
/// entry point is a method on a clone of this handle.
#[derive(Clone)]
pub struct TranscodeService {
    inner: Arc<ServiceInner>,
}

impl TranscodeService {
    pub fn new(
        config: TranscodeConfig,
        store: Arc<dyn MetadataStore>,
        hardware: Arc<dyn HardwareProvider>,
    ) -> Self {
        let auto_start = config.auto_start;
        let config = Arc::new(config);
        let transcoder = Transcoder::new(config.clone(), hardware);

        Self {
            inner: Arc::new(ServiceInner {
                config,
                state: Arc::new(Mutex::new(EngineState::default())),
                store,
                transcoder,
                disk_usage: Mutex::new(DiskUsageCache::default()),
                workers_alive: AtomicUsize::new(0),
                auto_start: AtomicBool::new(auto_start),
            }),
        }
    }

    /// Boot sequence: directories, interrupted-output cleanup, state
    /// restore, rescan when cleanup removed anything, auto-save timer,
    /// metadata sync, delayed auto-start and watcher hand-off.
    pub async fn boot(&self, watcher: Arc<dyn FileWatcher>) -> Result<()> {
        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.transcoded_dir).await?;
        tokio::fs::create_dir_all(config.transcoded_dir.join(layout::SERIES_SUBDIR)).await?;

        let removed = cleanup::cleanup_interrupted(&config.transcoded_dir).await?;

        match persist::load_state(&config.state_file_path()).await {
            Ok(Some(file)) => {
                let mut state = self.inner.state.lock().await;
                state.apply_loaded(file);
                info!(pending = state.queue.len(), "queue state restored");
            }
            Ok(None) => debug!("no previous queue state"),
            Err(e) => warn!("starting with an empty queue: {e}"),
        }

        if !removed.is_empty() {
            // The deleted outputs must re-enter the queue right away.
            self.scan_and_queue().await;
        }

        self.spawn_autosave();
        self.spawn_disk_usage_refresh();

        dbsync::sync_transcoded_status(self.inner.store.as_ref(), config).await;

        let (queue_empty, was_paused) = {
            let state = self.inner.state.lock().await;
            (state.queue.is_empty(), state.is_paused)
        };
        if !queue_empty && self.inner.auto_start.load(Ordering::SeqCst) && !was_paused {
            let service = self.clone();
            let settle = config.start_settle_secs;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(settle)).await;
                let outcome = service.start().await;
                info!(ok = outcome.ok, "auto-start after boot");
            });
        }

        let service = self.clone();
        let settle = config.watcher_settle_secs;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(settle)).await;
            if let Err(e) = watcher.start(service).await {
                error!("filesystem watcher failed to start: {e}");
            }
        });

        Ok(())
    }

    /// Scan both library roots and enqueue everything not yet transcoded,
    /// films and episodes interleaved.
    pub async fn scan_and_queue(&self) -> AdminOutcome {
        let scanner = MediaScanner::new(
            self.inner.config.films_dir.clone(),
            self.inner.config.series_dir.clone(),
        );
        let result = match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(result) => result,
            Err(e) => return AdminOutcome::rejected(format!("scan task failed: {e}")),
        };

        let candidates = result.interleaved();
        let total = candidates.len();
        let mut added = 0usize;

        for media in candidates {
            let output_dir = self.output_dir_for(&media.path);
            if is_transcoded(&output_dir).await {
                continue;
            }
            let job = TranscodeJob::new(media.path, output_dir, 0)
                .with_source_metadata(media.size, media.modified);
            let outcome = {
                let mut state = self.inner.state.lock().await;
                state.enqueue(job, false)
            };
            if matches!(outcome, EnqueueOutcome::Added(_)) {
                added += 1;
            }
        }

        self.persist().await;
        self.spawn_workers_if_running().await;
        info!(added, total, "scan finished");
        AdminOutcome::success_with(format!("queued {added} of {total} candidates"))
    }

    /// Enqueue one source path (watcher entry point when
    /// `high_priority = true`).
    pub async fn enqueue(&self, source: &Path, high_priority: bool) -> AdminOutcome {
        let output_dir = self.output_dir_for(source);
        if is_transcoded(&output_dir).await {
            return AdminOutcome::rejected("already transcoded");
        }

        let priority = if high_priority { Utc::now().timestamp() } else { 0 };
        let mut job = TranscodeJob::new(source.to_path_buf(), output_dir, priority);
        if let Ok(meta) = tokio::fs::metadata(source).await {
            job.file_size_bytes = meta.len();
            job.modified = meta.modified().ok().map(Into::into);
        }

        let outcome = {
            let mut state = self.inner.state.lock().await;
            state.enqueue(job, high_priority)
        };
        self.persist().await;

        match outcome {
            EnqueueOutcome::Added(id) => {
                self.spawn_workers_if_running().await;
                info!("enqueued {} as {id}", source.display());
                AdminOutcome::success()
            }
            EnqueueOutcome::Bumped(id) => {
                debug!("bumped existing job {id} for {}", source.display());
                AdminOutcome::success_with("existing job priority raised")
            }
            EnqueueOutcome::Duplicate => AdminOutcome::rejected("duplicate"),
        }
    }

    /// `stopped | paused → running`: spawn the worker pool.
    pub async fn start(&self) -> AdminOutcome {
        {
            let mut state = self.inner.state.lock().await;
            if state.is_running && !state.is_paused {
                return AdminOutcome::rejected("already running");
            }
            state.is_running = true;
            state.is_paused = false;
        }
        self.persist().await;
        self.spawn_workers().await;
        info!(
            workers = self.inner.config.max_concurrent_transcodes,
            "worker pool started"
        );
        AdminOutcome::success()
    }

    /// `running → paused`: gracefully terminate active children and put
    /// their jobs back at the head of the queue.
    pub async fn pause(&self) -> AdminOutcome {
        let interrupted = {
            let mut state = self.inner.state.lock().await;
            if !state.is_running || state.is_paused {
                return AdminOutcome::rejected("not running");
            }
            state.is_paused = true;
            self.detach_active(&mut state)
        };

        for job in &interrupted {
            self.terminate_job_remains(job, false).await;
        }
        self.persist().await;
        info!(interrupted = interrupted.len(), "worker pool paused");
        AdminOutcome::success()
    }

    /// `paused → running`, provided there is work to resume.
    pub async fn resume(&self) -> AdminOutcome {
        {
            let mut state = self.inner.state.lock().await;
            if !state.is_paused {
                return AdminOutcome::rejected("not paused");
            }
            if state.queue.is_empty() {
                return AdminOutcome::rejected("queue is empty");
            }
            state.is_paused = false;
            state.is_running = true;
        }
        self.persist().await;
        self.spawn_workers().await;
        info!("worker pool resumed");
        AdminOutcome::success()
    }

    /// `* → stopped`: hard-kill active children, re-queue their jobs.
    pub async fn stop(&self) -> AdminOutcome {
        let interrupted = {
            let mut state = self.inner.state.lock().await;
            if !state.is_running && !state.is_paused {
                return AdminOutcome::rejected("not running");
            }
            state.is_running = false;
            state.is_paused = false;
            self.detach_active(&mut state)
        };

        for job in &interrupted {
            self.terminate_job_remains(job, true).await;
        }
        self.persist().await;
        info!(interrupted = interrupted.len(), "worker pool stopped");
        AdminOutcome::success()
    }

    /// Cancel one job, queued or active. No retry.
    pub async fn cancel(&self, job_id: Uuid) -> AdminOutcome {
        enum Hit {
            Active(TranscodeJob),
            Pending,
        }

        let hit = {
            let mut state = self.inner.state.lock().await;
            if let Some(snapshot) = state.cancel_active(job_id) {
                Some(Hit::Active(snapshot))
            } else if state.cancel_pending(job_id) {
                Some(Hit::Pending)
            } else {
                None
            }
        };

        match hit {
            Some(Hit::Active(snapshot)) => {
                self.terminate_job_remains(&snapshot, false).await;
                self.persist().await;
                info!("cancelled active job {job_id}");
                AdminOutcome::success()
            }
            Some(Hit::Pending) => {
                self.persist().await;
                info!("cancelled queued job {job_id}");
                AdminOutcome::success()
            }
            None => AdminOutcome::rejected("job not found"),
        }
    }

    pub async fn move_up(&self, job_id: Uuid) -> AdminOutcome {
        self.reorder_op(|state| state.move_up(job_id)).await
    }

    pub async fn move_down(&self, job_id: Uuid) -> AdminOutcome {
        self.reorder_op(|state| state.move_down(job_id)).await
    }

    pub async fn move_to_top(&self, job_id: Uuid) -> AdminOutcome {
        self.reorder_op(|state| state.move_to_top(job_id)).await
    }

    pub async fn reorder(&self, ordered_ids: Vec<Uuid>) -> AdminOutcome {
        self.reorder_op(move |state| state.reorder(&ordered_ids))
            .await
    }

    pub async fn remove_jobs(&self, ids: Vec<Uuid>) -> AdminOutcome {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.remove_jobs(&ids)
        };
        self.persist().await;
        AdminOutcome::success_with(format!("removed {removed} jobs"))
    }

    pub async fn remove_duplicates(&self) -> AdminOutcome {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.dedupe()
        };
        self.persist().await;
        AdminOutcome::success_with(format!("removed {removed} duplicates"))
    }

    pub async fn set_auto_start(&self, enabled: bool) -> AdminOutcome {
        self.inner.auto_start.store(enabled, Ordering::SeqCst);
        AdminOutcome::success()
    }

    pub async fn get_stats(&self) -> TranscodeStats {
        let disk_usage = self.inner.disk_usage.lock().await.text();
        let state = self.inner.state.lock().await;
        stats::build_stats(
            &state,
            self.inner.config.max_concurrent_transcodes,
            disk_usage,
        )
    }

    /// The pending queue, priority order.
    pub async fn get_queue(&self) -> Vec<TranscodeJob> {
        self.inner.state.lock().await.queue.clone()
    }

    /// The bounded completed/failed/cancelled history.
    pub async fn get_history(&self) -> Vec<TranscodeJob> {
        self.inner.state.lock().await.completed.clone()
    }

    /// Published asset names (episodes prefixed `series/`).
    pub async fn list_transcoded(&self) -> Vec<String> {
        let Ok(dirs) = cleanup::asset_dirs(&self.inner.config.transcoded_dir).await else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for (dir, name) in dirs {
            if tokio::fs::try_exists(dir.join(kinema_core::DONE_MARKER))
                .await
                .unwrap_or(false)
            {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Delete one published asset directory by its root-relative name.
    pub async fn delete_transcoded(&self, folder_name: &str) -> AdminOutcome {
        let Some(dir) = self.resolve_asset_dir(folder_name) else {
            return AdminOutcome::rejected("invalid folder name");
        };
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return AdminOutcome::rejected("no such transcoded folder");
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("deleted transcoded asset {folder_name}");
                AdminOutcome::success()
            }
            Err(e) => AdminOutcome::rejected(format!("delete failed: {e}")),
        }
    }

    pub async fn cleanup_incomplete(&self) -> Result<CleanupReport> {
        cleanup::cleanup_incomplete(&self.inner.config.transcoded_dir).await
    }

    /// Force a state save now (shutdown path).
    pub async fn save_now(&self) {
        self.persist().await;
    }

    fn output_dir_for(&self, source: &Path) -> PathBuf {
        layout::output_dir(
            &self.inner.config.transcoded_dir,
            &self.inner.config.series_dir,
            source,
        )
    }

    /// `<name>` or `series/<name>`, nothing else.
    fn resolve_asset_dir(&self, folder_name: &str) -> Option<PathBuf> {
        let rel = Path::new(folder_name);
        let components: Vec<_> = rel.components().collect();
        let valid = match components.as_slice() {
            [Component::Normal(_)] => true,
            [Component::Normal(first), Component::Normal(_)] => {
                *first == std::ffi::OsStr::new(layout::SERIES_SUBDIR)
            }
            _ => false,
        };
        valid.then(|| self.inner.config.transcoded_dir.join(rel))
    }

    async fn reorder_op(&self, op: impl FnOnce(&mut EngineState) -> bool) -> AdminOutcome {
        let ok = {
            let mut state = self.inner.state.lock().await;
            op(&mut state)
        };
        if ok {
            self.persist().await;
            AdminOutcome::success()
        } else {
            AdminOutcome::rejected("reorder rejected")
        }
    }

    /// Detach and re-queue every active job; returns snapshots still
    /// carrying their child pids.
    fn detach_active(&self, state: &mut EngineState) -> Vec<TranscodeJob> {
        let ids: Vec<Uuid> = state.active.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| state.requeue_active(id))
            .collect()
    }

    /// Signal an interrupted job's child and drop its on-disk lock.
    async fn terminate_job_remains(&self, job: &TranscodeJob, hard: bool) {
        if let Some(pid) = job.pid {
            signal_pid(pid, hard);
        }
        let marker = job.output_dir.join(kinema_core::TRANSCODING_MARKER);
        if let Err(e) = tokio::fs::remove_file(&marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", marker.display());
            }
        }
    }

    /// De-duplicate, snapshot under the lock, write outside it. A failed
    /// write is logged and retried by the next tick; memory stays
    /// authoritative.
    async fn persist(&self) {
        let snapshot = {
            let mut state = self.inner.state.lock().await;
            state.dedupe();
            state.snapshot_file()
        };
        if let Err(e) =
            persist::save_state(&self.inner.config.state_file_path(), &snapshot).await
        {
            warn!("queue state save failed: {e}");
        }
    }

    async fn spawn_workers_if_running(&self) {
        let run = {
            let state = self.inner.state.lock().await;
            state.is_running && !state.is_paused
        };
        if run {
            self.spawn_workers().await;
        }
    }

    async fn spawn_workers(&self) {
        let max = self.inner.config.max_concurrent_transcodes;
        loop {
            let alive = self.inner.workers_alive.load(Ordering::SeqCst);
            if alive >= max {
                break;
            }
            if self
                .inner
                .workers_alive
                .compare_exchange(alive, alive + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let inner = self.inner.clone();
                tokio::spawn(worker_loop(inner, alive));
            }
        }
    }

    fn spawn_autosave(&self) {
        let service = self.clone();
        let interval = self.inner.config.autosave_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.persist().await;
            }
        });
    }

    fn spawn_disk_usage_refresh(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let root = inner.config.transcoded_dir.clone();
                let text = tokio::task::spawn_blocking(move || stats::compute_disk_usage(&root))
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                inner.disk_usage.lock().await.update(text);
                tokio::time::sleep(DISK_USAGE_REFRESH).await;
            }
        });
    }
}

impl std::fmt::Debug for TranscodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeService")
            .field("workers_alive", &self.inner.workers_alive)
            .finish()
    }
}

/// One worker: pop, transcode, classify, loop. Exits when the pool leaves
/// the running state or the queue drains.
async fn worker_loop(inner: Arc<ServiceInner>, worker_id: usize) {
    debug!("worker {worker_id} started");

    loop {
        enum Tick {
            Job(TranscodeJob, JobHandle),
            Saturated,
            Idle,
        }

        let tick = {
            let mut state = inner.state.lock().await;
            if !state.is_running || state.is_paused {
                break;
            }
            if state.active.len() >= inner.config.max_concurrent_transcodes {
                Tick::Saturated
            } else {
                match state.next_job(inner.config.max_concurrent_transcodes) {
                    Some((job, signal)) => {
                        let handle = JobHandle::new(job.id, inner.state.clone(), signal);
                        Tick::Job(job, handle)
                    }
                    None => Tick::Idle,
                }
            }
        };

        match tick {
            Tick::Saturated => {
                tokio::time::sleep(WORKER_BACKOFF).await;
            }
            Tick::Idle => break,
            Tick::Job(job, handle) => {
                persist_snapshot(&inner).await;
                info!(
                    worker = worker_id,
                    job = %job.id,
                    "transcoding {}",
                    job.filename
                );

                let result = inner.transcoder.run(&job, &handle).await;
                finish_job(&inner, job, &handle, result, worker_id).await;
            }
        }
    }

    inner.workers_alive.fetch_sub(1, Ordering::SeqCst);
    debug!("worker {worker_id} exiting");
}

async fn finish_job(
    inner: &Arc<ServiceInner>,
    job: TranscodeJob,
    handle: &JobHandle,
    result: Result<()>,
    worker_id: usize,
) {
    // The supervisor may have detached this job (pause/stop/cancel) while
    // the transcoder was running; it already owns the queue bookkeeping.
    if handle.detached() {
        debug!(worker = worker_id, job = %job.id, "job detached, worker steps aside");
        return;
    }

    match result {
        Ok(()) => {
            let completed = {
                let mut state = inner.state.lock().await;
                state.complete_job(job.id)
            };
            persist_snapshot(inner).await;
            info!(worker = worker_id, "completed {}", job.filename);
            if let Some(done) = completed {
                mark_metadata(inner, &done).await;
            }
        }
        Err(TranscodeError::Cancelled) => {
            let _ = {
                let mut state = inner.state.lock().await;
                state.cancel_active(job.id)
            };
            persist_snapshot(inner).await;
            info!(worker = worker_id, "cancelled {}", job.filename);
        }
        Err(e) => {
            let fatal = e.is_fatal();
            let message = e.to_string();
            let outcome = {
                let mut state = inner.state.lock().await;
                state.fail_job(job.id, message.clone(), fatal)
            };
            persist_snapshot(inner).await;
            match outcome {
                Some(FailureOutcome::Requeued) => warn!(
                    worker = worker_id,
                    "job {} failed, requeued: {message}", job.filename
                ),
                _ => error!(
                    worker = worker_id,
                    "job {} failed permanently: {message}", job.filename
                ),
            }
        }
    }
}

/// Mark the catalog row for a published job; a missing row triggers full
/// reconciliation.
async fn mark_metadata(inner: &Arc<ServiceInner>, job: &TranscodeJob) {
    let store = inner.store.as_ref();
    let config = &inner.config;
    let episode = layout::is_episode(&job.source_path, &config.series_dir);

    let found = if episode {
        store.find_episode_by_source_path(&job.source_path).await
    } else {
        store.find_film_by_source_path(&job.source_path).await
    };

    match found {
        Ok(Some(row)) => {
            if let Err(e) = store.set_is_transcoded(row.id, row.kind, true).await {
                warn!("failed to mark {} transcoded: {e}", job.filename);
            }
        }
        Ok(None) => {
            warn!(
                "no catalog row for {}, running full metadata sync",
                job.filename
            );
            dbsync::sync_transcoded_status(store, config).await;
        }
        Err(e) => warn!("catalog lookup failed for {}: {e}", job.filename),
    }
}

async fn persist_snapshot(inner: &Arc<ServiceInner>) {
    let snapshot = {
        let mut state = inner.state.lock().await;
        state.dedupe();
        state.snapshot_file()
    };
    if let Err(e) = persist::save_state(&inner.config.state_file_path(), &snapshot).await {
        warn!("queue state save failed: {e}");
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, hard: bool) {
    let signal = if hard { libc::SIGKILL } else { libc::SIGTERM };
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _hard: bool) {}
