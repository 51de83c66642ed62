use super::job::{JobStatus, TranscodeJob};
use super::persist::{QueueStateFile, STATE_SCHEMA_VERSION};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Completed-job history is trimmed to this many entries after every save.
pub const COMPLETED_HISTORY_LIMIT: usize = 100;
/// A job may be retried this many times before it is left `failed`.
pub const MAX_RETRIES: u32 = 3;

/// Per-job control flags shared between the worker running the job and the
/// supervisor acting on it from outside.
#[derive(Debug, Default)]
pub struct JobSignal {
    cancel_requested: AtomicBool,
    /// Set when the supervisor has already taken the job out of the active
    /// table (pause, stop, cancel): the worker must not touch queue state
    /// for it on the way out.
    detached: AtomicBool,
}

impl JobSignal {
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job: TranscodeJob,
    pub signal: Arc<JobSignal>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added(Uuid),
    /// An identical pending job already existed; its priority was raised.
    Bumped(Uuid),
    Duplicate,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued,
    Failed,
}

/// All mutable queue state, guarded by one mutex. Methods are synchronous
/// and perform no I/O, so critical sections stay short.
#[derive(Debug, Default)]
pub struct EngineState {
    /// Pending jobs, priority descending, FIFO within equal priority.
    pub queue: Vec<TranscodeJob>,
    /// Jobs currently held by workers, keyed by job id.
    pub active: HashMap<Uuid, ActiveJob>,
    /// Bounded history of completed/failed/cancelled jobs.
    pub completed: Vec<TranscodeJob>,
    pub is_running: bool,
    pub is_paused: bool,
}

impl EngineState {
    /// Insert a job unless its filename or source path collides with a
    /// pending, active or recently completed job. On a pending collision
    /// with `high_priority`, the existing job is bumped instead, so a rescan
    /// still lifts a previously queued file.
    pub fn enqueue(&mut self, job: TranscodeJob, high_priority: bool) -> EnqueueOutcome {
        let name_key = job.dedupe_key();
        let path_key = job.path_key();

        if let Some(existing) = self
            .queue
            .iter_mut()
            .find(|j| j.dedupe_key() == name_key || j.path_key() == path_key)
        {
            if high_priority && job.priority > existing.priority {
                existing.priority = job.priority;
                let id = existing.id;
                self.sort_queue();
                debug!("bumped priority of queued job {id}");
                return EnqueueOutcome::Bumped(id);
            }
            return EnqueueOutcome::Duplicate;
        }

        let collides = |j: &TranscodeJob| j.dedupe_key() == name_key || j.path_key() == path_key;
        if self.active.values().any(|a| collides(&a.job))
            || self.completed.iter().any(|j| collides(j) && j.status == JobStatus::Completed)
        {
            return EnqueueOutcome::Duplicate;
        }

        let id = job.id;
        if high_priority {
            self.queue.insert(0, job);
        } else {
            self.queue.push(job);
        }
        self.sort_queue();
        EnqueueOutcome::Added(id)
    }

    /// Drop queued duplicates by normalized filename, keeping the highest
    /// priority instance (earliest on ties). Returns how many were removed.
    pub fn dedupe(&mut self) -> usize {
        let mut best: HashMap<String, (usize, i64)> = HashMap::new();
        for (idx, job) in self.queue.iter().enumerate() {
            let key = job.dedupe_key();
            match best.get(&key) {
                Some((_, priority)) if *priority >= job.priority => {}
                _ => {
                    best.insert(key, (idx, job.priority));
                }
            }
        }

        let keep: Vec<usize> = best.values().map(|(idx, _)| *idx).collect();
        let before = self.queue.len();
        let mut idx = 0;
        self.queue.retain(|_| {
            let kept = keep.contains(&idx);
            idx += 1;
            kept
        });
        before - self.queue.len()
    }

    /// Hand the highest-priority pending job to a worker, respecting the
    /// concurrency bound. The transition into the active table is atomic
    /// under the state lock: no job can be picked twice.
    pub fn next_job(&mut self, max_concurrent: usize) -> Option<(TranscodeJob, Arc<JobSignal>)> {
        if self.active.len() >= max_concurrent || self.queue.is_empty() {
            return None;
        }

        let mut job = self.queue.remove(0);
        job.mark_started();
        let signal = Arc::new(JobSignal::default());
        self.active.insert(
            job.id,
            ActiveJob {
                job: job.clone(),
                signal: signal.clone(),
            },
        );
        Some((job, signal))
    }

    /// Mark an active job completed; returns the finished record.
    pub fn complete_job(&mut self, id: Uuid) -> Option<TranscodeJob> {
        let mut entry = self.active.remove(&id)?;
        entry.job.mark_completed();
        self.push_completed(entry.job.clone());
        Some(entry.job)
    }

    /// Record a failure, requeueing unless the error is fatal or the retry
    /// budget is spent.
    pub fn fail_job(&mut self, id: Uuid, error: String, fatal: bool) -> Option<FailureOutcome> {
        let mut entry = self.active.remove(&id)?;

        if !fatal && entry.job.retry_count < MAX_RETRIES {
            entry.job.retry_count += 1;
            entry.job.priority = 0;
            entry.job.reset_for_requeue();
            entry.job.error = Some(error);
            self.queue.push(entry.job);
            self.sort_queue();
            Some(FailureOutcome::Requeued)
        } else {
            entry.job.mark_failed(error);
            self.push_completed(entry.job);
            Some(FailureOutcome::Failed)
        }
    }

    /// Pull an active job back to the head of the queue (pause/stop path).
    /// The worker is detached and must not report the job again.
    pub fn requeue_active(&mut self, id: Uuid) -> Option<TranscodeJob> {
        let mut entry = self.active.remove(&id)?;
        entry.signal.request_cancel();
        entry.signal.detach();
        let interrupted = entry.job.clone();
        entry.job.reset_for_requeue();
        self.queue.insert(0, entry.job);
        Some(interrupted)
    }

    /// Cancel an active job outright. Returns the record as it was when
    /// cancelled (pid still set) so the caller can signal the child.
    pub fn cancel_active(&mut self, id: Uuid) -> Option<TranscodeJob> {
        let mut entry = self.active.remove(&id)?;
        entry.signal.request_cancel();
        entry.signal.detach();
        let snapshot = entry.job.clone();
        entry.job.mark_cancelled();
        self.push_completed(entry.job);
        Some(snapshot)
    }

    /// Cancel a pending job.
    pub fn cancel_pending(&mut self, id: Uuid) -> bool {
        let Some(idx) = self.queue.iter().position(|j| j.id == id) else {
            return false;
        };
        let mut job = self.queue.remove(idx);
        job.mark_cancelled();
        self.push_completed(job);
        true
    }

    pub fn move_up(&mut self, id: Uuid) -> bool {
        match self.queue.iter().position(|j| j.id == id) {
            Some(idx) if idx > 0 => {
                self.queue.swap(idx - 1, idx);
                true
            }
            _ => false,
        }
    }

    pub fn move_down(&mut self, id: Uuid) -> bool {
        match self.queue.iter().position(|j| j.id == id) {
            Some(idx) if idx + 1 < self.queue.len() => {
                self.queue.swap(idx, idx + 1);
                true
            }
            _ => false,
        }
    }

    pub fn move_to_top(&mut self, id: Uuid) -> bool {
        match self.queue.iter().position(|j| j.id == id) {
            Some(idx) => {
                let job = self.queue.remove(idx);
                self.queue.insert(0, job);
                true
            }
            None => false,
        }
    }

    /// Reorder the whole pending queue by id. Any unknown id rejects the
    /// operation; ids not listed keep their relative order after the listed
    /// ones.
    pub fn reorder(&mut self, ordered_ids: &[Uuid]) -> bool {
        if ordered_ids
            .iter()
            .any(|id| !self.queue.iter().any(|j| j.id == *id))
        {
            return false;
        }

        let mut reordered = Vec::with_capacity(self.queue.len());
        for id in ordered_ids {
            if let Some(idx) = self.queue.iter().position(|j| j.id == *id) {
                reordered.push(self.queue.remove(idx));
            }
        }
        reordered.append(&mut self.queue);
        self.queue = reordered;
        true
    }

    /// Remove pending jobs and history entries by id. Active jobs are not
    /// touched (cancel them instead). Returns how many were removed.
    pub fn remove_jobs(&mut self, ids: &[Uuid]) -> usize {
        let before = self.queue.len() + self.completed.len();
        self.queue.retain(|j| !ids.contains(&j.id));
        self.completed.retain(|j| !ids.contains(&j.id));
        before - self.queue.len() - self.completed.len()
    }

    /// Snapshot for persistence: active jobs lead the queue array so a
    /// crash-restart re-queues them first.
    pub fn snapshot_file(&self) -> QueueStateFile {
        let mut active: Vec<TranscodeJob> = self.active.values().map(|a| a.job.clone()).collect();
        active.sort_by_key(|j| j.started_at);

        let mut queue = active;
        queue.extend(self.queue.iter().cloned());

        QueueStateFile {
            version: STATE_SCHEMA_VERSION,
            queue,
            completed_jobs: self.completed.clone(),
            is_running: self.is_running,
            is_paused: self.is_paused,
            last_saved: Utc::now(),
        }
    }

    /// Restore from a loaded document. Previously active jobs go back to
    /// the head with progress reset; only pending work is revived.
    pub fn apply_loaded(&mut self, file: QueueStateFile) {
        let mut interrupted = Vec::new();
        let mut pending = Vec::new();

        for mut job in file.queue {
            match job.status {
                JobStatus::Transcoding => {
                    job.reset_for_requeue();
                    interrupted.push(job);
                }
                JobStatus::Pending => pending.push(job),
                _ => {}
            }
        }

        self.queue = interrupted;
        self.queue.extend(pending);
        self.dedupe();
        self.sort_queue();

        self.completed = file.completed_jobs;
        let len = self.completed.len();
        if len > COMPLETED_HISTORY_LIMIT {
            self.completed.drain(..len - COMPLETED_HISTORY_LIMIT);
        }
        self.is_paused = file.is_paused;
        self.is_running = false;
    }

    fn push_completed(&mut self, job: TranscodeJob) {
        self.completed.push(job);
        let len = self.completed.len();
        if len > COMPLETED_HISTORY_LIMIT {
            self.completed.drain(..len - COMPLETED_HISTORY_LIMIT);
        }
    }

    fn sort_queue(&mut self) {
        // Stable: FIFO within a priority class.
        self.queue.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
}

/// Live handle a worker gives the transcoder so progress and the child pid
/// land in the active table while the job runs.
#[derive(Clone)]
pub struct JobHandle {
    pub job_id: Uuid,
    state: Arc<Mutex<EngineState>>,
    signal: Arc<JobSignal>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: Uuid,
        state: Arc<Mutex<EngineState>>,
        signal: Arc<JobSignal>,
    ) -> Self {
        Self {
            job_id,
            state,
            signal,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.signal.cancel_requested()
    }

    pub fn detached(&self) -> bool {
        self.signal.detached()
    }

    pub async fn set_pid(&self, pid: Option<u32>) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(&self.job_id) {
            active.job.pid = pid;
        }
    }

    pub async fn set_estimated_duration(&self, seconds: f64) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(&self.job_id) {
            active.job.estimated_duration_seconds = Some(seconds);
        }
    }

    /// Record a progress sample. Percent is capped at 99 until publish.
    pub async fn update_progress(&self, percent: f64, current_time: f64, speed: Option<f64>) {
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.get_mut(&self.job_id) {
            active.job.progress = percent.clamp(0.0, 99.0);
            active.job.current_time_seconds = Some(current_time);
            if speed.is_some() {
                active.job.speed_multiplier = speed;
            }
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .finish()
    }
}
