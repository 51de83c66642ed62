use crate::queue::{EngineState, JobStatus, TranscodeJob};
use kinema_core::probe::FALLBACK_DURATION_SECONDS;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

/// Disk usage is recomputed in the background at most this often; stats
/// calls always read the cached value.
pub const DISK_USAGE_REFRESH: Duration = Duration::from_secs(600);

/// Snapshot served to the admin surface every few seconds. Cheap to build:
/// one lock acquisition, no filesystem traffic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeStats {
    pub pending_count: usize,
    pub active_count: usize,
    /// Length of the bounded completed-job history, not the number of
    /// on-disk assets.
    pub completed_count: usize,
    pub failed_count: usize,
    pub active_jobs: Vec<TranscodeJob>,
    pub max_concurrent: usize,
    pub is_running: bool,
    pub is_paused: bool,
    pub estimated_remaining_seconds: f64,
    pub disk_usage: String,
}

pub fn build_stats(
    state: &EngineState,
    max_concurrent: usize,
    disk_usage: String,
) -> TranscodeStats {
    let active_jobs: Vec<TranscodeJob> = state.active.values().map(|a| a.job.clone()).collect();
    let failed_count = state
        .completed
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .count();

    TranscodeStats {
        pending_count: state.queue.len(),
        active_count: active_jobs.len(),
        completed_count: state.completed.len(),
        failed_count,
        estimated_remaining_seconds: estimate_remaining_seconds(
            &active_jobs,
            &state.queue,
            max_concurrent,
        ),
        active_jobs,
        max_concurrent,
        is_running: state.is_running,
        is_paused: state.is_paused,
        disk_usage,
    }
}

/// Remaining wall-clock estimate: active jobs finish their remaining media
/// time at their current speed; queued jobs are averaged across workers,
/// with a two-hour default for unknown durations.
pub fn estimate_remaining_seconds(
    active: &[TranscodeJob],
    queue: &[TranscodeJob],
    workers: usize,
) -> f64 {
    let active_remaining: f64 = active
        .iter()
        .map(|job| {
            let duration = job
                .estimated_duration_seconds
                .unwrap_or(FALLBACK_DURATION_SECONDS);
            let done = job.current_time_seconds.unwrap_or(0.0).min(duration);
            let speed = job.speed_multiplier.filter(|s| *s > 0.0).unwrap_or(1.0);
            (duration - done) / speed
        })
        .sum();

    let queued: f64 = queue
        .iter()
        .map(|job| {
            job.estimated_duration_seconds
                .unwrap_or(FALLBACK_DURATION_SECONDS)
        })
        .sum();

    active_remaining + queued / workers.max(1) as f64
}

/// Cached human-readable size of the transcoded tree.
#[derive(Debug)]
pub struct DiskUsageCache {
    text: String,
    refreshed_at: Option<Instant>,
}

impl Default for DiskUsageCache {
    fn default() -> Self {
        Self {
            text: "unknown".to_string(),
            refreshed_at: None,
        }
    }
}

impl DiskUsageCache {
    pub fn text(&self) -> String {
        self.text.clone()
    }

    pub fn is_stale(&self) -> bool {
        self.refreshed_at
            .map(|t| t.elapsed() >= DISK_USAGE_REFRESH)
            .unwrap_or(true)
    }

    pub fn update(&mut self, text: String) {
        self.text = text;
        self.refreshed_at = Some(Instant::now());
    }
}

/// Walk the transcoded tree and format its size. Runs on the blocking pool;
/// never called from a stats request.
pub fn compute_disk_usage(root: &Path) -> String {
    format_bytes(dir_size(root))
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(meta) if meta.is_dir() => dir_size(&path),
                _ => 0,
            }
        })
        .sum()
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
