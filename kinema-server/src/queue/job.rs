use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Transcoding,
    Completed,
    Failed,
    Cancelled,
}

/// One unit of work in the pre-transcoding pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJob {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub filename: String,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    /// Percent in [0, 100]. Capped at 99 until the asset is published.
    pub progress: f64,
    /// Higher transcodes sooner. High-priority enqueues stamp the current
    /// wall-clock seconds here so later rescans outrank earlier ones.
    pub priority: i64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds of media already traversed by the running encode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_seconds: Option<f64>,
    /// FFmpeg realtime speed multiplier (1.0 = realtime).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_multiplier: Option<f64>,
    /// Child process id while transcoding. Runtime-only.
    #[serde(skip)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub file_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TranscodeJob {
    pub fn new(source_path: PathBuf, output_dir: PathBuf, priority: i64) -> Self {
        let filename = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            source_path,
            filename,
            output_dir,
            status: JobStatus::Pending,
            progress: 0.0,
            priority,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            current_time_seconds: None,
            estimated_duration_seconds: None,
            speed_multiplier: None,
            pid: None,
            file_size_bytes: 0,
            modified: None,
            error: None,
        }
    }

    pub fn with_source_metadata(mut self, size: u64, modified: DateTime<Utc>) -> Self {
        self.file_size_bytes = size;
        self.modified = Some(modified);
        self
    }

    /// Duplicate-detection key: trimmed, lowercased filename.
    pub fn dedupe_key(&self) -> String {
        normalized_filename(&self.filename)
    }

    /// Duplicate-detection key: the normalized absolute source path.
    pub fn path_key(&self) -> String {
        normalized_path(&self.source_path)
    }

    pub fn mark_started(&mut self) {
        self.status = JobStatus::Transcoding;
        self.started_at = Some(Utc::now());
        self.error = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.completed_at = Some(Utc::now());
        self.pid = None;
        self.clear_telemetry();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self.pid = None;
        self.clear_telemetry();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.pid = None;
        self.clear_telemetry();
    }

    /// Reset for another trip through the pending queue.
    pub fn reset_for_requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0.0;
        self.started_at = None;
        self.completed_at = None;
        self.pid = None;
        self.clear_telemetry();
    }

    fn clear_telemetry(&mut self) {
        self.current_time_seconds = None;
        self.speed_multiplier = None;
    }
}

pub fn normalized_filename(filename: &str) -> String {
    filename.trim().to_lowercase()
}

pub fn normalized_path(path: &Path) -> String {
    path.to_string_lossy().trim().to_string()
}
