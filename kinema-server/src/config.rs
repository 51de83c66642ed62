use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the persisted queue document inside the transcoded root.
pub const STATE_FILE_NAME: &str = "queue-state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Root of the published HLS assets. Also holds the state file.
    pub transcoded_dir: PathBuf,
    /// Films library root, scanned recursively.
    pub films_dir: PathBuf,
    /// Series library root, scanned recursively. May be absent on disk.
    pub series_dir: PathBuf,
    /// FFmpeg binary path
    pub ffmpeg_path: String,
    /// FFprobe binary path
    pub ffprobe_path: String,
    /// Bound on simultaneously active jobs (worker count).
    pub max_concurrent_transcodes: usize,
    /// Nominal HLS segment duration in seconds.
    pub segment_duration_seconds: u32,
    /// Start the worker pool automatically at boot when the queue is
    /// non-empty.
    pub auto_start: bool,
    /// Auto-save cadence for the queue state file.
    pub autosave_interval_secs: u64,
    /// Settle delay before auto-starting the pool at boot.
    pub start_settle_secs: u64,
    /// Settle delay before handing control to the filesystem watcher.
    pub watcher_settle_secs: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            transcoded_dir: PathBuf::from("./transcoded"),
            films_dir: PathBuf::from("./media/films"),
            series_dir: PathBuf::from("./media/series"),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            max_concurrent_transcodes: 2,
            segment_duration_seconds: 2,
            auto_start: true,
            autosave_interval_secs: 30,
            start_settle_secs: 5,
            watcher_settle_secs: 10,
        }
    }
}

impl TranscodeConfig {
    pub fn state_file_path(&self) -> PathBuf {
        self.transcoded_dir.join(STATE_FILE_NAME)
    }

    /// Configuration for tests: everything under one tempdir, no settle
    /// delays.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            transcoded_dir: root.join("transcoded"),
            films_dir: root.join("films"),
            series_dir: root.join("series"),
            start_settle_secs: 0,
            watcher_settle_secs: 0,
            ..Self::default()
        }
    }
}
