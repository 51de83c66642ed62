use super::job::TranscodeJob;
use chrono::{DateTime, Utc};
use kinema_core::{Result, TranscodeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// The persisted queue document. Jobs that were active at save time are
/// written into `queue` ahead of the pending ones, still carrying their
/// `transcoding` status; the loader re-queues them (FFmpeg cannot resume
/// mid-segment reliably).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateFile {
    pub version: u32,
    pub queue: Vec<TranscodeJob>,
    pub completed_jobs: Vec<TranscodeJob>,
    pub is_running: bool,
    pub is_paused: bool,
    pub last_saved: DateTime<Utc>,
}

impl QueueStateFile {
    pub fn empty() -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            queue: Vec::new(),
            completed_jobs: Vec::new(),
            is_running: false,
            is_paused: false,
            last_saved: Utc::now(),
        }
    }
}

/// Write the state file atomically: serialize to a `.tmp` sibling, then
/// rename over the target.
pub async fn save_state(path: &Path, state: &QueueStateFile) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, json.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;

    debug!(
        pending = state.queue.len(),
        completed = state.completed_jobs.len(),
        "queue state saved to {}",
        path.display()
    );
    Ok(())
}

/// Load the state file, tolerating absence. A document that fails to parse
/// is treated as absent (and logged): the queue restarts empty rather than
/// refusing to boot.
pub async fn load_state(path: &Path) -> Result<Option<QueueStateFile>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice::<QueueStateFile>(&bytes) {
        Ok(state) => {
            if state.version != STATE_SCHEMA_VERSION {
                warn!(
                    version = state.version,
                    "queue state has unknown schema version, loading best-effort"
                );
            }
            Ok(Some(state))
        }
        Err(e) => {
            warn!("queue state at {} is unreadable: {e}", path.display());
            Err(TranscodeError::Persistence(format!(
                "unreadable state file: {e}"
            )))
        }
    }
}
