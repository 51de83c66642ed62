//! Startup and on-demand sweeps over the transcoded tree.

use kinema_core::asset::{
    find_playlist, playlist_is_complete, write_done_marker, DONE_MARKER, MIN_SEGMENTS_FOR_DONE,
    TRANSCODING_MARKER,
};
use kinema_core::layout::SERIES_SUBDIR;
use kinema_core::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of [`cleanup_incomplete`]: asset names relative to the
/// transcoded root (episodes prefixed `series/`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub kept: Vec<String>,
    pub cleaned: Vec<String>,
}

/// Remove every output directory still carrying a `.transcoding` lock.
/// Run once at startup; the caller must re-scan afterwards so the affected
/// sources re-enter the queue.
pub async fn cleanup_interrupted(transcoded_root: &Path) -> Result<Vec<String>> {
    let mut removed = Vec::new();

    for (dir, name) in asset_dirs(transcoded_root).await? {
        if tokio::fs::try_exists(dir.join(TRANSCODING_MARKER))
            .await
            .unwrap_or(false)
        {
            info!("removing interrupted transcode {}", name);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("failed to remove {}: {e}", dir.display());
            } else {
                removed.push(name);
            }
        }
    }

    if !removed.is_empty() {
        info!("cleanup removed {} interrupted directories", removed.len());
    }
    Ok(removed)
}

/// Admin sweep: drop interrupted directories, promote directories that have
/// a finished playlist and enough segments, delete the rest of the
/// unfinished ones.
pub async fn cleanup_incomplete(transcoded_root: &Path) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for (dir, name) in asset_dirs(transcoded_root).await? {
        if tokio::fs::try_exists(dir.join(TRANSCODING_MARKER))
            .await
            .unwrap_or(false)
        {
            remove_dir(&dir, &name, &mut report.cleaned).await;
            continue;
        }

        if tokio::fs::try_exists(dir.join(DONE_MARKER))
            .await
            .unwrap_or(false)
        {
            report.kept.push(name);
            continue;
        }

        if is_promotable(&dir).await {
            if let Err(e) = write_done_marker(&dir).await {
                warn!("failed to promote {}: {e}", dir.display());
                continue;
            }
            info!("promoted {} to done", name);
            report.kept.push(name);
        } else {
            remove_dir(&dir, &name, &mut report.cleaned).await;
        }
    }

    info!(
        kept = report.kept.len(),
        cleaned = report.cleaned.len(),
        "incomplete-output sweep finished"
    );
    Ok(report)
}

/// A directory qualifies for promotion when its best playlist is finalised
/// and enough video segments exist on disk.
async fn is_promotable(dir: &Path) -> bool {
    let Some(playlist) = find_playlist(dir).await else {
        return false;
    };
    let Ok(content) = tokio::fs::read_to_string(&playlist).await else {
        return false;
    };
    playlist_is_complete(&content) && count_video_segments(dir).await >= MIN_SEGMENTS_FOR_DONE
}

async fn count_video_segments(dir: &Path) -> usize {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("video_segment") && name.ends_with(".ts") {
            count += 1;
        }
    }
    count
}

async fn remove_dir(dir: &Path, name: &str, cleaned: &mut Vec<String>) {
    info!("removing incomplete transcode {}", name);
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!("failed to remove {}: {e}", dir.display());
    } else {
        cleaned.push(name.to_string());
    }
}

/// Every asset directory under the root: top-level film directories plus
/// one level under `series/`. The state file and the series container are
/// not assets.
pub(crate) async fn asset_dirs(transcoded_root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut dirs = Vec::new();
    if !tokio::fs::try_exists(transcoded_root).await.unwrap_or(false) {
        return Ok(dirs);
    }

    let mut entries = tokio::fs::read_dir(transcoded_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == SERIES_SUBDIR {
            let mut series = tokio::fs::read_dir(&path).await?;
            while let Some(episode) = series.next_entry().await? {
                let episode_path = episode.path();
                if episode_path.is_dir() {
                    let episode_name = episode.file_name().to_string_lossy().into_owned();
                    dirs.push((episode_path, format!("{SERIES_SUBDIR}/{episode_name}")));
                }
            }
        } else {
            dirs.push((path, name));
        }
    }

    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn complete_playlist(n: usize) -> String {
        let mut out = String::from("#EXTM3U\n");
        for i in 0..n {
            out.push_str(&format!("#EXTINF:2.0,\nvideo_segment{i}.ts\n"));
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }

    fn make_asset(root: &Path, rel: &str, segments: usize, endlist: bool) -> PathBuf {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        let mut playlist = complete_playlist(segments);
        if !endlist {
            playlist = playlist.replace("#EXT-X-ENDLIST\n", "");
        }
        std::fs::write(dir.join("video.m3u8"), playlist).unwrap();
        for i in 0..segments {
            std::fs::write(dir.join(format!("video_segment{i}.ts")), b"x").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn interrupted_directories_are_removed_including_episodes() {
        let root = TempDir::new().unwrap();
        let film = make_asset(root.path(), "Film", 3, false);
        std::fs::write(film.join(TRANSCODING_MARKER), "t").unwrap();
        let episode = make_asset(root.path(), "series/Show S01E01", 3, false);
        std::fs::write(episode.join(TRANSCODING_MARKER), "t").unwrap();
        let healthy = make_asset(root.path(), "Done Film", 12, true);
        std::fs::write(healthy.join(DONE_MARKER), "t").unwrap();

        let removed = cleanup_interrupted(root.path()).await.unwrap();

        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&"Film".to_string()));
        assert!(removed.contains(&"series/Show S01E01".to_string()));
        assert!(!film.exists());
        assert!(!episode.exists());
        assert!(healthy.exists());
    }

    #[tokio::test]
    async fn incomplete_sweep_promotes_finished_directories() {
        let root = TempDir::new().unwrap();
        let promotable = make_asset(root.path(), "Almost Done", 12, true);
        let short = make_asset(root.path(), "Too Short", 4, true);
        let unfinished = make_asset(root.path(), "No Endlist", 15, false);

        let report = cleanup_incomplete(root.path()).await.unwrap();

        assert!(report.kept.contains(&"Almost Done".to_string()));
        assert!(promotable.join(DONE_MARKER).exists());
        assert!(report.cleaned.contains(&"Too Short".to_string()));
        assert!(report.cleaned.contains(&"No Endlist".to_string()));
        assert!(!short.exists());
        assert!(!unfinished.exists());
    }

    #[tokio::test]
    async fn done_directories_are_kept_untouched() {
        let root = TempDir::new().unwrap();
        let done = make_asset(root.path(), "series/Show S01E02", 2, false);
        std::fs::write(done.join(DONE_MARKER), "t").unwrap();

        let report = cleanup_incomplete(root.path()).await.unwrap();
        assert_eq!(report.kept, vec!["series/Show S01E02".to_string()]);
        assert!(report.cleaned.is_empty());
        assert!(done.exists());
    }

    #[tokio::test]
    async fn missing_root_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("nope");
        assert!(cleanup_interrupted(&missing).await.unwrap().is_empty());
        let report = cleanup_incomplete(&missing).await.unwrap();
        assert!(report.kept.is_empty() && report.cleaned.is_empty());
    }
}
