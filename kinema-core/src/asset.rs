use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Sentinel marking a published, streamable asset. Contains the completion
/// timestamp (RFC 3339).
pub const DONE_MARKER: &str = ".done";
/// Sentinel marking an in-flight transcode owned by a worker.
pub const TRANSCODING_MARKER: &str = ".transcoding";
/// A finished playlist must reference at least this many segments before a
/// directory without `.done` is promoted to done.
pub const MIN_SEGMENTS_FOR_DONE: usize = 10;

/// Playlist names probed in preference order when no sentinel decides.
const PLAYLIST_CANDIDATES: &[&str] = &["video.m3u8", "stream_0.m3u8", "playlist.m3u8"];

/// Decide whether `output_dir` holds a valid transcoded asset.
///
/// A directory with a `.transcoding` lock is never valid. A directory with
/// `.done` always is. Otherwise the best candidate playlist is inspected: a
/// finished VOD playlist referencing at least [`MIN_SEGMENTS_FOR_DONE`]
/// segments earns a `.done` sentinel on the spot.
pub async fn is_transcoded(output_dir: &Path) -> bool {
    if tokio::fs::try_exists(output_dir.join(TRANSCODING_MARKER))
        .await
        .unwrap_or(false)
    {
        debug!("{} has a transcoding lock, not done", output_dir.display());
        return false;
    }

    if tokio::fs::try_exists(output_dir.join(DONE_MARKER))
        .await
        .unwrap_or(false)
    {
        return true;
    }

    let Some(playlist) = find_playlist(output_dir).await else {
        return false;
    };
    let Ok(content) = tokio::fs::read_to_string(&playlist).await else {
        return false;
    };

    if playlist_is_complete(&content) && segment_refs(&content).len() >= MIN_SEGMENTS_FOR_DONE {
        if let Err(e) = write_done_marker(output_dir).await {
            warn!(
                "failed to promote {} to done: {e}",
                output_dir.display()
            );
            return false;
        }
        info!("promoted {} to done", output_dir.display());
        return true;
    }

    false
}

/// Locate the playlist file to judge a directory by, in preference order.
pub async fn find_playlist(output_dir: &Path) -> Option<PathBuf> {
    for candidate in PLAYLIST_CANDIDATES {
        let path = output_dir.join(candidate);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some(path);
        }
    }
    None
}

/// Whether a playlist has been finalised (VOD, no further segments coming).
pub fn playlist_is_complete(content: &str) -> bool {
    content.contains("#EXT-X-ENDLIST")
}

/// Segment entries referenced by a playlist: every non-empty, non-comment
/// line, in order.
pub fn segment_refs(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Write the `.done` sentinel with the current timestamp.
pub async fn write_done_marker(output_dir: &Path) -> std::io::Result<()> {
    tokio::fs::write(output_dir.join(DONE_MARKER), Utc::now().to_rfc3339()).await
}

/// Write the `.transcoding` lock with the current timestamp.
pub async fn write_transcoding_marker(output_dir: &Path) -> std::io::Result<()> {
    tokio::fs::write(
        output_dir.join(TRANSCODING_MARKER),
        Utc::now().to_rfc3339(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn playlist_with_segments(n: usize) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n");
        for i in 0..n {
            out.push_str(&format!("#EXTINF:2.000000,\nvideo_segment{i}.ts\n"));
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }

    #[tokio::test]
    async fn transcoding_lock_wins_over_everything() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DONE_MARKER), "t").unwrap();
        std::fs::write(dir.path().join(TRANSCODING_MARKER), "t").unwrap();
        assert!(!is_transcoded(dir.path()).await);
    }

    #[tokio::test]
    async fn done_marker_is_sufficient() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DONE_MARKER), "t").unwrap();
        assert!(is_transcoded(dir.path()).await);
    }

    #[tokio::test]
    async fn empty_directory_is_not_done() {
        let dir = TempDir::new().unwrap();
        assert!(!is_transcoded(dir.path()).await);
    }

    #[tokio::test]
    async fn complete_playlist_promotes_to_done() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("video.m3u8"), playlist_with_segments(12)).unwrap();

        assert!(is_transcoded(dir.path()).await);
        let marker = std::fs::read_to_string(dir.path().join(DONE_MARKER)).unwrap();
        assert!(!marker.is_empty());
    }

    #[tokio::test]
    async fn short_playlist_is_not_promoted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("video.m3u8"), playlist_with_segments(5)).unwrap();

        assert!(!is_transcoded(dir.path()).await);
        assert!(!dir.path().join(DONE_MARKER).exists());
    }

    #[tokio::test]
    async fn unfinished_playlist_is_not_promoted() {
        let dir = TempDir::new().unwrap();
        let content = playlist_with_segments(12).replace("#EXT-X-ENDLIST\n", "");
        std::fs::write(dir.path().join("video.m3u8"), content).unwrap();
        assert!(!is_transcoded(dir.path()).await);
    }

    #[tokio::test]
    async fn playlist_preference_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("playlist.m3u8"), "master").unwrap();
        std::fs::write(dir.path().join("video.m3u8"), "video").unwrap();

        let found = find_playlist(dir.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "video.m3u8");
    }

    #[test]
    fn segment_refs_skip_comments_and_blanks() {
        let refs = segment_refs("#EXTM3U\n\n#EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n#EXT-X-ENDLIST\n");
        assert_eq!(refs, ["a.ts", "b.ts"]);
    }
}
