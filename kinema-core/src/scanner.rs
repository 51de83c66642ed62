use crate::media::MediaFile;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// File extensions the pipeline treats as video sources.
pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "mov", "wmv", "flv", "webm", "m4v"];

/// Recursive scanner over the films and series trees.
#[derive(Debug, Clone)]
pub struct MediaScanner {
    pub films_root: PathBuf,
    pub series_root: PathBuf,
    /// Supported video file extensions (lowercase, no dot).
    pub video_extensions: Vec<String>,
}

/// Outcome of a full library scan.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanResult {
    pub films: Vec<MediaFile>,
    pub episodes: Vec<MediaFile>,
    pub errors: Vec<String>,
}

impl ScanResult {
    /// Films and episodes interleaved (film₀, ep₀, film₁, ep₁, …) so one
    /// media type cannot monopolise the queue. Both inputs are already
    /// sorted by modification time descending.
    pub fn interleaved(&self) -> Vec<MediaFile> {
        interleave(&self.films, &self.episodes)
    }
}

pub fn interleave(films: &[MediaFile], episodes: &[MediaFile]) -> Vec<MediaFile> {
    let mut out = Vec::with_capacity(films.len() + episodes.len());
    let mut films = films.iter();
    let mut episodes = episodes.iter();
    loop {
        match (films.next(), episodes.next()) {
            (None, None) => break,
            (film, episode) => {
                out.extend(film.cloned());
                out.extend(episode.cloned());
            }
        }
    }
    out
}

impl MediaScanner {
    pub fn new(films_root: PathBuf, series_root: PathBuf) -> Self {
        Self {
            films_root,
            series_root,
            video_extensions: VIDEO_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Check if a file is a supported video file based on extension.
    pub fn is_video_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.video_extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Scan both roots. A missing root is not an error; it just contributes
    /// an empty list.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();
        result.films = self.scan_root(&self.films_root, &mut result.errors);
        result.episodes = self.scan_root(&self.series_root, &mut result.errors);

        info!(
            films = result.films.len(),
            episodes = result.episodes.len(),
            errors = result.errors.len(),
            "library scan complete"
        );
        result
    }

    fn scan_root(&self, root: &Path, errors: &mut Vec<String>) -> Vec<MediaFile> {
        if !root.is_dir() {
            debug!("scan root missing, skipping: {}", root.display());
            return Vec::new();
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("error walking {}: {}", root.display(), e);
                    errors.push(format!("{}: {}", root.display(), e));
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.is_video_file(entry.path()) {
                continue;
            }

            match MediaFile::from_path(entry.path().to_path_buf()) {
                Ok(media) => files.push(media),
                Err(e) => {
                    warn!("skipping {}: {}", entry.path().display(), e);
                    errors.push(format!("{}: {}", entry.path().display(), e));
                }
            }
        }

        // Newest first, so fresh additions transcode before back-catalogue.
        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn media(name: &str, ts: i64) -> MediaFile {
        MediaFile {
            path: PathBuf::from(format!("/media/{name}")),
            filename: name.to_string(),
            size: 1,
            modified: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn recognises_video_extensions_case_insensitively() {
        let scanner = MediaScanner::new(PathBuf::from("/f"), PathBuf::from("/s"));
        assert!(scanner.is_video_file(Path::new("movie.mkv")));
        assert!(scanner.is_video_file(Path::new("MOVIE.MP4")));
        assert!(scanner.is_video_file(Path::new("clip.webm")));
        assert!(!scanner.is_video_file(Path::new("cover.jpg")));
        assert!(!scanner.is_video_file(Path::new("noext")));
    }

    #[test]
    fn missing_roots_yield_empty_lists() {
        let scanner = MediaScanner::new(
            PathBuf::from("/nonexistent/films"),
            PathBuf::from("/nonexistent/series"),
        );
        let result = scanner.scan();
        assert!(result.films.is_empty());
        assert!(result.episodes.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn scan_finds_nested_video_files() {
        let films = TempDir::new().unwrap();
        let series = TempDir::new().unwrap();
        fs::create_dir_all(films.path().join("sub")).unwrap();
        fs::write(films.path().join("a.mkv"), b"x").unwrap();
        fs::write(films.path().join("sub/b.mp4"), b"x").unwrap();
        fs::write(films.path().join("sub/ignore.txt"), b"x").unwrap();
        fs::write(series.path().join("show S01E01.mkv"), b"x").unwrap();

        let scanner =
            MediaScanner::new(films.path().to_path_buf(), series.path().to_path_buf());
        let result = scanner.scan();

        assert_eq!(result.films.len(), 2);
        assert_eq!(result.episodes.len(), 1);
        assert_eq!(result.episodes[0].filename, "show S01E01.mkv");
    }

    #[test]
    fn interleave_alternates_and_drains_the_longer_list() {
        let films = vec![media("f1.mkv", 30), media("f2.mkv", 20)];
        let episodes = vec![
            media("e1.mkv", 40),
            media("e2.mkv", 25),
            media("e3.mkv", 10),
        ];

        let names: Vec<_> = interleave(&films, &episodes)
            .into_iter()
            .map(|m| m.filename)
            .collect();
        assert_eq!(names, ["f1.mkv", "e1.mkv", "f2.mkv", "e2.mkv", "e3.mkv"]);
    }

    #[test]
    fn roots_sort_newest_first() {
        let films = TempDir::new().unwrap();
        fs::write(films.path().join("old.mkv"), b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(films.path().join("new.mkv"), b"x").unwrap();

        let scanner = MediaScanner::new(films.path().to_path_buf(), PathBuf::from("/none"));
        let result = scanner.scan();
        assert_eq!(result.films[0].filename, "new.mkv");
        assert_eq!(result.films[1].filename, "old.mkv");
    }
}
