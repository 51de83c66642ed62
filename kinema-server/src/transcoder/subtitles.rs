use kinema_core::probe::SubtitleTrack;
use kinema_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const SUBTITLES_INFO_NAME: &str = "subtitles.json";

const BATCH_TIMEOUT: Duration = Duration::from_secs(120);
const SINGLE_TRACK_TIMEOUT: Duration = Duration::from_secs(60);

/// One extracted subtitle file, as recorded in `subtitles.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleFile {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub file: String,
}

pub fn subtitle_file_name(track: &SubtitleTrack, ordinal: usize) -> String {
    format!("sub_{}_{}.vtt", track.language, ordinal)
}

/// Extract every text subtitle track to WebVTT.
///
/// One batch FFmpeg invocation reads the source once for all tracks; if the
/// batch fails, each track is retried individually and only the failing
/// ones are dropped. Extraction failures never fail the job.
pub async fn extract_subtitles(
    ffmpeg_path: &str,
    source: &Path,
    output_dir: &Path,
    tracks: &[SubtitleTrack],
) -> Vec<SubtitleFile> {
    if tracks.is_empty() {
        return Vec::new();
    }

    if run_batch(ffmpeg_path, source, output_dir, tracks).await {
        return tracks
            .iter()
            .enumerate()
            .map(|(i, track)| subtitle_record(track, i))
            .collect();
    }

    warn!(
        "batch subtitle extraction failed for {}, retrying per track",
        source.display()
    );

    let mut extracted = Vec::new();
    for (i, track) in tracks.iter().enumerate() {
        if run_single(ffmpeg_path, source, output_dir, track, i).await {
            extracted.push(subtitle_record(track, i));
        } else {
            warn!(
                "dropping subtitle track {} ({}) of {}",
                track.source_index,
                track.language,
                source.display()
            );
        }
    }
    extracted
}

pub async fn write_subtitles_json(output_dir: &Path, subtitles: &[SubtitleFile]) -> Result<()> {
    let json = serde_json::to_string_pretty(subtitles)?;
    tokio::fs::write(output_dir.join(SUBTITLES_INFO_NAME), json).await?;
    Ok(())
}

fn subtitle_record(track: &SubtitleTrack, ordinal: usize) -> SubtitleFile {
    SubtitleFile {
        language: track.language.clone(),
        title: track.title.clone(),
        file: subtitle_file_name(track, ordinal),
    }
}

async fn run_batch(
    ffmpeg_path: &str,
    source: &Path,
    output_dir: &Path,
    tracks: &[SubtitleTrack],
) -> bool {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-nostdin".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
    ];
    for (i, track) in tracks.iter().enumerate() {
        args.extend([
            "-map".into(),
            format!("0:{}", track.source_index),
            "-c:s".into(),
            "webvtt".into(),
            output_dir
                .join(subtitle_file_name(track, i))
                .to_string_lossy()
                .into_owned(),
        ]);
    }
    run_ffmpeg_quiet(ffmpeg_path, &args, BATCH_TIMEOUT).await
}

async fn run_single(
    ffmpeg_path: &str,
    source: &Path,
    output_dir: &Path,
    track: &SubtitleTrack,
    ordinal: usize,
) -> bool {
    let args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-nostdin".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-map".into(),
        format!("0:{}", track.source_index),
        "-c:s".into(),
        "webvtt".into(),
        output_dir
            .join(subtitle_file_name(track, ordinal))
            .to_string_lossy()
            .into_owned(),
    ];
    run_ffmpeg_quiet(ffmpeg_path, &args, SINGLE_TRACK_TIMEOUT).await
}

async fn run_ffmpeg_quiet(ffmpeg_path: &str, args: &[String], timeout: Duration) -> bool {
    debug!("subtitle extraction: {ffmpeg_path} {}", args.join(" "));
    let child = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    matches!(tokio::time::timeout(timeout, child).await, Ok(Ok(status)) if status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(language: &str, index: usize) -> SubtitleTrack {
        SubtitleTrack {
            source_index: index,
            language: language.into(),
            title: None,
            codec: "subrip".into(),
        }
    }

    #[test]
    fn file_names_use_language_and_ordinal() {
        assert_eq!(subtitle_file_name(&track("eng", 3), 0), "sub_eng_0.vtt");
        assert_eq!(subtitle_file_name(&track("fre", 5), 2), "sub_fre_2.vtt");
    }

    #[test]
    fn subtitle_json_omits_missing_title() {
        let record = subtitle_record(&track("eng", 2), 0);
        let json = serde_json::to_value(vec![record]).unwrap();
        assert_eq!(json[0]["language"], "eng");
        assert_eq!(json[0]["file"], "sub_eng_0.vtt");
        assert!(json[0].get("title").is_none());
    }

    #[tokio::test]
    async fn extraction_with_no_tracks_is_empty() {
        let out = extract_subtitles("ffmpeg", Path::new("/nope.mkv"), Path::new("/tmp"), &[]).await;
        assert!(out.is_empty());
    }
}
