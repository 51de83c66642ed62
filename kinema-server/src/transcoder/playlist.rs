use kinema_core::asset::{playlist_is_complete, segment_refs};
use kinema_core::probe::AudioTrack;
use kinema_core::{Result, TranscodeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const MASTER_PLAYLIST_NAME: &str = "playlist.m3u8";
pub const VIDEO_PLAYLIST_NAME: &str = "video.m3u8";
pub const AUDIO_INFO_NAME: &str = "audio_info.json";

/// Advertised bandwidth for the single video rendition. A fixed figure is
/// observable in every published asset, so it stays fixed.
const MASTER_BANDWIDTH: u64 = 5_000_000;
const VIDEO_CODEC_TAG: &str = "avc1.640028";
const AUDIO_CODEC_TAG: &str = "mp4a.40.2";

/// One published audio rendition, as recorded in `audio_info.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackDescriptor {
    pub index: usize,
    pub language: String,
    pub title: String,
    pub playlist: String,
    pub is_default: bool,
}

/// Build the published descriptor list from the kept source tracks. The
/// first track is the default rendition.
pub fn audio_descriptors(audios: &[AudioTrack]) -> Vec<AudioTrackDescriptor> {
    audios
        .iter()
        .enumerate()
        .map(|(i, track)| AudioTrackDescriptor {
            index: i,
            language: track.language.clone(),
            title: track
                .title
                .clone()
                .unwrap_or_else(|| format!("Audio {}", i + 1)),
            playlist: format!("audio_{i}.m3u8"),
            is_default: i == 0,
        })
        .collect()
}

/// Render the master playlist advertising the video rendition and one
/// `EXT-X-MEDIA` entry per audio track.
pub fn master_playlist(audios: &[AudioTrackDescriptor]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:6\n");

    for audio in audios {
        out.push_str(&format!(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"{}\",LANGUAGE=\"{}\",DEFAULT={},AUTOSELECT=YES,URI=\"{}\"\n",
            audio.title,
            audio.language,
            if audio.is_default { "YES" } else { "NO" },
            audio.playlist,
        ));
    }

    if audios.is_empty() {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={MASTER_BANDWIDTH},CODECS=\"{VIDEO_CODEC_TAG}\"\n"
        ));
    } else {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={MASTER_BANDWIDTH},CODECS=\"{VIDEO_CODEC_TAG},{AUDIO_CODEC_TAG}\",AUDIO=\"audio\"\n"
        ));
    }
    out.push_str(VIDEO_PLAYLIST_NAME);
    out.push('\n');
    out
}

pub async fn write_master_playlist(
    output_dir: &Path,
    audios: &[AudioTrackDescriptor],
) -> Result<()> {
    tokio::fs::write(output_dir.join(MASTER_PLAYLIST_NAME), master_playlist(audios)).await?;
    Ok(())
}

pub async fn write_audio_info(output_dir: &Path, audios: &[AudioTrackDescriptor]) -> Result<()> {
    let json = serde_json::to_string_pretty(audios)?;
    tokio::fs::write(output_dir.join(AUDIO_INFO_NAME), json).await?;
    Ok(())
}

/// The publication gate: every playlist finished, every referenced segment
/// on disk, one sampled video segment non-empty.
pub async fn validate_output(output_dir: &Path, audios: &[AudioTrackDescriptor]) -> Result<()> {
    let video_playlist = output_dir.join(VIDEO_PLAYLIST_NAME);
    let content = tokio::fs::read_to_string(&video_playlist)
        .await
        .map_err(|e| TranscodeError::Validation(format!("missing video playlist: {e}")))?;

    if !playlist_is_complete(&content) {
        return Err(TranscodeError::Validation(
            "video playlist has no ENDLIST marker".to_string(),
        ));
    }

    let segments = segment_refs(&content);
    if segments.is_empty() {
        return Err(TranscodeError::Validation(
            "video playlist references no segments".to_string(),
        ));
    }

    for segment in &segments {
        if !tokio::fs::try_exists(output_dir.join(segment)).await.unwrap_or(false) {
            return Err(TranscodeError::Validation(format!(
                "referenced segment missing on disk: {segment}"
            )));
        }
    }

    // Spot-check one segment for content.
    let pick = sample_index(segments.len());
    let sampled = output_dir.join(&segments[pick]);
    let len = tokio::fs::metadata(&sampled).await.map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        return Err(TranscodeError::Validation(format!(
            "segment {} is empty",
            segments[pick]
        )));
    }

    for audio in audios {
        let playlist = output_dir.join(&audio.playlist);
        let content = tokio::fs::read_to_string(&playlist).await.map_err(|e| {
            TranscodeError::Validation(format!("missing audio playlist {}: {e}", audio.playlist))
        })?;
        if !playlist_is_complete(&content) {
            return Err(TranscodeError::Validation(format!(
                "audio playlist {} has no ENDLIST marker",
                audio.playlist
            )));
        }
        for segment in segment_refs(&content) {
            if !tokio::fs::try_exists(output_dir.join(&segment)).await.unwrap_or(false) {
                return Err(TranscodeError::Validation(format!(
                    "audio segment missing on disk: {segment}"
                )));
            }
        }
    }

    debug!(
        segments = segments.len(),
        audios = audios.len(),
        "validated {}",
        output_dir.display()
    );
    Ok(())
}

fn sample_index(len: usize) -> usize {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as usize)
        .unwrap_or(0);
    nanos % len.max(1)
}
