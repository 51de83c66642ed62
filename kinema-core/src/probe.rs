use crate::error::{Result, TranscodeError};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Duration assumed when the container will not reveal one.
pub const FALLBACK_DURATION_SECONDS: f64 = 7200.0;
/// Frame rate assumed when the container will not reveal one.
pub const FALLBACK_FRAME_RATE: f64 = 24.0;
/// Per-invocation budget for codec and frame-rate probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bitmap subtitle codecs (and their ffprobe aliases) that cannot be turned
/// into WebVTT without OCR. Always skipped.
pub const BITMAP_SUBTITLE_CODECS: &[&str] = &[
    "hdmv_pgs_subtitle",
    "pgssub",
    "pgs",
    "dvd_subtitle",
    "dvdsub",
    "vobsub",
    "dvb_subtitle",
    "dvbsub",
    "xsub",
];

/// Codec tags marking an encrypted track.
const ENCRYPTED_CODEC_TAGS: &[&str] = &["enca", "encv"];

/// Probe stderr markers that mean the container itself is unreadable.
const CORRUPTION_MARKERS: &[&str] = &["Invalid data", "EBML header", "parsing failed"];

/// One kept audio track from the source.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AudioTrack {
    pub source_index: usize,
    pub language: String,
    pub title: Option<String>,
}

/// One kept text subtitle track from the source.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SubtitleTrack {
    pub source_index: usize,
    pub language: String,
    pub title: Option<String>,
    pub codec: String,
}

/// Filtered probe result for one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub audios: Vec<AudioTrack>,
    pub subtitles: Vec<SubtitleTrack>,
}

impl StreamInfo {
    /// Synthetic result used when a probe fails for a reason other than
    /// container corruption: assume one undetermined audio track so the
    /// encode can still proceed.
    pub fn fallback() -> Self {
        Self {
            audios: vec![AudioTrack {
                source_index: 0,
                language: "und".to_string(),
                title: None,
            }],
            subtitles: Vec::new(),
        }
    }

    pub fn audio_count(&self) -> usize {
        self.audios.len()
    }

    pub fn subtitle_count(&self) -> usize {
        self.subtitles.len()
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    codec_name: Option<String>,
    codec_tag_string: Option<String>,
    channels: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    tags: Option<FfprobeTags>,
}

#[derive(Debug, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Thin wrapper over the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_path: String,
}

impl Prober {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// List audio and subtitle tracks of a source, filtered per the rules
    /// above. Corruption-class failures are fatal; anything else degrades to
    /// [`StreamInfo::fallback`].
    pub async fn probe_streams(&self, source: &Path) -> Result<StreamInfo> {
        match self.run_ffprobe(source).await {
            Ok(output) => Ok(filter_streams(&output.streams)),
            Err(TranscodeError::CorruptedSource(msg)) => {
                Err(TranscodeError::CorruptedSource(msg))
            }
            Err(e) => {
                warn!("stream probe failed for {}: {e}", source.display());
                Ok(StreamInfo::fallback())
            }
        }
    }

    /// Container duration in seconds; falls back to two hours.
    pub async fn probe_duration(&self, source: &Path) -> f64 {
        let duration = match self.run_ffprobe(source).await {
            Ok(output) => output
                .format
                .and_then(|f| f.duration)
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0),
            Err(e) => {
                warn!("duration probe failed for {}: {e}", source.display());
                None
            }
        };
        duration.unwrap_or(FALLBACK_DURATION_SECONDS)
    }

    /// Average frame rate of the first video stream; falls back to 24 fps.
    pub async fn probe_frame_rate(&self, source: &Path) -> f64 {
        let rate = match self.run_ffprobe(source).await {
            Ok(output) => output
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some("video"))
                .and_then(|s| {
                    parse_frame_rate(s.avg_frame_rate.as_deref())
                        .or_else(|| parse_frame_rate(s.r_frame_rate.as_deref()))
                }),
            Err(e) => {
                warn!("frame rate probe failed for {}: {e}", source.display());
                None
            }
        };
        rate.unwrap_or(FALLBACK_FRAME_RATE)
    }

    /// Codec name of the first video stream, if any.
    pub async fn probe_video_codec(&self, source: &Path) -> Option<String> {
        self.run_ffprobe(source)
            .await
            .ok()?
            .streams
            .into_iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.codec_name)
    }

    async fn run_ffprobe(&self, source: &Path) -> Result<FfprobeOutput> {
        let child = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(PROBE_TIMEOUT, child)
            .await
            .map_err(|_| {
                TranscodeError::TranscoderCrash(format!(
                    "ffprobe timed out after {}s",
                    PROBE_TIMEOUT.as_secs()
                ))
            })??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if CORRUPTION_MARKERS.iter().any(|m| stderr.contains(m)) {
                return Err(TranscodeError::CorruptedSource(
                    stderr.lines().next().unwrap_or("unreadable container").to_string(),
                ));
            }
            return Err(TranscodeError::TranscoderCrash(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)?;
        debug!(
            streams = parsed.streams.len(),
            "probed {}",
            source.display()
        );
        Ok(parsed)
    }
}

fn filter_streams(streams: &[FfprobeStream]) -> StreamInfo {
    let mut info = StreamInfo::default();

    for stream in streams {
        let tags = stream.tags.as_ref();
        let language = tags
            .and_then(|t| t.language.clone())
            .unwrap_or_else(|| "und".to_string());
        let title = tags.and_then(|t| t.title.clone());

        match stream.codec_type.as_deref() {
            Some("audio") => {
                if audio_is_usable(stream) {
                    info.audios.push(AudioTrack {
                        source_index: stream.index,
                        language,
                        title,
                    });
                }
            }
            Some("subtitle") => {
                let Some(codec) = stream.codec_name.as_deref() else {
                    continue;
                };
                if !BITMAP_SUBTITLE_CODECS.contains(&codec) {
                    info.subtitles.push(SubtitleTrack {
                        source_index: stream.index,
                        language,
                        title,
                        codec: codec.to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    info
}

fn audio_is_usable(stream: &FfprobeStream) -> bool {
    let has_codec = stream
        .codec_name
        .as_deref()
        .is_some_and(|c| !c.is_empty() && c != "none" && c != "unknown");
    let encrypted = stream
        .codec_tag_string
        .as_deref()
        .is_some_and(|t| ENCRYPTED_CODEC_TAGS.contains(&t));
    let has_channels = stream.channels.unwrap_or(0) > 0;

    has_codec && has_channels && !encrypted
}

fn parse_frame_rate(raw: Option<&str>) -> Option<f64> {
    let raw = raw?;
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { return None; }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(json: serde_json::Value) -> FfprobeStream {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn filters_unusable_audio_tracks() {
        let streams = vec![
            stream(serde_json::json!({
                "index": 1, "codec_type": "audio", "codec_name": "aac",
                "channels": 6, "tags": {"language": "fre"}
            })),
            // Encrypted
            stream(serde_json::json!({
                "index": 2, "codec_type": "audio", "codec_name": "aac",
                "codec_tag_string": "enca", "channels": 2
            })),
            // Zero channels
            stream(serde_json::json!({
                "index": 3, "codec_type": "audio", "codec_name": "aac", "channels": 0
            })),
            // Codec-less
            stream(serde_json::json!({
                "index": 4, "codec_type": "audio", "channels": 2
            })),
        ];

        let info = filter_streams(&streams);
        assert_eq!(info.audio_count(), 1);
        assert_eq!(info.audios[0].source_index, 1);
        assert_eq!(info.audios[0].language, "fre");
    }

    #[test]
    fn drops_bitmap_subtitles_keeps_text() {
        let streams = vec![
            stream(serde_json::json!({
                "index": 2, "codec_type": "subtitle", "codec_name": "hdmv_pgs_subtitle",
                "tags": {"language": "eng"}
            })),
            stream(serde_json::json!({
                "index": 3, "codec_type": "subtitle", "codec_name": "subrip",
                "tags": {"language": "eng", "title": "Full"}
            })),
            stream(serde_json::json!({
                "index": 4, "codec_type": "subtitle", "codec_name": "dvd_subtitle"
            })),
        ];

        let info = filter_streams(&streams);
        assert_eq!(info.subtitle_count(), 1);
        assert_eq!(info.subtitles[0].codec, "subrip");
        assert_eq!(info.subtitles[0].title.as_deref(), Some("Full"));
    }

    #[test]
    fn missing_language_becomes_und() {
        let streams = vec![stream(serde_json::json!({
            "index": 1, "codec_type": "audio", "codec_name": "ac3", "channels": 2
        }))];
        assert_eq!(filter_streams(&streams).audios[0].language, "und");
    }

    #[test]
    fn frame_rate_fraction_parsing() {
        assert_eq!(parse_frame_rate(Some("24000/1001")), Some(24000.0 / 1001.0));
        assert_eq!(parse_frame_rate(Some("25/1")), Some(25.0));
        assert_eq!(parse_frame_rate(Some("30")), Some(30.0));
        assert_eq!(parse_frame_rate(Some("0/0")), None);
        assert_eq!(parse_frame_rate(Some("nonsense")), None);
        assert_eq!(parse_frame_rate(None), None);
    }

    #[test]
    fn fallback_info_has_single_undetermined_audio() {
        let info = StreamInfo::fallback();
        assert_eq!(info.audio_count(), 1);
        assert_eq!(info.audios[0].language, "und");
        assert_eq!(info.subtitle_count(), 0);
    }
}
