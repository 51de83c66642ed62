//! Shared fixtures: a stub ffmpeg/ffprobe toolchain that fabricates HLS
//! output without touching real media.
#![allow(dead_code)]

use kinema_server::TranscodeConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Stub `ffmpeg`: writes the playlists, segments and subtitle files named
/// in its arguments. When a `fail_hwaccel` marker sits next to the script,
/// any invocation with a bare `vaapi` argument (hardware decode) fails with
/// a decode-side error instead.
const FFMPEG_STUB: &str = r##"#!/bin/sh
here=$(dirname "$0")
if [ -e "$here/fail_hwaccel" ]; then
  for a in "$@"; do
    if [ "$a" = "vaapi" ]; then
      echo "Failed to initialise VAAPI frame context" >&2
      exit 1
    fi
  done
fi

emit_hls() {
  pattern="$1"; playlist="$2"
  {
    echo "#EXTM3U"
    echo "#EXT-X-VERSION:6"
    echo "#EXT-X-TARGETDURATION:2"
    i=0
    while [ $i -lt 3 ]; do
      seg=$(printf '%s' "$pattern" | sed "s/%d/$i/")
      printf 'segment-data' > "$seg"
      echo "#EXTINF:2.000000,"
      basename "$seg"
      i=$((i+1))
    done
    echo "#EXT-X-ENDLIST"
  } > "$playlist"
}

prev=""
pattern=""
for a in "$@"; do
  if [ "$prev" = "-hls_segment_filename" ]; then
    pattern="$a"
  else
    case "$a" in
      *.vtt) printf 'WEBVTT\n\n' > "$a" ;;
      *.m3u8) if [ -n "$pattern" ]; then emit_hls "$pattern" "$a"; pattern=""; fi ;;
    esac
  fi
  prev="$a"
done
echo "frame=  100 fps= 50 q=28.0 size=  256KiB time=00:00:06.00 bitrate= 349.5kbits/s speed=3.0x" >&2
exit 0
"##;

const FFPROBE_STUB: &str = r#"#!/bin/sh
cat "$(dirname "$0")/probe.json"
"#;

pub struct StubToolchain {
    pub dir: TempDir,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl StubToolchain {
    pub fn new(probe_json: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        let ffprobe = dir.path().join("ffprobe");
        write_executable(&ffmpeg, FFMPEG_STUB);
        write_executable(&ffprobe, FFPROBE_STUB);
        std::fs::write(dir.path().join("probe.json"), probe_json).unwrap();
        Self {
            dir,
            ffmpeg,
            ffprobe,
        }
    }

    /// Make every hardware-decode invocation fail.
    pub fn fail_hardware_decode(&self) {
        std::fs::write(self.dir.path().join("fail_hwaccel"), b"1").unwrap();
    }

    pub fn config(&self, root: &Path) -> TranscodeConfig {
        let mut config = TranscodeConfig::rooted_at(root);
        config.ffmpeg_path = self.ffmpeg.to_string_lossy().into_owned();
        config.ffprobe_path = self.ffprobe.to_string_lossy().into_owned();
        config
    }
}

fn write_executable(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Probe document: one H.264 video stream plus one French AAC track.
pub fn probe_single_audio() -> String {
    serde_json::json!({
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "avg_frame_rate": "25/1", "codec_tag_string": "avc1"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "channels": 2, "codec_tag_string": "mp4a", "tags": {"language": "fre"}}
        ],
        "format": {"duration": "120.000000"}
    })
    .to_string()
}

/// Probe document: eng+fre audio and one SRT subtitle.
pub fn probe_two_audios_one_subtitle() -> String {
    serde_json::json!({
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "avg_frame_rate": "24000/1001"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "channels": 2, "tags": {"language": "eng"}},
            {"index": 2, "codec_type": "audio", "codec_name": "ac3",
             "channels": 6, "tags": {"language": "fre"}},
            {"index": 3, "codec_type": "subtitle", "codec_name": "subrip",
             "tags": {"language": "eng"}}
        ],
        "format": {"duration": "90.000000"}
    })
    .to_string()
}

/// Probe document: a PGS track that must be ignored next to an SRT track.
pub fn probe_bitmap_and_text_subtitles() -> String {
    serde_json::json!({
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "avg_frame_rate": "25/1"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "channels": 2, "tags": {"language": "eng"}},
            {"index": 2, "codec_type": "subtitle", "codec_name": "hdmv_pgs_subtitle",
             "tags": {"language": "eng"}},
            {"index": 3, "codec_type": "subtitle", "codec_name": "subrip",
             "tags": {"language": "eng"}}
        ],
        "format": {"duration": "60.000000"}
    })
    .to_string()
}

/// Probe document: an HEVC source, for the hardware-decode fallback path.
pub fn probe_hevc_single_audio() -> String {
    serde_json::json!({
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "hevc",
             "avg_frame_rate": "24/1"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "channels": 2, "tags": {"language": "eng"}}
        ],
        "format": {"duration": "120.000000"}
    })
    .to_string()
}

/// Poll until `pred` holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut pred: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pred().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
