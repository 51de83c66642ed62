use crate::hardware::{Acceleration, HardwareCapabilities};
use kinema_core::probe::AudioTrack;
use std::path::Path;

/// How the decode half of the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Hardware,
    Software,
}

/// The chosen decode/encode pipeline for one job.
#[derive(Debug, Clone)]
pub struct EncodePlan {
    pub decode: DecodeMode,
    pub decoder_args: Vec<String>,
    pub encoder_args: Vec<String>,
    /// Software-decoded frames must be uploaded to the GPU before a
    /// hardware encoder can take them.
    pub upload_filter: bool,
    /// Whether a failed hardware decode should be retried with software
    /// decode (HEVC on VAAPI).
    pub retry_with_software_decode: bool,
}

impl EncodePlan {
    /// VAAPI sources decode and encode on the GPU, with HEVC keeping a
    /// software-decode escape hatch for drivers that reject the stream.
    /// Every other capability record runs the conservative software
    /// pipeline.
    pub fn build(caps: &HardwareCapabilities, source_is_hevc: bool) -> Self {
        match caps.acceleration {
            Acceleration::Vaapi => Self {
                decode: DecodeMode::Hardware,
                decoder_args: caps.decoder_args.clone(),
                encoder_args: caps.encoder_args.clone(),
                upload_filter: false,
                retry_with_software_decode: source_is_hevc,
            },
            _ => Self::software(),
        }
    }

    /// Conservative software pipeline.
    pub fn software() -> Self {
        Self {
            decode: DecodeMode::Software,
            decoder_args: Vec::new(),
            encoder_args: vec![
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-crf".into(),
                "23".into(),
            ],
            upload_filter: false,
            retry_with_software_decode: false,
        }
    }

    /// Same encoder, software decode. Used after a hardware decode failure.
    pub fn with_software_decode(&self) -> Self {
        let mut plan = self.clone();
        plan.decode = DecodeMode::Software;
        plan.decoder_args = Vec::new();
        plan.retry_with_software_decode = false;
        // Hardware encoders take GPU surfaces; software-decoded frames need
        // the upload filter in front.
        plan.upload_filter = self
            .encoder_args
            .iter()
            .any(|a| a.contains("vaapi") || a.contains("qsv"));
        plan
    }
}

/// GOP geometry derived from the probed frame rate, aligned to segment
/// boundaries so every segment starts on a keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GopSettings {
    pub gop_size: u32,
    pub keyint_min: u32,
}

impl GopSettings {
    pub fn for_frame_rate(fps: f64, segment_duration: u32) -> Self {
        Self {
            gop_size: (fps * segment_duration as f64).round().max(1.0) as u32,
            keyint_min: fps.round().max(1.0) as u32,
        }
    }
}

fn hls_output_args(
    output_dir: &Path,
    segment_duration: u32,
    segment_pattern: &str,
    playlist: &str,
) -> Vec<String> {
    vec![
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_flags".into(),
        "independent_segments".into(),
        "-hls_segment_filename".into(),
        output_dir.join(segment_pattern).to_string_lossy().into_owned(),
        output_dir.join(playlist).to_string_lossy().into_owned(),
    ]
}

fn video_output_args(plan: &EncodePlan, gop: GopSettings, segment_duration: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-map".into(), "0:v:0".into()];
    args.extend(plan.encoder_args.iter().cloned());
    if plan.upload_filter {
        args.push("-vf".into());
        args.push("format=nv12,hwupload".into());
    }
    args.extend([
        "-g".into(),
        gop.gop_size.to_string(),
        "-keyint_min".into(),
        gop.keyint_min.to_string(),
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{segment_duration})"),
        "-an".into(),
        "-sn".into(),
    ]);
    args
}

fn audio_output_args(track: &AudioTrack) -> Vec<String> {
    vec![
        "-map".into(),
        format!("0:{}", track.source_index),
        "-c:a".into(),
        "aac".into(),
        "-ac".into(),
        "2".into(),
        "-ar".into(),
        "48000".into(),
        "-b:a".into(),
        "192k".into(),
        "-vn".into(),
        "-sn".into(),
    ]
}

/// One FFmpeg invocation producing the video rendition and every audio
/// rendition in a single read of the source.
pub fn single_pass_args(
    source: &Path,
    output_dir: &Path,
    plan: &EncodePlan,
    audios: &[AudioTrack],
    gop: GopSettings,
    segment_duration: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into(), "-nostdin".into()];
    args.extend(plan.decoder_args.iter().cloned());
    args.extend(["-i".into(), source.to_string_lossy().into_owned()]);

    args.extend(video_output_args(plan, gop, segment_duration));
    args.extend(hls_output_args(
        output_dir,
        segment_duration,
        "video_segment%d.ts",
        "video.m3u8",
    ));

    for (i, track) in audios.iter().enumerate() {
        args.extend(audio_output_args(track));
        args.extend(hls_output_args(
            output_dir,
            segment_duration,
            &format!("audio_{i}_segment%d.ts"),
            &format!("audio_{i}.m3u8"),
        ));
    }
    args
}

/// Fallback: the video rendition alone.
pub fn video_pass_args(
    source: &Path,
    output_dir: &Path,
    plan: &EncodePlan,
    gop: GopSettings,
    segment_duration: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into(), "-nostdin".into()];
    args.extend(plan.decoder_args.iter().cloned());
    args.extend(["-i".into(), source.to_string_lossy().into_owned()]);
    args.extend(video_output_args(plan, gop, segment_duration));
    args.extend(hls_output_args(
        output_dir,
        segment_duration,
        "video_segment%d.ts",
        "video.m3u8",
    ));
    args
}

/// Fallback: one audio rendition alone.
pub fn audio_pass_args(
    source: &Path,
    output_dir: &Path,
    track: &AudioTrack,
    ordinal: usize,
    segment_duration: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-nostdin".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
    ];
    args.extend(audio_output_args(track));
    args.extend(hls_output_args(
        output_dir,
        segment_duration,
        &format!("audio_{ordinal}_segment%d.ts"),
        &format!("audio_{ordinal}.m3u8"),
    ));
    args
}
