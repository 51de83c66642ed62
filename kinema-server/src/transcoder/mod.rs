//! Per-job transcoding state machine: lock, probe, extract, encode,
//! validate, publish.

pub mod encode;
pub mod playlist;
pub mod progress;
pub mod subtitles;

use crate::config::TranscodeConfig;
use crate::hardware::HardwareProvider;
use crate::queue::{JobHandle, TranscodeJob};
use encode::{
    audio_pass_args, single_pass_args, video_pass_args, EncodePlan, GopSettings,
};
use kinema_core::asset::{write_done_marker, write_transcoding_marker, TRANSCODING_MARKER};
use kinema_core::probe::{AudioTrack, Prober, StreamInfo};
use kinema_core::{Result, TranscodeError};
use playlist::{audio_descriptors, AudioTrackDescriptor};
use progress::{parse_progress_line, PassWeight};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of FFmpeg stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 30;
/// Niceness applied to FFmpeg children; I/O priority follows CPU nice under
/// the default schedulers.
#[cfg(unix)]
const CHILD_NICENESS: i32 = 10;

pub struct Transcoder {
    config: Arc<TranscodeConfig>,
    prober: Prober,
    hardware: Arc<dyn HardwareProvider>,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("prober", &self.prober)
            .finish()
    }
}

impl Transcoder {
    pub fn new(config: Arc<TranscodeConfig>, hardware: Arc<dyn HardwareProvider>) -> Self {
        let prober = Prober::new(config.ffprobe_path.clone());
        Self {
            config,
            prober,
            hardware,
        }
    }

    /// Run one job end to end. On success the output directory carries
    /// `.done` and no `.transcoding`. Every error path removes the lock so
    /// the directory is never left looking healthy.
    pub async fn run(&self, job: &TranscodeJob, handle: &JobHandle) -> Result<()> {
        let output_dir = &job.output_dir;
        let source = &job.source_path;

        // Take ownership of the output directory.
        tokio::fs::create_dir_all(output_dir).await?;
        write_transcoding_marker(output_dir).await?;
        info!("transcoding {} -> {}", source.display(), output_dir.display());

        match self.run_locked(job, handle).await {
            Ok(()) => {
                // Publish: drop the lock, then the completion sentinel.
                tokio::fs::remove_file(output_dir.join(TRANSCODING_MARKER)).await?;
                write_done_marker(output_dir).await?;
                info!("published {}", output_dir.display());
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) =
                    tokio::fs::remove_file(output_dir.join(TRANSCODING_MARKER)).await
                {
                    warn!(
                        "failed to drop transcoding lock in {}: {cleanup}",
                        output_dir.display()
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_locked(&self, job: &TranscodeJob, handle: &JobHandle) -> Result<()> {
        let output_dir = &job.output_dir;
        let source = &job.source_path;

        let duration = self.prober.probe_duration(source).await;
        handle.set_estimated_duration(duration).await;

        // Corruption here is fatal and propagates; other probe failures
        // degrade inside the prober.
        let stream_info = self.prober.probe_streams(source).await?;

        let caps = self.hardware.capabilities().await;
        let source_codec = self.prober.probe_video_codec(source).await;
        let source_is_hevc = matches!(source_codec.as_deref(), Some("hevc") | Some("h265"));
        let plan = EncodePlan::build(&caps, source_is_hevc);
        debug!(
            ?source_codec,
            acceleration = ?caps.acceleration,
            decode = ?plan.decode,
            "encode plan for {}",
            source.display()
        );

        let fps = self.prober.probe_frame_rate(source).await;
        let gop = GopSettings::for_frame_rate(fps, self.config.segment_duration_seconds);

        let extracted = subtitles::extract_subtitles(
            &self.config.ffmpeg_path,
            source,
            output_dir,
            &stream_info.subtitles,
        )
        .await;
        subtitles::write_subtitles_json(output_dir, &extracted).await?;

        let mut descriptors = audio_descriptors(&stream_info.audios);
        playlist::write_audio_info(output_dir, &descriptors).await?;

        self.encode(job, handle, &plan, &stream_info, gop, duration, &mut descriptors)
            .await?;

        playlist::write_master_playlist(output_dir, &descriptors).await?;
        playlist::validate_output(output_dir, &descriptors).await?;
        Ok(())
    }

    /// Single-pass multi-output encode, falling back to sequential passes
    /// (video, then each audio) when the combined run fails.
    #[allow(clippy::too_many_arguments)]
    async fn encode(
        &self,
        job: &TranscodeJob,
        handle: &JobHandle,
        plan: &EncodePlan,
        stream_info: &StreamInfo,
        gop: GopSettings,
        duration: f64,
        descriptors: &mut Vec<AudioTrackDescriptor>,
    ) -> Result<()> {
        let output_dir = &job.output_dir;
        let source = &job.source_path;
        let segment = self.config.segment_duration_seconds;
        let audios = &stream_info.audios;

        let args = single_pass_args(source, output_dir, plan, audios, gop, segment);
        let first = self
            .run_ffmpeg(&args, handle, PassWeight::whole(), duration)
            .await;
        let mut plan = plan.clone();
        match first {
            Ok(()) => return Ok(()),
            Err(TranscodeError::Cancelled) => return Err(TranscodeError::Cancelled),
            Err(e) if plan.retry_with_software_decode => {
                warn!(
                    "hardware decode pass failed for {}, retrying with software decode: {e}",
                    source.display()
                );
                remove_media_outputs(output_dir).await;
                plan = plan.with_software_decode();
                let args = single_pass_args(source, output_dir, &plan, audios, gop, segment);
                match self
                    .run_ffmpeg(&args, handle, PassWeight::whole(), duration)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(TranscodeError::Cancelled) => return Err(TranscodeError::Cancelled),
                    Err(e) => warn!("software-decode single pass also failed: {e}"),
                }
            }
            Err(e) => {
                warn!(
                    "single-pass encode failed for {}, falling back to sequential: {e}",
                    source.display()
                );
            }
        }

        // Sequential fallback: video first, then each audio on its own.
        remove_media_outputs(output_dir).await;

        let video_weight = PassWeight::video(audios.len());
        let args = video_pass_args(source, output_dir, &plan, gop, segment);
        match self.run_ffmpeg(&args, handle, video_weight, duration).await {
            Ok(()) => {}
            Err(TranscodeError::Cancelled) => return Err(TranscodeError::Cancelled),
            Err(e) if plan.retry_with_software_decode => {
                warn!("video pass hardware decode failed, retrying with software decode: {e}");
                remove_media_outputs(output_dir).await;
                plan = plan.with_software_decode();
                let args = video_pass_args(source, output_dir, &plan, gop, segment);
                self.run_ffmpeg(&args, handle, video_weight, duration).await?;
            }
            Err(e) => return Err(e),
        }

        let mut kept = Vec::with_capacity(audios.len());
        for (ordinal, track) in audios.iter().enumerate() {
            let weight = PassWeight::audio(ordinal, audios.len());
            let args = audio_pass_args(source, output_dir, track, ordinal, segment);
            match self.run_ffmpeg(&args, handle, weight, duration).await {
                Ok(()) => kept.push(ordinal),
                Err(TranscodeError::Cancelled) => return Err(TranscodeError::Cancelled),
                Err(e) if ordinal > 0 => {
                    // A secondary audio track is not worth the job.
                    warn!(
                        "dropping audio track {} ({}) of {}: {e}",
                        track.source_index,
                        track.language,
                        source.display()
                    );
                    remove_audio_outputs(output_dir, ordinal).await;
                }
                Err(e) => return Err(e),
            }
        }

        if kept.len() != audios.len() {
            let surviving: Vec<AudioTrack> = kept
                .iter()
                .map(|&ordinal| audios[ordinal].clone())
                .collect();
            *descriptors = audio_descriptors(&surviving);
            // Rewritten so the manifest only lists tracks that exist.
            playlist::write_audio_info(&job.output_dir, descriptors).await?;
            rename_audio_outputs(output_dir, &kept).await?;
        }

        Ok(())
    }

    /// Supervise one FFmpeg invocation: spawn at low priority, feed stderr
    /// through the progress parser, and classify the exit.
    async fn run_ffmpeg(
        &self,
        args: &[String],
        handle: &JobHandle,
        weight: PassWeight,
        total_duration: f64,
    ) -> Result<()> {
        debug!("ffmpeg {}", args.join(" "));
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        handle.set_pid(pid).await;
        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::setpriority(libc::PRIO_PROCESS as _, pid as _, CHILD_NICENESS);
            }
        }

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sample) = parse_progress_line(&line) {
                    let fraction = sample.time_seconds / total_duration.max(1.0);
                    handle
                        .update_progress(weight.percent(fraction), sample.time_seconds, sample.speed)
                        .await;
                } else if !line.trim().is_empty() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }

        let status = child.wait().await?;
        handle.set_pid(None).await;

        if handle.cancel_requested() {
            return Err(TranscodeError::Cancelled);
        }
        if status.success() {
            return Ok(());
        }

        let mut message = exit_description(&status);
        if !tail.is_empty() {
            let context: Vec<String> = tail.into_iter().collect();
            message = format!("{message}: {}", context.join(" | "));
        }
        Err(TranscodeError::TranscoderCrash(message))
    }
}

fn exit_description(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let name = match signal {
                libc::SIGKILL => "SIGKILL",
                libc::SIGTERM => "SIGTERM",
                libc::SIGINT => "SIGINT",
                _ => "signal",
            };
            return format!("ffmpeg terminated by {name} ({signal})");
        }
    }
    match status.code() {
        Some(code) => format!("ffmpeg exited with status {code}"),
        None => "ffmpeg exited abnormally".to_string(),
    }
}

/// Delete every segment and playlist written so far, leaving manifests and
/// sentinels alone.
async fn remove_media_outputs(output_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".ts") || name.ends_with(".m3u8") {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

/// Delete the partial outputs of one audio rendition.
async fn remove_audio_outputs(output_dir: &Path, ordinal: usize) {
    let playlist = output_dir.join(format!("audio_{ordinal}.m3u8"));
    let _ = tokio::fs::remove_file(playlist).await;

    let prefix = format!("audio_{ordinal}_segment");
    let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

/// After dropping tracks, compact the surviving audio outputs so ordinals
/// stay dense (`audio_0`, `audio_1`, …) and match the rewritten manifest.
async fn rename_audio_outputs(output_dir: &Path, kept: &[usize]) -> Result<()> {
    for (new_ordinal, &old_ordinal) in kept.iter().enumerate() {
        if new_ordinal == old_ordinal {
            continue;
        }
        let old_playlist = output_dir.join(format!("audio_{old_ordinal}.m3u8"));
        let new_playlist = output_dir.join(format!("audio_{new_ordinal}.m3u8"));
        if !tokio::fs::try_exists(&old_playlist).await.unwrap_or(false) {
            continue;
        }

        let content = tokio::fs::read_to_string(&old_playlist).await?;
        let old_prefix = format!("audio_{old_ordinal}_segment");
        let new_prefix = format!("audio_{new_ordinal}_segment");

        let mut entries = tokio::fs::read_dir(output_dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(rest) = name.strip_prefix(&old_prefix) {
                tokio::fs::rename(
                    entry.path(),
                    output_dir.join(format!("{new_prefix}{rest}")),
                )
                .await?;
            }
        }

        tokio::fs::write(&new_playlist, content.replace(&old_prefix, &new_prefix)).await?;
        tokio::fs::remove_file(&old_playlist).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn remove_media_outputs_spares_manifests_and_sentinels() {
        let dir = TempDir::new().unwrap();
        for name in [
            "video_segment0.ts",
            "video.m3u8",
            "audio_0.m3u8",
            "audio_info.json",
            "subtitles.json",
            ".transcoding",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        remove_media_outputs(dir.path()).await;

        assert!(!dir.path().join("video_segment0.ts").exists());
        assert!(!dir.path().join("video.m3u8").exists());
        assert!(!dir.path().join("audio_0.m3u8").exists());
        assert!(dir.path().join("audio_info.json").exists());
        assert!(dir.path().join(".transcoding").exists());
    }

    #[tokio::test]
    async fn remove_audio_outputs_targets_one_ordinal() {
        let dir = TempDir::new().unwrap();
        for name in [
            "audio_0.m3u8",
            "audio_0_segment0.ts",
            "audio_1.m3u8",
            "audio_1_segment0.ts",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        remove_audio_outputs(dir.path(), 1).await;

        assert!(dir.path().join("audio_0.m3u8").exists());
        assert!(dir.path().join("audio_0_segment0.ts").exists());
        assert!(!dir.path().join("audio_1.m3u8").exists());
        assert!(!dir.path().join("audio_1_segment0.ts").exists());
    }

    #[tokio::test]
    async fn rename_compacts_surviving_ordinals() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("audio_0.m3u8"), "a").unwrap();
        std::fs::write(dir.path().join("audio_0_segment0.ts"), "x").unwrap();
        std::fs::write(
            dir.path().join("audio_2.m3u8"),
            "#EXTINF:2.0,\naudio_2_segment0.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("audio_2_segment0.ts"), "y").unwrap();

        // Track 1 was dropped; 0 and 2 survive.
        rename_audio_outputs(dir.path(), &[0, 2]).await.unwrap();

        assert!(dir.path().join("audio_1.m3u8").exists());
        let content = std::fs::read_to_string(dir.path().join("audio_1.m3u8")).unwrap();
        assert!(content.contains("audio_1_segment0.ts"));
        assert!(dir.path().join("audio_1_segment0.ts").exists());
        assert!(!dir.path().join("audio_2.m3u8").exists());
    }
}
