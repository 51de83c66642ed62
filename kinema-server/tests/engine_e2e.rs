//! End-to-end scenarios against the stub FFmpeg toolchain.
#![cfg(unix)]

mod support;

use kinema_core::database::{MediaKind, MemoryMetadataStore};
use kinema_core::is_transcoded;
use kinema_server::{
    Acceleration, HardwareCapabilities, StaticHardwareProvider, TranscodeService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use support::{wait_until, StubToolchain};
use tempfile::TempDir;

fn software_hw() -> Arc<StaticHardwareProvider> {
    Arc::new(StaticHardwareProvider(HardwareCapabilities::software()))
}

fn write_source(root: &Path, rel: &str) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"not really an mkv").unwrap();
    path
}

async fn run_to_completion(service: &TranscodeService, expected_done: usize) {
    service.start().await;
    wait_until(Duration::from_secs(20), || async {
        let stats = service.get_stats().await;
        stats.completed_count >= expected_done && stats.active_count == 0
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn e1_fresh_transcode_single_video_single_audio() {
    let root = TempDir::new().unwrap();
    let toolchain = StubToolchain::new(&support::probe_single_audio());
    let config = toolchain.config(root.path());
    let source = write_source(&config.films_dir, "Example (2020).mkv");

    let store = Arc::new(MemoryMetadataStore::new());
    let row = store.insert(MediaKind::Film, source.clone()).await;

    let service = TranscodeService::new(config.clone(), store.clone(), software_hw());
    let outcome = service.enqueue(&source, false).await;
    assert!(outcome.ok);

    run_to_completion(&service, 1).await;

    let out = config.transcoded_dir.join("Example (2020)");
    assert!(out.join("video.m3u8").exists());
    assert!(out.join("video_segment0.ts").exists());
    assert!(out.join("audio_0.m3u8").exists());
    assert!(out.join("audio_0_segment0.ts").exists());
    assert!(out.join(".done").exists());
    assert!(!out.join(".transcoding").exists());

    let audio_info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("audio_info.json")).unwrap())
            .unwrap();
    assert_eq!(
        audio_info,
        serde_json::json!([{
            "index": 0,
            "language": "fre",
            "title": "Audio 1",
            "playlist": "audio_0.m3u8",
            "isDefault": true
        }])
    );

    let master = std::fs::read_to_string(out.join("playlist.m3u8")).unwrap();
    assert!(master.contains(
        "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"Audio 1\",LANGUAGE=\"fre\",DEFAULT=YES,AUTOSELECT=YES,URI=\"audio_0.m3u8\""
    ));
    assert!(master.contains("AUDIO=\"audio\""));
    assert!(master.contains("\nvideo.m3u8\n"));

    assert!(is_transcoded(&out).await);
    // The catalog mark lands just after the job is recorded as completed.
    wait_until(Duration::from_secs(5), || async {
        store.get(row.id).await.unwrap().is_transcoded
    })
    .await;
    assert_eq!(service.list_transcoded().await, vec!["Example (2020)"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2_two_audios_and_one_text_subtitle() {
    let root = TempDir::new().unwrap();
    let toolchain = StubToolchain::new(&support::probe_two_audios_one_subtitle());
    let config = toolchain.config(root.path());
    let source = write_source(&config.films_dir, "Dual Audio.mkv");

    let service = TranscodeService::new(
        config.clone(),
        Arc::new(MemoryMetadataStore::new()),
        software_hw(),
    );
    service.enqueue(&source, false).await;
    run_to_completion(&service, 1).await;

    let out = config.transcoded_dir.join("Dual Audio");
    for playlist in ["audio_0.m3u8", "audio_1.m3u8"] {
        let content = std::fs::read_to_string(out.join(playlist)).unwrap();
        assert!(content.contains("#EXT-X-ENDLIST"), "{playlist} unfinished");
    }
    assert!(out.join("sub_eng_0.vtt").exists());

    let subtitles: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("subtitles.json")).unwrap())
            .unwrap();
    assert_eq!(
        subtitles,
        serde_json::json!([{"language": "eng", "file": "sub_eng_0.vtt"}])
    );

    let audio_info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("audio_info.json")).unwrap())
            .unwrap();
    assert_eq!(audio_info[0]["isDefault"], true);
    assert_eq!(audio_info[1]["isDefault"], false);

    let master = std::fs::read_to_string(out.join("playlist.m3u8")).unwrap();
    assert!(master.contains("LANGUAGE=\"eng\",DEFAULT=YES"));
    assert!(master.contains("LANGUAGE=\"fre\",DEFAULT=NO"));
}

#[tokio::test(flavor = "multi_thread")]
async fn e3_bitmap_subtitle_is_ignored() {
    let root = TempDir::new().unwrap();
    let toolchain = StubToolchain::new(&support::probe_bitmap_and_text_subtitles());
    let config = toolchain.config(root.path());
    let source = write_source(&config.films_dir, "Bitmap Subs.mkv");

    let service = TranscodeService::new(
        config.clone(),
        Arc::new(MemoryMetadataStore::new()),
        software_hw(),
    );
    service.enqueue(&source, false).await;
    run_to_completion(&service, 1).await;

    let out = config.transcoded_dir.join("Bitmap Subs");
    assert!(out.join(".done").exists());

    let subtitles: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("subtitles.json")).unwrap())
            .unwrap();
    let entries = subtitles.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["file"], "sub_eng_0.vtt");

    // Exactly one extracted subtitle file: nothing for the PGS track.
    let vtt_count = std::fs::read_dir(&out)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".vtt"))
        .count();
    assert_eq!(vtt_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn e6_hevc_hardware_decode_falls_back_to_software() {
    let root = TempDir::new().unwrap();
    let toolchain = StubToolchain::new(&support::probe_hevc_single_audio());
    toolchain.fail_hardware_decode();
    let config = toolchain.config(root.path());
    let source = write_source(&config.films_dir, "HEVC Film.mkv");

    let vaapi = Arc::new(StaticHardwareProvider(HardwareCapabilities {
        acceleration: Acceleration::Vaapi,
        decoder_args: vec![
            "-hwaccel".into(),
            "vaapi".into(),
            "-hwaccel_device".into(),
            "/dev/dri/renderD128".into(),
            "-hwaccel_output_format".into(),
            "vaapi".into(),
        ],
        encoder_args: vec!["-c:v".into(), "h264_vaapi".into(), "-qp".into(), "23".into()],
        supports_hevc: true,
        max_concurrent_hint: 4,
    }));

    let service =
        TranscodeService::new(config.clone(), Arc::new(MemoryMetadataStore::new()), vaapi);
    service.enqueue(&source, false).await;
    run_to_completion(&service, 1).await;

    let out = config.transcoded_dir.join("HEVC Film");
    assert!(out.join(".done").exists());
    assert!(!out.join(".transcoding").exists());
    assert!(is_transcoded(&out).await);

    let stats = service.get_stats().await;
    assert_eq!(stats.failed_count, 0);
    assert_eq!(stats.completed_count, 1);
}
