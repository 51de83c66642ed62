use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    VideoToolbox,
    Vaapi,
    Qsv,
    None,
}

/// Capability record returned by the hardware collaborator. The engine
/// consumes this record; how it was probed is not its concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub acceleration: Acceleration,
    /// Arguments placed before `-i` to enable hardware decode.
    pub decoder_args: Vec<String>,
    /// Arguments selecting the hardware encoder (`-c:v …`).
    pub encoder_args: Vec<String>,
    pub supports_hevc: bool,
    /// Advisory only; the engine picks its own concurrency bound.
    pub max_concurrent_hint: usize,
}

impl HardwareCapabilities {
    /// Pure software pipeline with a conservative x264 preset.
    pub fn software() -> Self {
        Self {
            acceleration: Acceleration::None,
            decoder_args: Vec::new(),
            encoder_args: Vec::new(),
            supports_hevc: false,
            max_concurrent_hint: 2,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.acceleration != Acceleration::None
    }
}

#[async_trait]
pub trait HardwareProvider: Send + Sync {
    async fn capabilities(&self) -> HardwareCapabilities;
}

/// Fixed capability record, for tests and for overriding detection.
#[derive(Debug, Clone)]
pub struct StaticHardwareProvider(pub HardwareCapabilities);

#[async_trait]
impl HardwareProvider for StaticHardwareProvider {
    async fn capabilities(&self) -> HardwareCapabilities {
        self.0.clone()
    }
}

/// Best-effort local detection, probed once and cached.
#[derive(Debug)]
pub struct DetectedHardwareProvider {
    ffmpeg_path: String,
    cached: tokio::sync::OnceCell<HardwareCapabilities>,
}

impl DetectedHardwareProvider {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            cached: tokio::sync::OnceCell::new(),
        }
    }

    async fn detect(&self) -> HardwareCapabilities {
        #[cfg(target_os = "macos")]
        {
            if self.encoder_available("h264_videotoolbox").await {
                info!("hardware acceleration: videotoolbox");
                return HardwareCapabilities {
                    acceleration: Acceleration::VideoToolbox,
                    decoder_args: vec!["-hwaccel".into(), "videotoolbox".into()],
                    encoder_args: vec![
                        "-c:v".into(),
                        "h264_videotoolbox".into(),
                        "-b:v".into(),
                        "5M".into(),
                    ],
                    supports_hevc: self.encoder_available("hevc_videotoolbox").await,
                    max_concurrent_hint: 4,
                };
            }
        }

        let render_node = Path::new("/dev/dri/renderD128");
        if render_node.exists() && self.encoder_available("h264_vaapi").await {
            info!("hardware acceleration: vaapi via {}", render_node.display());
            return HardwareCapabilities {
                acceleration: Acceleration::Vaapi,
                decoder_args: vec![
                    "-hwaccel".into(),
                    "vaapi".into(),
                    "-hwaccel_device".into(),
                    "/dev/dri/renderD128".into(),
                    "-hwaccel_output_format".into(),
                    "vaapi".into(),
                ],
                encoder_args: vec![
                    "-c:v".into(),
                    "h264_vaapi".into(),
                    "-qp".into(),
                    "23".into(),
                ],
                supports_hevc: self.encoder_available("hevc_vaapi").await,
                max_concurrent_hint: 4,
            };
        }

        if self.encoder_available("h264_qsv").await {
            info!("hardware acceleration: qsv");
            return HardwareCapabilities {
                acceleration: Acceleration::Qsv,
                decoder_args: vec!["-hwaccel".into(), "qsv".into()],
                encoder_args: vec![
                    "-c:v".into(),
                    "h264_qsv".into(),
                    "-global_quality".into(),
                    "23".into(),
                ],
                supports_hevc: self.encoder_available("hevc_qsv").await,
                max_concurrent_hint: 4,
            };
        }

        info!("no hardware acceleration detected, using software pipeline");
        HardwareCapabilities::software()
    }

    async fn encoder_available(&self, encoder: &str) -> bool {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-hide_banner")
            .arg("-encoders")
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let listing = String::from_utf8_lossy(&out.stdout);
                let found = listing.contains(encoder);
                debug!("encoder {encoder} available: {found}");
                found
            }
            _ => false,
        }
    }
}

#[async_trait]
impl HardwareProvider for DetectedHardwareProvider {
    async fn capabilities(&self) -> HardwareCapabilities {
        self.cached.get_or_init(|| self.detect()).await.clone()
    }
}
