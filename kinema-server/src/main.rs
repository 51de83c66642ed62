use clap::Parser;
use kinema_core::database::MemoryMetadataStore;
use kinema_server::{
    DetectedHardwareProvider, NullWatcher, TranscodeConfig, TranscodeService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the kinema pre-transcoding engine.
#[derive(Parser, Debug)]
#[command(name = "kinema-server")]
#[command(about = "Pre-transcoding engine: converts a media library into seekable HLS assets")]
struct Args {
    /// Root directory for published HLS assets and the queue state file
    #[arg(long, env = "KINEMA_TRANSCODED_DIR", default_value = "./transcoded")]
    transcoded_dir: PathBuf,

    /// Films library root
    #[arg(long, env = "KINEMA_FILMS_DIR", default_value = "./media/films")]
    films_dir: PathBuf,

    /// Series library root
    #[arg(long, env = "KINEMA_SERIES_DIR", default_value = "./media/series")]
    series_dir: PathBuf,

    /// FFmpeg binary
    #[arg(long, env = "KINEMA_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    /// FFprobe binary
    #[arg(long, env = "KINEMA_FFPROBE", default_value = "ffprobe")]
    ffprobe: String,

    /// Maximum simultaneously active transcodes
    #[arg(long, env = "KINEMA_MAX_CONCURRENT", default_value_t = 2)]
    max_concurrent: usize,

    /// Do not start the worker pool automatically at boot
    #[arg(long, env = "KINEMA_NO_AUTO_START")]
    no_auto_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kinema_server=info,kinema_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = TranscodeConfig {
        transcoded_dir: args.transcoded_dir,
        films_dir: args.films_dir,
        series_dir: args.series_dir,
        ffmpeg_path: args.ffmpeg.clone(),
        ffprobe_path: args.ffprobe,
        max_concurrent_transcodes: args.max_concurrent.max(1),
        auto_start: !args.no_auto_start,
        ..TranscodeConfig::default()
    };

    info!(
        transcoded = %config.transcoded_dir.display(),
        films = %config.films_dir.display(),
        series = %config.series_dir.display(),
        workers = config.max_concurrent_transcodes,
        "kinema pre-transcoding engine starting"
    );

    let store = Arc::new(MemoryMetadataStore::new());
    let hardware = Arc::new(DetectedHardwareProvider::new(args.ffmpeg));
    let service = TranscodeService::new(config, store, hardware);

    service.boot(Arc::new(NullWatcher)).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.stop().await;
    service.save_now().await;

    Ok(())
}
