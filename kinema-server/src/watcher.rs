use crate::service::TranscodeService;
use async_trait::async_trait;
use kinema_core::Result;

/// Contract with the external filesystem watcher. After `start`, the
/// watcher announces each newly observed video file by calling
/// [`TranscodeService::enqueue`] with `high_priority = true`.
#[async_trait]
pub trait FileWatcher: Send + Sync {
    async fn start(&self, service: TranscodeService) -> Result<()>;
}

/// Watcher that watches nothing. Used when the deployment has no external
/// watcher wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatcher;

#[async_trait]
impl FileWatcher for NullWatcher {
    async fn start(&self, _service: TranscodeService) -> Result<()> {
        Ok(())
    }
}
