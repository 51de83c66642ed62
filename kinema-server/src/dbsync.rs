//! Reconciliation between the transcoded tree and the metadata catalog.

use crate::config::TranscodeConfig;
use kinema_core::database::{MediaKind, MetadataStore};
use kinema_core::{is_transcoded, layout};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncReport {
    pub scanned: usize,
    pub marked: usize,
}

/// Mark every catalog row whose output directory holds a valid asset.
/// Failures on individual rows are logged and skipped; the sweep runs again
/// at next boot and after every publish that misses its row.
pub async fn sync_transcoded_status(
    store: &dyn MetadataStore,
    config: &TranscodeConfig,
) -> SyncReport {
    let mut report = SyncReport::default();

    for kind in [MediaKind::Film, MediaKind::Episode] {
        let rows = match store.list_unmarked(kind).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("metadata sync: listing unmarked {kind:?} rows failed: {e}");
                continue;
            }
        };

        for row in rows {
            report.scanned += 1;
            let output_dir = layout::output_dir(
                &config.transcoded_dir,
                &config.series_dir,
                &row.source_path,
            );
            if !is_transcoded(&output_dir).await {
                continue;
            }
            match store.set_is_transcoded(row.id, row.kind, true).await {
                Ok(()) => report.marked += 1,
                Err(e) => warn!(
                    "metadata sync: marking {} failed: {e}",
                    row.source_path.display()
                ),
            }
        }
    }

    info!(
        scanned = report.scanned,
        marked = report.marked,
        "metadata sync finished"
    );
    report
}
