//! Download stage: pull source bytes into the staging file.

use anyhow::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::asset_store::FetchError;
use crate::job_db::JobRecord;
use crate::staging;

use super::engine::{self, EngineShared};

/// Run the download phase for one admitted job, then release its registry
/// slot and re-trigger the scheduler regardless of outcome.
pub(crate) async fn run_download(shared: Arc<EngineShared>, job: JobRecord) {
    let abort = shared.active.register(job.id);
    if let Err(e) = fetch_to_staging(&shared, &job, &abort).await {
        tracing::error!(job = job.id, "download stage aborted: {e:#}");
    }
    shared.active.unregister(job.id);
    engine::schedule_pass(&shared);
}

/// Errors returned here are store failures: the stage could not record an
/// outcome and fails closed, leaving the row for the next pass or for
/// recovery. Phase failures are absorbed into the failure policy.
async fn fetch_to_staging(
    shared: &Arc<EngineShared>,
    job: &JobRecord,
    abort: &AtomicBool,
) -> Result<()> {
    let asset = match shared.assets.resolve(&job.local_ref).await {
        Ok(Some(asset)) => asset,
        Ok(None) => {
            tracing::warn!(job = job.id, local_ref = %job.local_ref, "source no longer resolvable");
            shared.db.mark_download_failed(job.id).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(job = job.id, "source resolution failed: {e:#}");
            shared.db.mark_download_failed(job.id).await?;
            return Ok(());
        }
    };

    let path = staging::staging_path(&shared.staging_dir, &asset.source_id);
    let path_str = path.to_string_lossy().into_owned();
    if !shared.db.mark_downloading(job.id, &path_str).await? {
        // Cancelled between admission and here; the row is gone.
        tracing::debug!(job = job.id, "job vanished before download started");
        return Ok(());
    }

    let progress = |fraction: f64| shared.report_progress(job.id, fraction);
    match shared.assets.fetch(&job.local_ref, &path, &progress, abort).await {
        Ok(()) => {
            if shared.db.mark_staged(job.id).await? {
                tracing::debug!(job = job.id, path = %path.display(), "source staged");
            } else {
                // Cancelled while streaming; nothing references the file
                // anymore.
                staging::remove_staged(&path).await;
            }
        }
        Err(FetchError::Aborted) => {
            staging::remove_staged(&path).await;
            tracing::info!(job = job.id, "download aborted");
        }
        Err(e) => {
            tracing::warn!(
                job = job.id,
                "download failed (attempt {}): {}",
                job.attempts + 1,
                e
            );
            // The partial file stays: the staging path is deterministic, so
            // a retry overwrites it in place.
            shared.db.mark_download_failed(job.id).await?;
        }
    }

    Ok(())
}
