//! Upload stage: checksum the staged bytes, build headers, and hand the
//! file to the transport.
//!
//! The stage's synchronous job ends at handoff; the outcome arrives later
//! through the completion handler. Capacity stays occupied after a clean
//! handoff (`upload_queued` counts against the cap), so only failure exits
//! re-trigger the scheduler here.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::checksum;
use crate::headers::UploadHeaders;
use crate::job_db::JobRecord;
use crate::staging;

use super::engine::{self, EngineShared};

pub(crate) async fn run_upload(shared: Arc<EngineShared>, job: JobRecord) {
    let abort = shared.active.register(job.id);
    let handed_off = match push_to_transport(&shared, &job, &abort).await {
        Ok(handed_off) => handed_off,
        Err(e) => {
            tracing::error!(job = job.id, "upload stage aborted: {e:#}");
            false
        }
    };
    shared.active.unregister(job.id);
    if !handed_off {
        engine::schedule_pass(&shared);
    }
}

/// Returns whether the job is now in the transport's hands. `false` covers
/// both recorded phase failures and a cancellation race; either way the
/// phase slot is free again. Errors are store failures (fail closed).
async fn push_to_transport(
    shared: &Arc<EngineShared>,
    job: &JobRecord,
    abort: &AtomicBool,
) -> Result<bool> {
    let Some(path_str) = job.staging_path.clone() else {
        // Admitted without staged bytes. A local defect, but routed through
        // the shared failure policy so the job converges to a terminal
        // status instead of wedging the queue.
        tracing::warn!(job = job.id, "no staging path at upload admission");
        shared.db.mark_upload_failed(job.id).await?;
        return Ok(false);
    };
    let path = PathBuf::from(&path_str);

    let digest = {
        let checksum_path = path.clone();
        match tokio::task::spawn_blocking(move || checksum::sha256_path(&checksum_path)).await {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                tracing::warn!(
                    job = job.id,
                    "could not checksum staged file (attempt {}): {e:#}",
                    job.attempts + 1
                );
                shared.db.mark_upload_failed(job.id).await?;
                return Ok(false);
            }
            Err(e) => {
                tracing::error!(job = job.id, "checksum worker died: {e}");
                shared.db.mark_upload_failed(job.id).await?;
                return Ok(false);
            }
        }
    };
    let headers = UploadHeaders::for_job(job, &digest);

    if abort.load(Ordering::Relaxed) {
        // Cancellation is already deleting the row and the staged file.
        return Ok(false);
    }

    let handle = match shared
        .transport
        .begin_upload(&path, &job.endpoint, &headers)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            // Handoff never happened, so the staged file survives and a
            // scheduler-driven retry can re-upload it.
            tracing::warn!(
                job = job.id,
                "transport handoff failed (attempt {}): {e:#}",
                job.attempts + 1
            );
            shared.db.mark_upload_failed(job.id).await?;
            return Ok(false);
        }
    };

    shared.active.track_upload(handle, job.id);
    if !shared.db.mark_upload_queued(job.id, handle).await? {
        shared.active.resolve_upload(handle);
        match shared.db.get_job(job.id).await? {
            None => {
                // Cancelled between admission and handoff: withdraw the
                // transfer. The cancel path already removed the staged file.
                shared.transport.cancel(handle).await;
                tracing::debug!(job = job.id, "job vanished before handoff");
            }
            Some(_) => {
                // The transfer resolved before the handoff was recorded, so
                // the completion handler already moved the job on. The
                // staged bytes are released here as usual.
                staging::remove_staged(&path).await;
                tracing::debug!(job = job.id, "completion raced ahead of handoff");
            }
        }
        return Ok(false);
    }

    // The transport took its own copy; the staging file's single deletion
    // happens here, on successful handoff.
    staging::remove_staged(&path).await;
    tracing::debug!(job = job.id, handle, "handed to transport");
    Ok(true)
}
