//! One admission pass: claim eligible jobs up to each phase's free
//! capacity and launch a worker per claim.
//!
//! The pass itself only dispatches; stage work runs in its own tasks and
//! re-triggers the scheduler when it finishes. Capacity accounting lives
//! in the claim queries, which flip claimed rows to their admission marker
//! status transactionally — a pass can therefore never double-count
//! capacity, even though workers it launched are still starting up.

use std::sync::Arc;

use super::engine::EngineShared;
use super::{download, upload};

pub(crate) async fn run_pass(shared: &Arc<EngineShared>) {
    let max_attempts = shared.cfg.max_attempts as i64;

    match shared
        .db
        .claim_for_download(shared.cfg.max_active_downloads, max_attempts)
        .await
    {
        Ok(jobs) => {
            for job in jobs {
                tracing::debug!(job = job.id, "admitted for download");
                let shared = Arc::clone(shared);
                tokio::spawn(async move { download::run_download(shared, job).await });
            }
        }
        Err(e) => tracing::error!("download admission failed: {e:#}"),
    }

    match shared
        .db
        .claim_for_upload(shared.cfg.max_active_uploads, max_attempts)
        .await
    {
        Ok(jobs) => {
            for job in jobs {
                tracing::debug!(job = job.id, "admitted for upload");
                let shared = Arc::clone(shared);
                tokio::spawn(async move { upload::run_upload(shared, job).await });
            }
        }
        Err(e) => tracing::error!("upload admission failed: {e:#}"),
    }
}
