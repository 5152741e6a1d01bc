//! Startup recovery: repair jobs stranded in transient statuses by an
//! unclean shutdown.
//!
//! Interrupted downloads lose their staging file (it cannot be trusted as
//! complete) and go back to the waiting line with attempts preserved.
//! Interrupted uploads are requeued by evidence: if the staged bytes are
//! still on disk the job waits for upload again; if handoff already
//! released them, the only sound route is a re-fetch from the source. The
//! restarted transport cannot redeliver completions, so stale correlation
//! handles are cleared in both cases.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::job_db::JobStatus;
use crate::staging;

use super::engine::EngineShared;

/// What recovery did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted downloads sent back to `awaiting_download`.
    pub downloads_requeued: u64,
    /// Interrupted uploads with staged bytes, sent back to `awaiting_upload`.
    pub uploads_requeued: u64,
    /// Interrupted uploads whose staged bytes were gone, sent back to
    /// `awaiting_download`.
    pub refetches: u64,
}

impl RecoveryReport {
    pub fn total(&self) -> u64 {
        self.downloads_requeued + self.uploads_requeued + self.refetches
    }
}

pub(crate) async fn recover(shared: &Arc<EngineShared>) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    let interrupted = shared
        .db
        .jobs_in_statuses(&[JobStatus::DownloadQueued, JobStatus::Downloading])
        .await?;
    for job in interrupted {
        if let Some(path) = &job.staging_path {
            staging::remove_staged(Path::new(path)).await;
        }
        shared.db.requeue_download(job.id).await?;
        tracing::debug!(job = job.id, "requeued interrupted download");
        report.downloads_requeued += 1;
    }

    let interrupted = shared
        .db
        .jobs_in_statuses(&[JobStatus::Uploading, JobStatus::UploadQueued])
        .await?;
    for job in interrupted {
        let staged = match &job.staging_path {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };
        if staged {
            shared.db.requeue_upload(job.id).await?;
            tracing::debug!(job = job.id, "requeued interrupted upload");
            report.uploads_requeued += 1;
        } else {
            shared.db.requeue_download(job.id).await?;
            tracing::debug!(job = job.id, "staged bytes lost, re-fetching source");
            report.refetches += 1;
        }
    }

    Ok(report)
}
