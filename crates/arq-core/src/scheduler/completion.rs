//! Completion handler: the only place queued transfers become terminal.
//!
//! Runs for every transport outcome, keyed by correlation handle. Must
//! no-op gracefully when the handle or the job row is already gone — a
//! cancellation may have raced the transfer to the finish line.

use std::sync::Arc;
use std::time::Duration;

use crate::job_db::TransportHandle;
use crate::transport::UploadOutcome;

use super::engine::{self, EngineShared};

/// How long an unmatched completion waits for the upload stage to finish
/// recording its handoff. A transfer that resolves near-instantly can beat
/// the two bookkeeping steps that follow `begin_upload`.
const HANDOFF_GRACE: Duration = Duration::from_millis(50);

pub(crate) async fn apply(
    shared: &Arc<EngineShared>,
    handle: TransportHandle,
    outcome: UploadOutcome,
) {
    let job_id = match shared.active.resolve_upload(handle) {
        Some(id) => id,
        None => {
            tokio::time::sleep(HANDOFF_GRACE).await;
            match shared.active.resolve_upload(handle) {
                Some(id) => id,
                None => {
                    tracing::debug!(handle, "completion for unknown transfer");
                    if let UploadOutcome::Failure {
                        resume: Some(state),
                    } = outcome
                    {
                        state.discard().await;
                    }
                    return;
                }
            }
        }
    };

    match outcome {
        UploadOutcome::Success => match shared.db.mark_complete(job_id).await {
            Ok(true) => tracing::info!(job = job_id, "upload complete"),
            Ok(false) => tracing::debug!(job = job_id, "completion for deleted job"),
            Err(e) => tracing::error!(job = job_id, "could not record completion: {e:#}"),
        },
        UploadOutcome::Cancelled => match shared.db.delete_job(job_id).await {
            Ok(()) => tracing::info!(job = job_id, "transport cancelled, job removed"),
            Err(e) => tracing::error!(job = job_id, "could not delete cancelled job: {e:#}"),
        },
        UploadOutcome::Failure { resume } => {
            let recorded = match shared.db.mark_upload_failed(job_id).await {
                Ok(recorded) => recorded,
                Err(e) => {
                    tracing::error!(job = job_id, "could not record upload failure: {e:#}");
                    false
                }
            };
            match resume {
                Some(state) if recorded => resubmit(shared, job_id, state).await,
                Some(state) => state.discard().await,
                None => {}
            }
        }
    }

    // Whatever happened, capacity may have freed up.
    engine::schedule_pass(shared);
}

/// Immediately resubmit a resumable transfer under a new handle, without
/// waiting for the next pass. An optimization, not a correctness
/// requirement — so it still honors the attempts ceiling, and a job that
/// fails to resubmit is simply left for the scheduler.
async fn resubmit(
    shared: &Arc<EngineShared>,
    job_id: crate::job_db::JobId,
    state: crate::transport::ResumeState,
) {
    let eligible = match shared.db.get_job(job_id).await {
        Ok(Some(job)) => job.attempts < shared.cfg.max_attempts as i64,
        Ok(None) => false,
        Err(e) => {
            tracing::error!(job = job_id, "could not check resume eligibility: {e:#}");
            false
        }
    };
    if !eligible {
        state.discard().await;
        return;
    }

    match shared.transport.resume_upload(state).await {
        Ok(new_handle) => {
            shared.active.track_upload(new_handle, job_id);
            // Surface the resubmission in the store so the next pass sees
            // the job occupied instead of re-admitting it.
            match shared.db.mark_upload_requeued(job_id, new_handle).await {
                Ok(true) => {
                    tracing::info!(job = job_id, handle = new_handle, "resubmitted failed upload")
                }
                Ok(false) => tracing::debug!(job = job_id, "job moved on before resubmission"),
                Err(e) => {
                    tracing::error!(job = job_id, "could not record resubmission: {e:#}")
                }
            }
        }
        Err(e) => tracing::warn!(job = job_id, "could not resubmit upload: {e:#}"),
    }
}
