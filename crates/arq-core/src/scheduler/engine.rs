//! The transfer engine: bridge API, shared state, and the coalescing
//! scheduler trigger.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::asset_store::AssetStore;
use crate::config::ArqConfig;
use crate::job_db::{JobDb, JobDraft, JobId, QueueStats, TransportHandle};
use crate::staging;
use crate::transport::{CompletionEvent, Transport, UploadOutcome};

use super::control::ActiveTransfers;
use super::recovery::RecoveryReport;
use super::{completion, pass, recovery};

/// Everything a client supplies when creating a job. The remaining
/// descriptive metadata is captured from the resolved source.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub local_ref: String,
    pub endpoint: String,
    pub access_token: String,
    pub device_id: String,
    pub group_tag: String,
    pub remote_ref: Option<String>,
    pub companion_ref: Option<String>,
}

/// Why a submission was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Download progress for one job, forwarded to whoever is watching.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    /// Fraction complete in [0.0, 1.0].
    pub fraction: f64,
}

pub(crate) struct EngineShared {
    pub(crate) db: JobDb,
    pub(crate) cfg: ArqConfig,
    pub(crate) assets: Arc<dyn AssetStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) active: ActiveTransfers,
    pub(crate) staging_dir: PathBuf,
    pub(crate) progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    pass_active: AtomicBool,
    pass_pending: AtomicBool,
}

impl EngineShared {
    pub(crate) fn report_progress(&self, job_id: JobId, fraction: f64) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(ProgressUpdate { job_id, fraction });
        }
    }
}

/// Schedule an admission pass. Only one pass runs at a time; a trigger that
/// lands while one is active is coalesced into a single follow-up pass, so
/// no trigger is lost and passes never overlap.
pub(crate) fn schedule_pass(shared: &Arc<EngineShared>) {
    if shared.pass_active.swap(true, Ordering::AcqRel) {
        shared.pass_pending.store(true, Ordering::Release);
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        loop {
            pass::run_pass(&shared).await;
            shared.pass_active.store(false, Ordering::Release);
            if !shared.pass_pending.swap(false, Ordering::AcqRel) {
                break;
            }
            if shared.pass_active.swap(true, Ordering::AcqRel) {
                // A newer trigger reacquired the guard; it owns the
                // follow-up pass.
                break;
            }
        }
    });
}

/// Handle to the queue engine. Cheap to clone; all clones drive the same
/// queue.
#[derive(Clone)]
pub struct TransferEngine {
    pub(crate) shared: Arc<EngineShared>,
}

impl TransferEngine {
    /// Build an engine over an opened job store and the two collaborators.
    /// Call [`recover`](Self::recover) before submitting work.
    pub fn new(
        db: JobDb,
        cfg: ArqConfig,
        assets: Arc<dyn AssetStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let staging_dir = staging::staging_dir(&cfg)?;
        Ok(Self {
            shared: Arc::new(EngineShared {
                db,
                cfg,
                assets,
                transport,
                active: ActiveTransfers::new(),
                staging_dir,
                progress_tx: None,
                pass_active: AtomicBool::new(false),
                pass_pending: AtomicBool::new(false),
            }),
        })
    }

    /// Attach a progress channel. Must be called before the engine is
    /// cloned or triggered; updates are dropped, not awaited, when the
    /// receiver lags.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("with_progress must be called before the engine is shared");
        shared.progress_tx = Some(tx);
        self
    }

    /// Create a job for `spec` and schedule it. The local ref must resolve
    /// right now; the descriptive metadata of the resolved source is frozen
    /// into the job row.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        url::Url::parse(&spec.endpoint)
            .map_err(|_| SubmitError::InvalidEndpoint(spec.endpoint.clone()))?;

        let asset = self
            .shared
            .assets
            .resolve(&spec.local_ref)
            .await?
            .ok_or_else(|| SubmitError::AssetNotFound(spec.local_ref.clone()))?;

        let draft = JobDraft {
            local_ref: spec.local_ref,
            source_id: asset.source_id,
            device_id: spec.device_id,
            file_name: asset.file_name,
            file_created_at: asset.created_at,
            file_modified_at: asset.modified_at,
            favorite: asset.favorite,
            remote_ref: spec.remote_ref,
            group_tag: spec.group_tag,
            companion_ref: spec.companion_ref,
            access_token: spec.access_token,
            endpoint: spec.endpoint,
        };
        let id = self.shared.db.insert_job(&draft).await?;
        tracing::info!(job = id, "job submitted");
        schedule_pass(&self.shared);
        Ok(id)
    }

    /// Cancel a job wherever it is: abort its stage worker, cancel its
    /// transport operation, remove the row, and remove any staged file.
    /// Safe to race with completion; the loser of the race no-ops.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let shared = &self.shared;
        shared.active.request_abort(id);
        if let Some(handle) = shared.active.untrack_job(id) {
            shared.transport.cancel(handle).await;
        }

        let staging_path = shared.db.get_job(id).await?.and_then(|j| j.staging_path);
        shared.db.delete_job(id).await?;
        if let Some(p) = staging_path {
            staging::remove_staged(Path::new(&p)).await;
        }

        tracing::info!(job = id, "job cancelled");
        schedule_pass(shared);
        Ok(())
    }

    /// Phase-occupancy counters.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.shared.db.queue_stats().await
    }

    /// Repair jobs stranded in transient statuses by an unclean shutdown,
    /// then schedule a pass. Run once at startup, before accepting jobs.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = recovery::recover(&self.shared).await?;
        if report.total() > 0 {
            tracing::info!(
                downloads = report.downloads_requeued,
                uploads = report.uploads_requeued,
                refetches = report.refetches,
                "recovered interrupted jobs from previous run"
            );
        }
        schedule_pass(&self.shared);
        Ok(report)
    }

    /// Inbound completion event from the transport, keyed by correlation
    /// handle. Tolerates unknown handles and deleted jobs; store failures
    /// are logged and the event is dropped without a partial state change.
    pub async fn handle_completion(&self, handle: TransportHandle, outcome: UploadOutcome) {
        completion::apply(&self.shared, handle, outcome).await;
    }

    /// Schedule an admission pass explicitly.
    pub fn trigger(&self) {
        schedule_pass(&self.shared);
    }

    /// Drive the queue until nothing is in flight and nothing is eligible
    /// for admission. Jobs waiting on transport completions count as work,
    /// so this only returns once every submitted job is terminal.
    pub async fn run_until_idle(&self) -> Result<()> {
        schedule_pass(&self.shared);
        loop {
            let runnable = self
                .shared
                .db
                .has_runnable_work(self.shared.cfg.max_attempts as i64)
                .await?;
            if !runnable && self.shared.active.is_idle() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Forward completion events from a transport's channel into the engine.
/// Returns the dispatcher task; it exits when the channel closes.
pub fn spawn_completion_dispatcher(
    engine: TransferEngine,
    mut events: mpsc::UnboundedReceiver<CompletionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            engine.handle_completion(event.handle, event.outcome).await;
        }
    })
}
