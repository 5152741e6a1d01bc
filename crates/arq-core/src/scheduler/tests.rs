//! Engine tests: stub collaborators wired through the same channel
//! plumbing as production, against an in-memory job store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::asset_store::{AssetStore, FetchError, ProgressFn, SourceAsset};
use crate::config::ArqConfig;
use crate::headers::UploadHeaders;
use crate::job_db::db::open_memory;
use crate::job_db::{JobDb, JobId, JobStatus, TransportHandle};
use crate::transport::{CompletionEvent, ResumeState, Transport, UploadOutcome};

use super::engine::{JobSpec, SubmitError, TransferEngine};
use super::{recovery, spawn_completion_dispatcher};

/// In-memory asset store. `gate` (when closed) parks fetches after the
/// bytes are written so tests can observe jobs mid-download; `fail_fetches`
/// makes the next N fetches fail with an IO error.
struct StubStore {
    assets: Mutex<HashMap<String, Vec<u8>>>,
    fail_fetches: AtomicU32,
    gate_open: AtomicBool,
}

impl StubStore {
    fn new() -> Self {
        Self {
            assets: Mutex::new(HashMap::new()),
            fail_fetches: AtomicU32::new(0),
            gate_open: AtomicBool::new(true),
        }
    }

    fn add(&self, local_ref: &str, bytes: &[u8]) {
        self.assets
            .lock()
            .unwrap()
            .insert(local_ref.to_string(), bytes.to_vec());
    }

    fn close_gate(&self) {
        self.gate_open.store(false, Ordering::Relaxed);
    }

    fn open_gate(&self) {
        self.gate_open.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl AssetStore for StubStore {
    async fn resolve(&self, local_ref: &str) -> anyhow::Result<Option<SourceAsset>> {
        Ok(self.assets.lock().unwrap().get(local_ref).map(|_| SourceAsset {
            source_id: format!("sid-{local_ref}"),
            file_name: local_ref.to_string(),
            created_at: 1_700_000_000,
            modified_at: 1_700_000_100,
            favorite: false,
        }))
    }

    async fn fetch(
        &self,
        local_ref: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        abort: &AtomicBool,
    ) -> Result<(), FetchError> {
        if self.fail_fetches.load(Ordering::Relaxed) > 0 {
            self.fail_fetches.fetch_sub(1, Ordering::Relaxed);
            return Err(FetchError::Io(std::io::Error::other("synthetic fetch failure")));
        }
        let bytes = match self.assets.lock().unwrap().get(local_ref) {
            Some(bytes) => bytes.clone(),
            None => return Err(FetchError::NotFound),
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        while !self.gate_open.load(Ordering::Relaxed) {
            if abort.load(Ordering::Relaxed) {
                return Err(FetchError::Aborted);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        progress(1.0);
        Ok(())
    }
}

/// How the stub transport resolves transfers it is handed.
enum Mode {
    /// Every transfer succeeds immediately.
    Succeed,
    /// Transfers never resolve on their own; the test injects outcomes.
    Hold,
    /// First transfer fails with resume state; the resubmission succeeds.
    FailResumableOnce { fired: bool },
    /// Every transfer fails terminally.
    FailAlways,
}

struct StubTransport {
    next: AtomicI64,
    events: mpsc::UnboundedSender<CompletionEvent>,
    mode: Mutex<Mode>,
    begun: Mutex<Vec<TransportHandle>>,
    spool_dir: PathBuf,
}

impl StubTransport {
    fn begun(&self) -> Vec<TransportHandle> {
        self.begun.lock().unwrap().clone()
    }

    /// Deliver an outcome the way a real transport does: asynchronously, a
    /// little while after the handoff returned.
    fn send(&self, handle: TransportHandle, outcome: UploadOutcome) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = events.send(CompletionEvent { handle, outcome });
        });
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn begin_upload(
        &self,
        _file: &Path,
        endpoint: &str,
        headers: &UploadHeaders,
    ) -> anyhow::Result<TransportHandle> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.begun.lock().unwrap().push(handle);
        let mut mode = self.mode.lock().unwrap();
        match &mut *mode {
            Mode::Succeed => self.send(handle, UploadOutcome::Success),
            Mode::Hold => {}
            Mode::FailResumableOnce { fired } => {
                if *fired {
                    self.send(handle, UploadOutcome::Success);
                } else {
                    *fired = true;
                    self.send(
                        handle,
                        UploadOutcome::Failure {
                            resume: Some(ResumeState {
                                spool_path: self.spool_dir.join(format!("spool-{handle}")),
                                endpoint: endpoint.to_string(),
                                headers: headers.clone(),
                            }),
                        },
                    );
                }
            }
            Mode::FailAlways => self.send(handle, UploadOutcome::Failure { resume: None }),
        }
        Ok(handle)
    }

    async fn resume_upload(&self, _resume: ResumeState) -> anyhow::Result<TransportHandle> {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.begun.lock().unwrap().push(handle);
        self.send(handle, UploadOutcome::Success);
        Ok(handle)
    }

    async fn cancel(&self, handle: TransportHandle) {
        self.send(handle, UploadOutcome::Cancelled);
    }
}

struct Harness {
    engine: TransferEngine,
    store: Arc<StubStore>,
    transport: Arc<StubTransport>,
    db: JobDb,
    _staging: tempfile::TempDir,
    _dispatcher: tokio::task::JoinHandle<()>,
}

async fn harness(mode: Mode) -> Harness {
    let db = open_memory().await.unwrap();
    let staging = tempfile::tempdir().unwrap();
    let cfg = ArqConfig {
        staging_dir: Some(staging.path().join("staging")),
        ..ArqConfig::default()
    };

    let store = Arc::new(StubStore::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(StubTransport {
        next: AtomicI64::new(0),
        events: events_tx,
        mode: Mutex::new(mode),
        begun: Mutex::new(Vec::new()),
        spool_dir: staging.path().join("spool"),
    });

    let store_dyn: Arc<dyn AssetStore> = store.clone();
    let transport_dyn: Arc<dyn Transport> = transport.clone();
    let engine = TransferEngine::new(db.clone(), cfg, store_dyn, transport_dyn).unwrap();
    let dispatcher = spawn_completion_dispatcher(engine.clone(), events_rx);

    Harness {
        engine,
        store,
        transport,
        db,
        _staging: staging,
        _dispatcher: dispatcher,
    }
}

fn spec(local_ref: &str) -> JobSpec {
    JobSpec {
        local_ref: local_ref.to_string(),
        endpoint: "https://example.com/upload".to_string(),
        access_token: "token".to_string(),
        device_id: "device-1".to_string(),
        group_tag: "camera".to_string(),
        remote_ref: None,
        companion_ref: None,
    }
}

const WAIT_ROUNDS: u32 = 250;
const WAIT_STEP: Duration = Duration::from_millis(20);

async fn wait_status(db: &JobDb, id: JobId, status: JobStatus) {
    for _ in 0..WAIT_ROUNDS {
        if db.get_job(id).await.unwrap().map(|j| j.status) == Some(status) {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("job {id} never reached {status:?}");
}

async fn wait_count(db: &JobDb, statuses: &[JobStatus], n: usize) {
    for _ in 0..WAIT_ROUNDS {
        if db.jobs_in_statuses(statuses).await.unwrap().len() == n {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("never saw {n} jobs in {statuses:?}");
}

#[tokio::test]
async fn submit_unknown_ref_is_rejected() {
    let h = harness(Mode::Succeed).await;
    let err = h.engine.submit(spec("nope.jpg")).await.unwrap_err();
    assert!(matches!(err, SubmitError::AssetNotFound(_)));
    assert!(h.db.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn submit_invalid_endpoint_is_rejected() {
    let h = harness(Mode::Succeed).await;
    h.store.add("a.jpg", b"bytes");
    let mut s = spec("a.jpg");
    s.endpoint = "not a url".to_string();
    let err = h.engine.submit(s).await.unwrap_err();
    assert!(matches!(err, SubmitError::InvalidEndpoint(_)));
}

#[tokio::test]
async fn roundtrip_completes_jobs() {
    let h = harness(Mode::Succeed).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let name = format!("photo-{i}.jpg");
        h.store.add(&name, b"image bytes");
        ids.push(h.engine.submit(spec(&name)).await.unwrap());
    }

    h.engine.run_until_idle().await.unwrap();

    for id in ids {
        let job = h.db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.attempts, 0);
        // Staged bytes were released at handoff.
        if let Some(p) = &job.staging_path {
            assert!(!Path::new(p).exists());
        }
    }
    assert_eq!(h.transport.begun().len(), 3);

    let stats = h.engine.queue_stats().await.unwrap();
    assert_eq!(stats.active_downloads, 0);
    assert_eq!(stats.active_uploads, 0);
    assert_eq!(stats.pending_uploads, 0);
}

#[tokio::test]
async fn pass_admits_up_to_download_cap() {
    let h = harness(Mode::Succeed).await;
    h.store.close_gate();
    let mut ids = Vec::new();
    for i in 0..6 {
        let name = format!("photo-{i}.jpg");
        h.store.add(&name, b"bytes");
        ids.push(h.engine.submit(spec(&name)).await.unwrap());
    }

    // Default cap is 5: exactly 5 stream at once, the newest waits.
    wait_count(&h.db, &[JobStatus::Downloading], 5).await;
    let waiting = h.db.jobs_in_statuses(&[JobStatus::AwaitingDownload]).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, ids[5], "FIFO: the newest job waits");

    let stats = h.db.queue_stats().await.unwrap();
    assert_eq!(stats.active_downloads, 5);

    h.store.open_gate();
    h.engine.run_until_idle().await.unwrap();
    for id in ids {
        let job = h.db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
    }
}

#[tokio::test]
async fn download_failures_respect_attempts_ceiling() {
    let h = harness(Mode::Succeed).await;
    h.store.add("a.jpg", b"bytes");
    h.store.fail_fetches.store(u32::MAX, Ordering::Relaxed);
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    h.engine.run_until_idle().await.unwrap();

    let job = h.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DownloadFailed);
    assert_eq!(job.attempts, 3);

    // A fresh pass must not admit it again.
    h.engine.trigger();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let job = h.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DownloadFailed);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn download_retry_succeeds_and_resets_attempts() {
    let h = harness(Mode::Succeed).await;
    h.store.add("a.jpg", b"bytes");
    h.store.fail_fetches.store(2, Ordering::Relaxed);
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    h.engine.run_until_idle().await.unwrap();

    let job = h.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.attempts, 0, "attempts reset on download success");
}

#[tokio::test]
async fn upload_resume_after_transient_failure() {
    let h = harness(Mode::FailResumableOnce { fired: false }).await;
    h.store.add("a.jpg", b"bytes");
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    h.engine.run_until_idle().await.unwrap();

    let job = h.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.attempts, 1, "the transient failure still counted");
    assert_eq!(h.transport.begun().len(), 2, "one handoff, one resubmission");
}

#[tokio::test]
async fn upload_failures_converge_to_ceiling() {
    let h = harness(Mode::FailAlways).await;
    h.store.add("a.jpg", b"bytes");
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    h.engine.run_until_idle().await.unwrap();

    // First failure arrives from the transport; handoff released the staged
    // bytes, so the remaining attempts fail locally until the ceiling.
    let job = h.db.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::UploadFailed);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn transport_cancellation_deletes_job() {
    let h = harness(Mode::Hold).await;
    h.store.add("a.jpg", b"bytes");
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    wait_status(&h.db, id, JobStatus::UploadQueued).await;
    let handle = h.transport.begun()[0];

    h.engine
        .handle_completion(handle, UploadOutcome::Cancelled)
        .await;
    assert!(h.db.get_job(id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_during_download_removes_row_and_staging() {
    let h = harness(Mode::Succeed).await;
    h.store.close_gate();
    h.store.add("a.jpg", b"bytes");
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    wait_status(&h.db, id, JobStatus::Downloading).await;
    let staging_path = h
        .db
        .get_job(id)
        .await
        .unwrap()
        .unwrap()
        .staging_path
        .expect("staging path set while downloading");
    assert!(Path::new(&staging_path).exists());

    h.engine.cancel(id).await.unwrap();
    assert!(h.db.get_job(id).await.unwrap().is_none());

    h.store.open_gate();
    // The worker observes the abort and finishes its cleanup; the staged
    // file must be gone afterwards.
    for _ in 0..WAIT_ROUNDS {
        if !Path::new(&staging_path).exists() {
            break;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    assert!(!Path::new(&staging_path).exists());
}

#[tokio::test]
async fn cancel_while_queued_races_completion_safely() {
    let h = harness(Mode::Hold).await;
    h.store.add("a.jpg", b"bytes");
    let id = h.engine.submit(spec("a.jpg")).await.unwrap();

    wait_status(&h.db, id, JobStatus::UploadQueued).await;
    h.engine.cancel(id).await.unwrap();
    assert!(h.db.get_job(id).await.unwrap().is_none());

    // The stub responds to transport cancel with a Cancelled completion;
    // by then the mapping and the row are both gone and it must no-op.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.db.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_for_unknown_handle_is_noop() {
    let h = harness(Mode::Hold).await;
    h.engine.handle_completion(99, UploadOutcome::Success).await;
    h.engine
        .handle_completion(99, UploadOutcome::Failure { resume: None })
        .await;
    assert!(h.db.list_jobs().await.unwrap().is_empty());
}

fn draft(local_ref: &str) -> crate::job_db::JobDraft {
    crate::job_db::JobDraft {
        local_ref: local_ref.to_string(),
        source_id: format!("sid-{local_ref}"),
        device_id: "device-1".to_string(),
        file_name: local_ref.to_string(),
        file_created_at: 1_700_000_000,
        file_modified_at: 1_700_000_100,
        favorite: false,
        remote_ref: None,
        group_tag: "camera".to_string(),
        companion_ref: None,
        access_token: "token".to_string(),
        endpoint: "https://example.com/upload".to_string(),
    }
}

#[tokio::test]
async fn recovery_requeues_interrupted_download_and_spares_terminal_jobs() {
    // Rows are seeded directly, as if a previous process died mid-flight;
    // no trigger runs until recovery decides.
    let h = harness(Mode::Hold).await;
    let interrupted = h.db.insert_job(&draft("a.jpg")).await.unwrap();
    let done = h.db.insert_job(&draft("b.jpg")).await.unwrap();

    h.db.claim_for_download(1, 3).await.unwrap();
    let staging = h._staging.path().join("staging").join("partial");
    tokio::fs::create_dir_all(staging.parent().unwrap()).await.unwrap();
    tokio::fs::write(&staging, b"partial bytes").await.unwrap();
    h.db
        .mark_downloading(interrupted, &staging.to_string_lossy())
        .await
        .unwrap();
    h.db.set_status(done, JobStatus::Complete).await.unwrap();

    let report = recovery::recover(&h.engine.shared).await.unwrap();
    assert_eq!(report.downloads_requeued, 1);
    assert_eq!(report.uploads_requeued, 0);

    let job = h.db.get_job(interrupted).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingDownload);
    assert_eq!(job.staging_path, None);
    assert!(!staging.exists(), "untrusted partial removed");

    let job = h.db.get_job(done).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Complete, "terminal jobs untouched");
}

#[tokio::test]
async fn recovery_requeues_uploads_by_staging_evidence() {
    let h = harness(Mode::Hold).await;
    let kept = h.db.insert_job(&draft("a.jpg")).await.unwrap();
    let lost = h.db.insert_job(&draft("b.jpg")).await.unwrap();

    let staged = h._staging.path().join("staging").join("kept");
    tokio::fs::create_dir_all(staged.parent().unwrap()).await.unwrap();
    tokio::fs::write(&staged, b"staged bytes").await.unwrap();
    h.db.claim_for_download(2, 3).await.unwrap();
    h.db
        .mark_downloading(kept, &staged.to_string_lossy())
        .await
        .unwrap();
    h.db.mark_staged(kept).await.unwrap();
    h.db.set_status(kept, JobStatus::Uploading).await.unwrap();
    // Handed off before the crash: staging released, handle now stale.
    h.db.set_status(lost, JobStatus::UploadQueued).await.unwrap();

    let report = recovery::recover(&h.engine.shared).await.unwrap();
    assert_eq!(report.uploads_requeued, 1);
    assert_eq!(report.refetches, 1);

    let job = h.db.get_job(kept).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingUpload);
    assert!(staged.exists(), "staged bytes survive an upload requeue");

    let job = h.db.get_job(lost).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingDownload);
}
