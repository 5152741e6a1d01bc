//! HTTP upload transport over libcurl.
//!
//! Each transfer POSTs a spool copy of the staged file from a blocking
//! thread. The spool copy is what makes the engine's "release staging at
//! handoff" contract safe, and it doubles as the resume state: transfers
//! that die to a network-level error keep their spool file and hand it back
//! inside `UploadOutcome::Failure` for resubmission.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::headers::UploadHeaders;
use crate::job_db::TransportHandle;

use super::{CompletionEvent, ResumeState, Transport, UploadOutcome};

/// Default spool directory: `~/.local/state/arq/spool`.
pub fn default_spool_dir() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("arq")?;
    Ok(xdg_dirs.get_state_home().join("arq").join("spool"))
}

/// Error from one POST attempt, classified before conversion to an outcome.
#[derive(Debug)]
enum TransferError {
    /// Curl reported an error (timeout, connection, etc.).
    Curl(curl::Error),
    /// HTTP response had a non-2xx status.
    Http(u32),
    /// Spool file could not be read.
    Io(std::io::Error),
    /// The cancel token was set; the transfer was aborted from our side.
    Aborted,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Curl(e) => write!(f, "{}", e),
            TransferError::Http(code) => write!(f, "HTTP {}", code),
            TransferError::Io(e) => write!(f, "io: {}", e),
            TransferError::Aborted => write!(f, "upload aborted"),
        }
    }
}

impl From<curl::Error> for TransferError {
    fn from(e: curl::Error) -> Self {
        TransferError::Curl(e)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e)
    }
}

/// Network-level failures are worth resubmitting from the spool copy; HTTP
/// rejections and local IO errors are not.
fn is_resumable(e: &TransferError) -> bool {
    match e {
        TransferError::Curl(ce) => {
            ce.is_operation_timedout()
                || ce.is_couldnt_connect()
                || ce.is_couldnt_resolve_host()
                || ce.is_couldnt_resolve_proxy()
                || ce.is_send_error()
                || ce.is_recv_error()
                || ce.is_got_nothing()
        }
        TransferError::Http(_) | TransferError::Io(_) | TransferError::Aborted => false,
    }
}

struct Inner {
    events: mpsc::UnboundedSender<CompletionEvent>,
    spool_dir: PathBuf,
    tuning: TransportConfig,
    next_handle: AtomicI64,
    cancels: Mutex<HashMap<TransportHandle, Arc<AtomicBool>>>,
}

/// Curl-backed `Transport`. Cheap to clone; all transfers share the spool
/// dir and the completion channel.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

impl HttpTransport {
    /// Create a transport spooling into `spool_dir` and delivering
    /// completions on `events`. Stale spool files from a previous process
    /// are swept immediately; none of them can ever be resumed because the
    /// handles that referenced them died with that process.
    pub fn new(
        spool_dir: PathBuf,
        tuning: TransportConfig,
        events: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Self {
        sweep_spool(&spool_dir);
        Self {
            inner: Arc::new(Inner {
                events,
                spool_dir,
                tuning,
                next_handle: AtomicI64::new(0),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn spawn_transfer(
        &self,
        handle: TransportHandle,
        spool: PathBuf,
        endpoint: String,
        headers: UploadHeaders,
    ) {
        let inner = Arc::clone(&self.inner);
        let abort = Arc::new(AtomicBool::new(false));
        inner
            .cancels
            .lock()
            .unwrap()
            .insert(handle, Arc::clone(&abort));

        tokio::spawn(async move {
            let blocking_spool = spool.clone();
            let blocking_endpoint = endpoint.clone();
            let blocking_headers = headers.clone();
            let blocking_abort = Arc::clone(&abort);
            let tuning = inner.tuning.clone();
            let result = tokio::task::spawn_blocking(move || {
                post_file_blocking(
                    &blocking_endpoint,
                    &blocking_headers,
                    &blocking_spool,
                    &blocking_abort,
                    &tuning,
                )
            })
            .await;

            inner.cancels.lock().unwrap().remove(&handle);

            let outcome = match result {
                Ok(Ok(())) => {
                    remove_spool(&spool).await;
                    UploadOutcome::Success
                }
                Ok(Err(TransferError::Aborted)) => {
                    tracing::info!(handle, "upload cancelled");
                    remove_spool(&spool).await;
                    UploadOutcome::Cancelled
                }
                Ok(Err(e)) if is_resumable(&e) => {
                    tracing::warn!(handle, "upload failed, resumable: {}", e);
                    UploadOutcome::Failure {
                        resume: Some(ResumeState {
                            spool_path: spool,
                            endpoint,
                            headers,
                        }),
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(handle, "upload failed: {}", e);
                    remove_spool(&spool).await;
                    UploadOutcome::Failure { resume: None }
                }
                Err(join_err) => {
                    tracing::error!(handle, "upload worker died: {}", join_err);
                    remove_spool(&spool).await;
                    UploadOutcome::Failure { resume: None }
                }
            };

            // Receiver gone means the engine is shutting down; nothing to do.
            let _ = inner.events.send(CompletionEvent { handle, outcome });
        });
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn begin_upload(
        &self,
        file: &Path,
        endpoint: &str,
        headers: &UploadHeaders,
    ) -> Result<TransportHandle> {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::fs::create_dir_all(&self.inner.spool_dir)
            .await
            .with_context(|| format!("create spool dir {}", self.inner.spool_dir.display()))?;
        let spool = self.inner.spool_dir.join(format!("upload-{handle}.part"));
        tokio::fs::copy(file, &spool)
            .await
            .with_context(|| format!("spool {}", file.display()))?;

        self.spawn_transfer(handle, spool, endpoint.to_string(), headers.clone());
        Ok(handle)
    }

    async fn resume_upload(&self, resume: ResumeState) -> Result<TransportHandle> {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.spawn_transfer(handle, resume.spool_path, resume.endpoint, resume.headers);
        Ok(handle)
    }

    async fn cancel(&self, handle: TransportHandle) {
        if let Some(token) = self.inner.cancels.lock().unwrap().get(&handle) {
            token.store(true, Ordering::Relaxed);
        }
    }
}

/// POST the spool file to the endpoint. Runs on a blocking thread; the
/// abort token is checked every time libcurl asks for more body bytes.
fn post_file_blocking(
    endpoint: &str,
    headers: &UploadHeaders,
    spool: &Path,
    abort: &AtomicBool,
    tuning: &TransportConfig,
) -> Result<(), TransferError> {
    let mut file = File::open(spool)?;
    let len = file.metadata()?.len();

    let mut easy = curl::easy::Easy::new();
    easy.url(endpoint)?;
    easy.post(true)?;
    easy.post_field_size(len)?;
    easy.connect_timeout(Duration::from_secs(tuning.connect_timeout_secs))?;
    easy.timeout(Duration::from_secs(tuning.request_timeout_secs))?;
    easy.low_speed_limit(1024)?;
    easy.low_speed_time(Duration::from_secs(60))?;

    let mut list = curl::easy::List::new();
    for (name, value) in headers.as_pairs() {
        list.append(&format!("{}: {}", name, value))?;
    }
    list.append("Content-Type: application/octet-stream")?;
    easy.http_headers(list)?;

    {
        let mut transfer = easy.transfer();
        transfer.read_function(|into| {
            if abort.load(Ordering::Relaxed) {
                return Err(curl::easy::ReadError::Abort);
            }
            file.read(into).map_err(|_| curl::easy::ReadError::Abort)
        })?;
        transfer.perform().map_err(|e| {
            if abort.load(Ordering::Relaxed) || e.is_aborted_by_callback() {
                TransferError::Aborted
            } else {
                TransferError::Curl(e)
            }
        })?;
    }

    let code = easy.response_code()?;
    if !(200..300).contains(&code) {
        return Err(TransferError::Http(code));
    }
    Ok(())
}

async fn remove_spool(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "could not remove spool file: {}", e),
    }
}

/// Remove leftover spool files from an earlier process.
fn sweep_spool(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("upload-") && name.ends_with(".part") {
            if std::fs::remove_file(entry.path()).is_ok() {
                tracing::debug!(file = %name, "swept stale spool file");
            }
        }
    }
}
