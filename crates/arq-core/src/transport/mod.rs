//! Transport seam: hands staged files to the remote endpoint and reports
//! completion asynchronously.
//!
//! `begin_upload` returns a correlation handle immediately; the outcome
//! arrives arbitrarily later as a `CompletionEvent` on the channel the
//! transport was built with. The engine treats those events as the sole
//! trigger for the queued→complete/failed transitions.

pub mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::headers::UploadHeaders;
use crate::job_db::TransportHandle;

/// Everything needed to resubmit a failed transfer without re-staging: the
/// transport's own spool copy plus the original request parameters.
#[derive(Debug, Clone)]
pub struct ResumeState {
    pub spool_path: PathBuf,
    pub endpoint: String,
    pub headers: UploadHeaders,
}

impl ResumeState {
    /// Drop the resume state without resubmitting, releasing the spool
    /// copy. Called when the job it belonged to no longer exists.
    pub async fn discard(self) {
        match tokio::fs::remove_file(&self.spool_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.spool_path.display(), "could not remove spool file: {}", e)
            }
        }
    }
}

/// Terminal outcome of one transport operation.
#[derive(Debug)]
pub enum UploadOutcome {
    Success,
    Cancelled,
    Failure { resume: Option<ResumeState> },
}

/// Inbound completion event, keyed by correlation handle.
#[derive(Debug)]
pub struct CompletionEvent {
    pub handle: TransportHandle,
    pub outcome: UploadOutcome,
}

/// The remote-transfer collaborator the upload phase hands files to.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Take an independent copy of `file` and start pushing it to
    /// `endpoint`. Returns the correlation handle for the in-flight
    /// transfer; the caller may release `file` as soon as this returns.
    async fn begin_upload(
        &self,
        file: &Path,
        endpoint: &str,
        headers: &UploadHeaders,
    ) -> anyhow::Result<TransportHandle>;

    /// Resubmit a previously failed transfer from its resume state, under a
    /// new correlation handle.
    async fn resume_upload(&self, resume: ResumeState) -> anyhow::Result<TransportHandle>;

    /// Request cancellation of an in-flight transfer. The transfer still
    /// resolves through a `Cancelled` completion event; unknown handles are
    /// ignored.
    async fn cancel(&self, handle: TransportHandle);
}
