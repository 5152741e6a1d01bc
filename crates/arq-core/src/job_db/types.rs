//! Types used by the persistent job table.

/// Job identifier.
pub type JobId = i64;

/// Correlation handle for an in-flight transport operation.
pub type TransportHandle = i64;

/// Job status stored as a string in the database.
///
/// `DownloadQueued` and `Uploading` are admission markers: the scheduler
/// pass sets them atomically when it claims a job, so a later pass counts
/// the job against phase capacity before its worker has made any progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    AwaitingDownload,
    DownloadQueued,
    Downloading,
    DownloadFailed,
    AwaitingUpload,
    Uploading,
    UploadQueued,
    UploadFailed,
    Complete,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::AwaitingDownload => "awaiting_download",
            JobStatus::DownloadQueued => "download_queued",
            JobStatus::Downloading => "downloading",
            JobStatus::DownloadFailed => "download_failed",
            JobStatus::AwaitingUpload => "awaiting_upload",
            JobStatus::Uploading => "uploading",
            JobStatus::UploadQueued => "upload_queued",
            JobStatus::UploadFailed => "upload_failed",
            JobStatus::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "awaiting_download" => JobStatus::AwaitingDownload,
            "download_queued" => JobStatus::DownloadQueued,
            "downloading" => JobStatus::Downloading,
            "download_failed" => JobStatus::DownloadFailed,
            "awaiting_upload" => JobStatus::AwaitingUpload,
            "uploading" => JobStatus::Uploading,
            "upload_queued" => JobStatus::UploadQueued,
            "upload_failed" => JobStatus::UploadFailed,
            "complete" => JobStatus::Complete,
            _ => JobStatus::DownloadFailed,
        }
    }
}

/// Fields supplied when a job is created. Status starts at
/// `AwaitingDownload` with zero attempts; everything here is immutable
/// for the life of the job.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub local_ref: String,
    pub source_id: String,
    pub device_id: String,
    pub file_name: String,
    pub file_created_at: i64,
    pub file_modified_at: i64,
    pub favorite: bool,
    pub remote_ref: Option<String>,
    pub group_tag: String,
    pub companion_ref: Option<String>,
    pub access_token: String,
    pub endpoint: String,
}

/// Full job row used by the scheduler and stages.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: i64,
    pub local_ref: String,
    pub source_id: String,
    pub device_id: String,
    pub file_name: String,
    pub file_created_at: i64,
    pub file_modified_at: i64,
    pub favorite: bool,
    pub remote_ref: Option<String>,
    pub group_tag: String,
    pub companion_ref: Option<String>,
    pub staging_path: Option<String>,
    pub transport_handle: Option<TransportHandle>,
    pub access_token: String,
    pub endpoint: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Summary view used by the CLI `status` command.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: i64,
    pub file_name: String,
    pub endpoint: String,
}

/// Phase-occupancy counters exposed through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Jobs currently streaming from the asset store (`downloading`).
    pub active_downloads: i64,
    /// Jobs between admission and transport handoff (`uploading`).
    pub active_uploads: i64,
    /// Jobs in the transport's hands awaiting completion (`upload_queued`).
    pub pending_uploads: i64,
}
