//! Job write operations: insert, claims, transitions, recovery, delete.
//!
//! Every transition is a single UPDATE (or a short transaction for the
//! admission claims) so concurrent workers and cancellation never race
//! through read-then-write. Conditional transitions return whether a row
//! was affected; zero rows means the job moved (or was deleted) underneath
//! the caller, which must then stand down.

use anyhow::Result;
use sqlx::Row;

use super::super::db::{unix_timestamp, JobDb};
use super::super::types::{JobDraft, JobId, JobRecord, JobStatus, TransportHandle};
use super::read::{record_from_row, RECORD_COLUMNS};

impl JobDb {
    /// Insert a new job awaiting download, with zero attempts.
    pub async fn insert_job(&self, draft: &JobDraft) -> Result<JobId> {
        let now = unix_timestamp();
        let row_id = sqlx::query(
            r#"
            INSERT INTO jobs (
                status, attempts, local_ref, source_id, device_id,
                file_name, file_created_at, file_modified_at, favorite,
                remote_ref, group_tag, companion_ref, staging_path,
                transport_handle, access_token, endpoint, created_at, updated_at
            ) VALUES (?1, 0, ?2, ?3, ?4,
                      ?5, ?6, ?7, ?8,
                      ?9, ?10, ?11, NULL,
                      NULL, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(JobStatus::AwaitingDownload.as_str())
        .bind(&draft.local_ref)
        .bind(&draft.source_id)
        .bind(&draft.device_id)
        .bind(&draft.file_name)
        .bind(draft.file_created_at)
        .bind(draft.file_modified_at)
        .bind(draft.favorite)
        .bind(&draft.remote_ref)
        .bind(&draft.group_tag)
        .bind(&draft.companion_ref)
        .bind(&draft.access_token)
        .bind(&draft.endpoint)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(row_id)
    }

    /// Atomically claim jobs eligible for the download phase, oldest first.
    ///
    /// Capacity is `cap` minus the jobs already claimed or streaming
    /// (`download_queued`, `downloading`); claimed rows are flipped to
    /// `download_queued` inside the same transaction so a stacked pass can
    /// never admit into the same capacity twice.
    pub async fn claim_for_download(&self, cap: usize, max_attempts: i64) -> Result<Vec<JobRecord>> {
        self.claim_phase(
            cap,
            max_attempts,
            &["download_queued", "downloading"],
            &["awaiting_download", "download_failed"],
            JobStatus::DownloadQueued,
        )
        .await
    }

    /// Atomically claim jobs eligible for the upload phase, oldest first.
    /// Occupancy counts `uploading` and `upload_queued`; claimed rows are
    /// flipped to `uploading`.
    pub async fn claim_for_upload(&self, cap: usize, max_attempts: i64) -> Result<Vec<JobRecord>> {
        self.claim_phase(
            cap,
            max_attempts,
            &["uploading", "upload_queued"],
            &["awaiting_upload", "upload_failed"],
            JobStatus::Uploading,
        )
        .await
    }

    async fn claim_phase(
        &self,
        cap: usize,
        max_attempts: i64,
        occupied: &[&str],
        eligible: &[&str],
        claimed_status: JobStatus,
    ) -> Result<Vec<JobRecord>> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let count_sql = format!(
            "SELECT COUNT(*) AS n FROM jobs WHERE status IN ({})",
            quoted_list(occupied)
        );
        let row = sqlx::query(&count_sql).fetch_one(&mut *tx).await?;
        let active: i64 = row.get("n");

        let budget = cap as i64 - active;
        if budget <= 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let select_sql = format!(
            "SELECT {RECORD_COLUMNS} FROM jobs \
             WHERE status IN ({}) AND attempts < ?1 \
             ORDER BY created_at ASC, id ASC LIMIT ?2",
            quoted_list(eligible)
        );
        let rows = sqlx::query(&select_sql)
            .bind(max_attempts)
            .bind(budget)
            .fetch_all(&mut *tx)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row);
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = ?1,
                    updated_at = ?2
                WHERE id = ?3
                "#,
            )
            .bind(claimed_status.as_str())
            .bind(now)
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
            record.status = claimed_status;
            claimed.push(record);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Record that a download worker started streaming: persist the staging
    /// path and flip to `downloading`. Conditional on the job still being
    /// claimed; false means it was cancelled in the meantime.
    pub async fn mark_downloading(&self, id: JobId, staging_path: &str) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'downloading',
                staging_path = ?1,
                updated_at = ?2
            WHERE id = ?3 AND status = 'download_queued'
            "#,
        )
        .bind(staging_path)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Record download success: the staged bytes are complete, the phase
    /// attempt counter resets, and the job waits for upload admission.
    pub async fn mark_staged(&self, id: JobId) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'awaiting_upload',
                attempts = 0,
                updated_at = ?1
            WHERE id = ?2 AND status = 'downloading'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Record transport handoff: persist the correlation handle and flip to
    /// `upload_queued`. Conditional on the job still being in the upload
    /// worker's hands.
    pub async fn mark_upload_queued(&self, id: JobId, handle: TransportHandle) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'upload_queued',
                transport_handle = ?1,
                updated_at = ?2
            WHERE id = ?3 AND status = 'uploading'
            "#,
        )
        .bind(handle)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Shared failure policy, download side: one more consecutive failure
    /// of the current phase. Never deletes and never reschedules; the next
    /// admission pass decides, gated on the attempts ceiling.
    pub async fn mark_download_failed(&self, id: JobId) -> Result<bool> {
        self.mark_phase_failed(id, JobStatus::DownloadFailed).await
    }

    /// Shared failure policy, upload side. Also clears the correlation
    /// handle: the transport operation, if any, has resolved.
    pub async fn mark_upload_failed(&self, id: JobId) -> Result<bool> {
        self.mark_phase_failed(id, JobStatus::UploadFailed).await
    }

    async fn mark_phase_failed(&self, id: JobId, status: JobStatus) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1,
                attempts = attempts + 1,
                transport_handle = NULL,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Record an immediate resubmission of a failed transfer: the job is
    /// back in the transport's hands under a new handle without passing
    /// through admission. Conditional on the failure status so a racing
    /// admission pass wins cleanly.
    pub async fn mark_upload_requeued(&self, id: JobId, handle: TransportHandle) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'upload_queued',
                transport_handle = ?1,
                updated_at = ?2
            WHERE id = ?3 AND status = 'upload_failed'
            "#,
        )
        .bind(handle)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Record transport success: the transfer resolved, the handle mapping
    /// is dead, the job is terminal. False if the row was cancelled first.
    pub async fn mark_complete(&self, id: JobId) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'complete',
                transport_handle = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Unconditionally set a job's status. False if the row is gone.
    pub async fn set_status(&self, id: JobId, status: JobStatus) -> Result<bool> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?1,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected() > 0)
    }

    /// Recovery: send an interrupted download back to the waiting line,
    /// attempts preserved. The staging file cannot be trusted and is
    /// removed by the caller.
    pub async fn requeue_download(&self, id: JobId) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'awaiting_download',
                staging_path = NULL,
                transport_handle = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recovery: requeue an interrupted upload whose staged bytes are still
    /// on disk, attempts preserved. The stale correlation handle is
    /// dropped; the restarted transport knows nothing about it.
    pub async fn requeue_upload(&self, id: JobId) -> Result<()> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'awaiting_upload',
                transport_handle = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Permanently remove a job row. Staging-file cleanup is handled by the
    /// engine, which knows whether a file exists.
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// "'a', 'b', ..." for a static status IN clause. Values are the fixed
/// status strings, never caller input.
fn quoted_list(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
