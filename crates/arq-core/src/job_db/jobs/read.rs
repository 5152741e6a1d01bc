//! Job read operations: get, list, counters.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::super::db::JobDb;
use super::super::types::{JobId, JobRecord, JobStatus, JobSummary, QueueStats};

/// Column list shared by every full-record SELECT.
pub(crate) const RECORD_COLUMNS: &str = "id, status, attempts, local_ref, source_id, device_id, \
     file_name, file_created_at, file_modified_at, favorite, remote_ref, group_tag, \
     companion_ref, staging_path, transport_handle, access_token, endpoint, created_at, updated_at";

/// Map a full row into a `JobRecord`.
pub(crate) fn record_from_row(row: &SqliteRow) -> JobRecord {
    let status: String = row.get("status");
    JobRecord {
        id: row.get("id"),
        status: JobStatus::from_str(&status),
        attempts: row.get("attempts"),
        local_ref: row.get("local_ref"),
        source_id: row.get("source_id"),
        device_id: row.get("device_id"),
        file_name: row.get("file_name"),
        file_created_at: row.get("file_created_at"),
        file_modified_at: row.get("file_modified_at"),
        favorite: row.get("favorite"),
        remote_ref: row.get("remote_ref"),
        group_tag: row.get("group_tag"),
        companion_ref: row.get("companion_ref"),
        staging_path: row.get("staging_path"),
        transport_handle: row.get("transport_handle"),
        access_token: row.get("access_token"),
        endpoint: row.get("endpoint"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl JobDb {
    /// Fetch a single job row with full metadata.
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(record_from_row))
    }

    /// List all jobs in creation order (oldest first).
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, attempts, file_name, endpoint
            FROM jobs
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            out.push(JobSummary {
                id: row.get("id"),
                status: JobStatus::from_str(&status),
                attempts: row.get("attempts"),
                file_name: row.get("file_name"),
                endpoint: row.get("endpoint"),
            });
        }
        Ok(out)
    }

    /// Fetch every job currently in one of the given statuses, oldest first.
    /// Used by Recovery, which must inspect each row before deciding where
    /// to requeue it.
    pub async fn jobs_in_statuses(&self, statuses: &[JobStatus]) -> Result<Vec<JobRecord>> {
        let placeholders = placeholders(statuses.len());
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM jobs WHERE status IN ({placeholders}) \
             ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for s in statuses {
            query = query.bind(s.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// Phase-occupancy counters for the bridge's `queue_stats`.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'downloading') AS active_downloads,
                COUNT(*) FILTER (WHERE status = 'uploading') AS active_uploads,
                COUNT(*) FILTER (WHERE status = 'upload_queued') AS pending_uploads
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            active_downloads: row.get("active_downloads"),
            active_uploads: row.get("active_uploads"),
            pending_uploads: row.get("pending_uploads"),
        })
    }

    /// True while any job is in flight or still eligible for admission.
    /// Terminal rows (`complete`, failed at the attempts ceiling) don't
    /// count.
    pub async fn has_runnable_work(&self, max_attempts: i64) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM jobs
            WHERE status IN ('awaiting_download', 'download_queued', 'downloading',
                             'awaiting_upload', 'uploading', 'upload_queued')
               OR (status IN ('download_failed', 'upload_failed') AND attempts < ?1)
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }
}

/// "?1, ?2, ..." for a dynamic IN clause.
pub(crate) fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}
