//! SQLite-backed job table implementation.
//!
//! Handles connection, migration, and timestamp helpers. Job CRUD lives in
//! `jobs`.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Percent-encode a path for use in a sqlite:// URI so spaces and special
/// chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the SQLite-backed job table.
///
/// The database file lives under the XDG state directory:
/// `~/.local/state/arq/jobs.db`. Every status or attempts mutation is a
/// single statement (or a short transaction) against this pool; the table
/// is the sole source of truth for job state.
#[derive(Clone)]
pub struct JobDb {
    pub(crate) pool: Pool<Sqlite>,
}

impl JobDb {
    /// Open (or create) the default job database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("arq")?;
        let state_dir = xdg_dirs.get_state_home().join("arq");
        let db_path = state_dir.join("jobs.db");

        tokio::fs::create_dir_all(&state_dir).await?;

        let uri = path_to_sqlite_uri(&db_path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;

        let db = JobDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open (or create) the database at a specific path. Creates parent
    /// dirs if needed. Intended for tests so the DB can live in a temp dir.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&uri)
            .await?;
        let db = JobDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        // Single-table schema. Descriptive metadata is copied verbatim at
        // creation and forwarded in the upload headers; staging_path and
        // transport_handle are the only mutable columns besides
        // status/attempts/updated_at.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                local_ref TEXT NOT NULL,
                source_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_created_at INTEGER NOT NULL,
                file_modified_at INTEGER NOT NULL,
                favorite INTEGER NOT NULL DEFAULT 0,
                remote_ref TEXT,
                group_tag TEXT NOT NULL,
                companion_ref TEXT,
                staging_path TEXT,
                transport_handle INTEGER,
                access_token TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Current time as Unix seconds (for DB timestamps). Pub for use by `jobs`.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
/// Open an in-memory database for tests (no disk I/O).
pub(crate) async fn open_memory() -> Result<JobDb> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let db = JobDb { pool };
    db.migrate().await?;
    Ok(db)
}
