//! `arq run` – recover interrupted jobs and drive the queue until idle.

use anyhow::Result;
use std::time::Instant;

use arq_core::config::ArqConfig;
use arq_core::job_db::{JobDb, JobStatus};
use arq_core::scheduler::ProgressUpdate;

use crate::cli::build_engine;

const PROGRESS_INTERVAL_MS: u64 = 500;

pub async fn run_queue(db: JobDb, cfg: &ArqConfig) -> Result<()> {
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(16);
    let engine = build_engine(db.clone(), cfg, Some(progress_tx))?;

    let progress_handle = tokio::spawn(async move {
        let mut last_print = Instant::now();
        while let Some(update) = progress_rx.recv().await {
            let now = Instant::now();
            if now.duration_since(last_print).as_millis() as u64 >= PROGRESS_INTERVAL_MS
                || update.fraction >= 1.0
            {
                println!(
                    "\r  job {}: fetching source ({:.1}%)  ",
                    update.job_id,
                    update.fraction * 100.0
                );
                last_print = now;
            }
        }
    });

    let report = engine.recover().await?;
    if report.total() > 0 {
        println!(
            "Recovered {} interrupted job(s) from previous run.",
            report.total()
        );
    }

    engine.run_until_idle().await?;
    // The engine (and so the progress sender) outlives this command via the
    // dispatcher task; stop the printer explicitly.
    progress_handle.abort();

    let jobs = db.list_jobs().await?;
    let complete = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Complete)
        .count();
    let failed = jobs
        .iter()
        .filter(|j| matches!(j.status, JobStatus::DownloadFailed | JobStatus::UploadFailed))
        .count();

    if jobs.is_empty() {
        println!("No jobs in queue.");
    } else {
        println!("Queue idle: {complete} complete, {failed} failed, {} total.", jobs.len());
        tracing::info!(complete, failed, total = jobs.len(), "run finished");
    }
    Ok(())
}
