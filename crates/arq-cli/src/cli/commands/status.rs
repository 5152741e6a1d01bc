//! `arq status` – show all jobs.

use anyhow::Result;
use arq_core::job_db::JobDb;

pub async fn run_status(db: &JobDb) -> Result<()> {
    let jobs = db.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs in database.");
    } else {
        println!(
            "{:<6} {:<18} {:<9} {:<30} {}",
            "ID", "STATUS", "ATTEMPTS", "FILE", "ENDPOINT"
        );
        for j in jobs {
            println!(
                "{:<6} {:<18} {:<9} {:<30} {}",
                j.id,
                j.status.as_str(),
                j.attempts,
                j.file_name,
                j.endpoint
            );
        }
    }
    Ok(())
}
