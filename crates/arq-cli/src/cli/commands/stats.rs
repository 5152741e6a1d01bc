//! `arq stats` – show phase-occupancy counters.

use anyhow::Result;
use arq_core::job_db::JobDb;

pub async fn run_stats(db: &JobDb) -> Result<()> {
    let stats = db.queue_stats().await?;
    println!("active downloads: {}", stats.active_downloads);
    println!("active uploads:   {}", stats.active_uploads);
    println!("pending uploads:  {}", stats.pending_uploads);
    Ok(())
}
