//! `arq cancel <id>` – cancel a job wherever it is.

use anyhow::Result;
use arq_core::scheduler::TransferEngine;

pub async fn run_cancel(engine: &TransferEngine, id: i64) -> Result<()> {
    engine.cancel(id).await?;
    println!("Cancelled job {id}");
    Ok(())
}
