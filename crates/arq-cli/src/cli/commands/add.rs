//! `arq add <local-ref>` – submit a transfer job.

use anyhow::Result;
use arq_core::scheduler::{JobSpec, TransferEngine};

#[allow(clippy::too_many_arguments)]
pub async fn run_add(
    engine: &TransferEngine,
    local_ref: String,
    endpoint: String,
    token: String,
    group: String,
    device_id: String,
    remote_ref: Option<String>,
    companion_ref: Option<String>,
) -> Result<()> {
    let spec = JobSpec {
        local_ref: local_ref.clone(),
        endpoint,
        access_token: token,
        device_id,
        group_tag: group,
        remote_ref,
        companion_ref,
    };
    let id = engine.submit(spec).await?;
    println!("Added job {id} for asset: {local_ref}");
    Ok(())
}
