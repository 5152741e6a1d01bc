//! CLI for the ARQ asset upload queue.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use arq_core::asset_store::{AssetStore, FsAssetStore};
use arq_core::config::{self, ArqConfig};
use arq_core::job_db::JobDb;
use arq_core::scheduler::{spawn_completion_dispatcher, ProgressUpdate, TransferEngine};
use arq_core::transport::http::default_spool_dir;
use arq_core::transport::{HttpTransport, Transport};

use commands::{run_add, run_cancel, run_queue, run_stats, run_status};

/// Top-level CLI for the ARQ asset upload queue.
#[derive(Debug, Parser)]
#[command(name = "arq")]
#[command(about = "ARQ: durable two-phase asset upload queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Submit a transfer job for a local asset.
    Add {
        /// Asset path, relative to the configured asset root.
        local_ref: String,

        /// Destination URL the bytes are pushed to.
        #[arg(long)]
        endpoint: String,

        /// Per-job auth token, forwarded in the upload headers.
        #[arg(long)]
        token: String,

        /// Logical upload group.
        #[arg(long, default_value = "default")]
        group: String,

        /// Identifier of the submitting device.
        #[arg(long, default_value = "arq-cli")]
        device_id: String,

        /// Existing remote-side identifier, if any.
        #[arg(long)]
        remote_ref: Option<String>,

        /// Paired companion asset (e.g. a motion clip for a photo).
        #[arg(long)]
        companion_ref: Option<String>,
    },

    /// Cancel a job by id, removing its row and any staged bytes.
    Cancel {
        /// Job identifier.
        id: i64,
    },

    /// Show all jobs.
    Status,

    /// Show phase-occupancy counters.
    Stats,

    /// Recover interrupted jobs, then drive the queue until it is idle.
    Run,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let db = JobDb::open_default().await?;

        match cli.command {
            CliCommand::Add {
                local_ref,
                endpoint,
                token,
                group,
                device_id,
                remote_ref,
                companion_ref,
            } => {
                let engine = build_engine(db, &cfg, None)?;
                run_add(
                    &engine,
                    local_ref,
                    endpoint,
                    token,
                    group,
                    device_id,
                    remote_ref,
                    companion_ref,
                )
                .await?;
            }
            CliCommand::Cancel { id } => {
                let engine = build_engine(db, &cfg, None)?;
                run_cancel(&engine, id).await?;
            }
            CliCommand::Status => run_status(&db).await?,
            CliCommand::Stats => run_stats(&db).await?,
            CliCommand::Run => run_queue(db, &cfg).await?,
        }

        Ok(())
    }
}

/// Wire the engine to the filesystem asset store and the HTTP transport,
/// including the completion dispatcher. The dispatcher task lives for the
/// rest of the process.
pub(crate) fn build_engine(
    db: JobDb,
    cfg: &ArqConfig,
    progress: Option<tokio::sync::mpsc::Sender<ProgressUpdate>>,
) -> Result<TransferEngine> {
    let asset_root = match &cfg.asset_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let assets: Arc<dyn AssetStore> = Arc::new(FsAssetStore::new(asset_root));

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        default_spool_dir()?,
        cfg.transport(),
        events_tx,
    ));

    let mut engine = TransferEngine::new(db, cfg.clone(), assets, transport)?;
    if let Some(tx) = progress {
        engine = engine.with_progress(tx);
    }
    spawn_completion_dispatcher(engine.clone(), events_rx);
    Ok(engine)
}

#[cfg(test)]
mod tests;
