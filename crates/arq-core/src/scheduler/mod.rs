//! The two-phase transfer scheduler.
//!
//! Coordinates the pipeline: admission pass → download stage → upload
//! stage → transport completion, with startup recovery and cooperative
//! cancellation. The job store is the single source of truth; everything
//! in-process (abort tokens, correlation handles, the pass guard) is an
//! ephemeral cache rebuilt empty on restart.

mod completion;
mod control;
mod download;
mod engine;
mod pass;
mod recovery;
mod upload;

pub use engine::{
    spawn_completion_dispatcher, JobSpec, ProgressUpdate, SubmitError, TransferEngine,
};
pub use recovery::RecoveryReport;

#[cfg(test)]
mod tests;
