//! Ephemeral registry of in-flight work: abort tokens per job and the
//! transport-handle correlation map.
//!
//! Process-local cache only, never authoritative — it starts empty after a
//! restart and Recovery rebuilds job state from the store alone. The
//! correlation map is the single place a completion event is matched to a
//! job; an entry is removed the instant its transfer resolves (or its job
//! is cancelled), whichever side gets there first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::job_db::{JobId, TransportHandle};

#[derive(Default)]
pub(crate) struct ActiveTransfers {
    jobs: RwLock<HashMap<JobId, Arc<AtomicBool>>>,
    uploads: RwLock<HashMap<TransportHandle, JobId>>,
}

impl ActiveTransfers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a running stage worker; returns the abort token the worker
    /// checks between chunks.
    pub(crate) fn register(&self, job_id: JobId) -> Arc<AtomicBool> {
        let token = Arc::new(AtomicBool::new(false));
        self.jobs
            .write()
            .unwrap()
            .insert(job_id, Arc::clone(&token));
        token
    }

    /// Unregister a worker (call when the stage exits, success or failure).
    pub(crate) fn unregister(&self, job_id: JobId) {
        self.jobs.write().unwrap().remove(&job_id);
    }

    /// Request abort for a job's stage worker, if one is running.
    pub(crate) fn request_abort(&self, job_id: JobId) {
        if let Some(token) = self.jobs.read().unwrap().get(&job_id) {
            token.store(true, Ordering::Relaxed);
        }
    }

    /// Record an in-flight transport operation for a job.
    pub(crate) fn track_upload(&self, handle: TransportHandle, job_id: JobId) {
        self.uploads.write().unwrap().insert(handle, job_id);
    }

    /// Match a completion event to its job, consuming the mapping.
    pub(crate) fn resolve_upload(&self, handle: TransportHandle) -> Option<JobId> {
        self.uploads.write().unwrap().remove(&handle)
    }

    /// Drop a job's transport mapping (cancellation path), returning the
    /// handle so the transfer itself can be cancelled.
    pub(crate) fn untrack_job(&self, job_id: JobId) -> Option<TransportHandle> {
        let mut uploads = self.uploads.write().unwrap();
        let handle = uploads
            .iter()
            .find(|(_, id)| **id == job_id)
            .map(|(h, _)| *h)?;
        uploads.remove(&handle);
        Some(handle)
    }

    /// True when no stage worker is running and no transfer is mapped.
    pub(crate) fn is_idle(&self) -> bool {
        self.jobs.read().unwrap().is_empty() && self.uploads.read().unwrap().is_empty()
    }
}
