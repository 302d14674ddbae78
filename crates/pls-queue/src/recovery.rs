use std::sync::Arc;

use crate::{
    error::Result,
    store::JobStore,
    types::{JobRecord, JobStatus},
};

/// Read-only visibility into jobs that need a human (or future tooling).
///
/// A worker that crashes after claiming a job leaves it `InProgress` for good:
/// there is no lease or heartbeat. This scan surfaces such jobs but never
/// changes them; requeueing is an explicit operational decision.
pub struct RecoveryScan {
    store: Arc<dyn JobStore>,
}

impl RecoveryScan {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Every job currently `InProgress`, oldest first. Includes jobs a live
    /// worker is still executing; only age tells them apart from stranded ones.
    pub fn list_in_progress(&self) -> Result<Vec<JobRecord>> {
        self.store.list_by_status(JobStatus::InProgress)
    }

    /// Every terminally failed job, oldest first.
    pub fn list_failed(&self) -> Result<Vec<JobRecord>> {
        self.store.list_by_status(JobStatus::Failed)
    }
}
