use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    error::{QueueError, Result},
    store::JobStore,
    types::{JobId, JobRecord, JobStatus},
};

/// Claim/release protocol on top of the store's compare-and-set.
///
/// Every method is a single conditional transition along a valid edge.
/// `Ok(None)` means the record was not in the expected state: another worker
/// won the race, the outcome was already reported, or the id is unknown.
/// The coordinator keeps no state of its own between calls.
#[derive(Clone)]
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
}

impl JobCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// `Pending -> InProgress`. On success the caller holds the claim and the
    /// returned record is the snapshot taken while it was still `Pending`.
    ///
    /// For a given id at most one concurrent caller ever gets `Some`.
    pub fn acquire_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let claimed = self.transition(id, JobStatus::Pending, JobStatus::InProgress)?;
        if claimed.is_some() {
            info!(job_id = %id, "job acquired");
        }
        Ok(claimed)
    }

    /// `InProgress -> Succeeded`. Reporting twice is a silent no-op.
    pub fn mark_succeeded(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let done = self.transition(id, JobStatus::InProgress, JobStatus::Succeeded)?;
        if done.is_some() {
            info!(job_id = %id, "job succeeded");
        }
        Ok(done)
    }

    /// `InProgress -> Failed`. Reporting twice is a silent no-op.
    pub fn mark_failed(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let done = self.transition(id, JobStatus::InProgress, JobStatus::Failed)?;
        if done.is_some() {
            info!(job_id = %id, "job failed");
        }
        Ok(done)
    }

    fn transition(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<Option<JobRecord>> {
        if !from.can_transition_to(to) {
            return Err(QueueError::InvariantViolation(format!(
                "{from} -> {to} is not a valid job transition"
            )));
        }
        let previous = self.store.compare_and_set_status(id, from, to)?;
        if previous.is_none() {
            debug!(job_id = %id, %from, %to, "transition contended or already resolved");
        }
        Ok(previous)
    }
}
