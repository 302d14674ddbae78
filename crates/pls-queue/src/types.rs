use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::Job;

/// Opaque job identifier, assigned once at insertion and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh identifier. UUIDv7, so ids sort roughly by creation time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a persisted job.
///
/// Valid edges: `Pending -> InProgress`, `InProgress -> Succeeded`,
/// `InProgress -> Failed`. Nothing leaves a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not initialised. Must never reach the store.
    #[default]
    None,
    /// Inserted, waiting for a worker to claim it.
    Pending,
    /// Claimed by exactly one worker, which is executing it.
    InProgress,
    /// The claiming worker reported a failed execution.
    Failed,
    /// The claiming worker reported a successful execution.
    Succeeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::None => "none",
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Failed => "failed",
            JobStatus::Succeeded => "succeeded",
        }
    }

    /// Whether `self -> next` is one of the three valid edges.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Succeeded)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Succeeded)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(JobStatus::None),
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "failed" => Ok(JobStatus::Failed),
            "succeeded" => Ok(JobStatus::Succeeded),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Discriminator selecting the job variant and its execute behaviour.
    pub kind: String,
    /// Variant-specific fields.
    pub payload: serde_json::Value,
    /// RFC 3339 timestamp set by the store at insertion.
    pub created_at: String,
}

/// A producer's insertion request.
///
/// `status` exists so callers can hand over whatever they built; the store
/// always persists the job as [`JobStatus::Pending`]. `id` is generated by the
/// store when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub status: JobStatus,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            status: JobStatus::None,
            kind: kind.into(),
            payload,
        }
    }

    /// Build an insertion request from a typed job variant.
    pub fn from_job<J: Job>(job: &J) -> serde_json::Result<Self> {
        Ok(Self::new(J::KIND, serde_json::to_value(job)?))
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Classification of one execution, as returned by a job's execute behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    /// Reserved. Has no state transition: the job stays `InProgress`.
    Indeterminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::None,
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Failed,
        JobStatus::Succeeded,
    ];

    #[test]
    fn status_text_matches_serde() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert!("running".parse::<JobStatus>().is_err());
        assert!("".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_three_edges_are_valid() {
        let mut valid = Vec::new();
        for from in ALL {
            for to in ALL {
                if from.can_transition_to(to) {
                    valid.push((from, to));
                }
            }
        }
        assert_eq!(
            valid,
            vec![
                (JobStatus::Pending, JobStatus::InProgress),
                (JobStatus::InProgress, JobStatus::Failed),
                (JobStatus::InProgress, JobStatus::Succeeded),
            ]
        );
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn default_status_is_none() {
        assert_eq!(JobStatus::default(), JobStatus::None);
        assert_eq!(NewJob::new("k", serde_json::Value::Null).status, JobStatus::None);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), format!("\"{a}\""));
    }
}
