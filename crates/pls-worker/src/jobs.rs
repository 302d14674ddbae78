//! Job variants this binary knows how to execute.

use async_trait::async_trait;
use pls_queue::{Job, JobError, JobOutcome, JobRegistry};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Fetch a URL. Only the claim is exercised here: the page is not downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchUrl {
    pub url: String,
}

impl FetchUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Job for FetchUrl {
    const KIND: &'static str = "fetch_url";

    async fn execute(&self) -> Result<JobOutcome, JobError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Ok(JobOutcome::Failure);
        }
        info!(%url, "processing");
        Ok(JobOutcome::Success)
    }
}

/// Registry with every variant above.
pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<FetchUrl>();
    registry
}
