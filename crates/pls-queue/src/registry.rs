//! Job variants and discriminator-based dispatch.
//!
//! A stored record only carries its `kind` string and a JSON payload. Each
//! variant implements [`Job`]; registering it in a [`JobRegistry`] installs a
//! typed adapter under `Job::KIND`, and the worker loop dispatches on the
//! record's discriminator without knowing any variant.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::JobError;
use crate::types::{JobOutcome, JobRecord};

/// A job variant: its payload shape plus its execute behaviour.
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Discriminator stored alongside the payload (e.g. "fetch_url").
    const KIND: &'static str;

    /// Run the job. `Err` and panics are both treated as a failed execution.
    async fn execute(&self) -> Result<JobOutcome, JobError>;
}

/// Object-safe execute behaviour for one discriminator.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> &str;

    /// Decode `record.payload` and execute it.
    async fn run(&self, record: &JobRecord) -> Result<JobOutcome, JobError>;
}

/// Adapter from a typed [`Job`] to a [`JobHandler`].
struct TypedHandler<J>(PhantomData<fn() -> J>);

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    fn kind(&self) -> &str {
        J::KIND
    }

    async fn run(&self, record: &JobRecord) -> Result<JobOutcome, JobError> {
        let job: J = serde_json::from_value(record.payload.clone())?;
        job.execute().await
    }
}

/// Discriminator -> handler table shared by every worker loop.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed variant under `J::KIND`, replacing any previous one.
    pub fn register<J: Job>(&mut self) -> &mut Self {
        self.register_handler(Arc::new(TypedHandler::<J>(PhantomData)))
    }

    /// Register a hand-written handler under its own `kind()`.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        let kind = handler.kind().to_string();
        debug!(%kind, "job variant registered");
        self.handlers.insert(kind, handler);
        self
    }

    /// Registered discriminators, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Execute `record` with the handler registered for its discriminator.
    pub async fn dispatch(&self, record: &JobRecord) -> Result<JobOutcome, JobError> {
        match self.handlers.get(&record.kind) {
            Some(handler) => handler.run(record).await,
            None => Err(JobError::UnknownKind {
                kind: record.kind.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
