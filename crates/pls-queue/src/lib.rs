//! `pls-queue`: a distributed job queue coordinated only through SQLite.
//!
//! # Overview
//!
//! Producers [`insert`](store::JobStore::insert) jobs as `Pending`. Any number
//! of independent [`WorkerLoop`]s, each with its own connection, list pending
//! ids, claim them through the [`JobCoordinator`], execute them via the
//! [`JobRegistry`] and report the outcome. Every state change is a single
//! conditional `UPDATE … WHERE id = ? AND status = ?`, which is what
//! guarantees that at most one worker ever runs a given job.
//!
//! # Lifecycle
//!
//! | From          | To            | Operation                          |
//! |---------------|---------------|------------------------------------|
//! | (insert)      | `Pending`     | [`JobStore::insert`]               |
//! | `Pending`     | `InProgress`  | [`JobCoordinator::acquire_job`]    |
//! | `InProgress`  | `Succeeded`   | [`JobCoordinator::mark_succeeded`] |
//! | `InProgress`  | `Failed`      | [`JobCoordinator::mark_failed`]    |
//!
//! Nothing moves a job back to `Pending`. Jobs whose worker died mid-run stay
//! `InProgress` and are listed by [`RecoveryScan::list_in_progress`].

pub mod coordinator;
pub mod db;
pub mod error;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use coordinator::JobCoordinator;
pub use error::{JobError, QueueError, Result};
pub use recovery::RecoveryScan;
pub use registry::{Job, JobHandler, JobRegistry};
pub use store::{JobStore, SqliteJobStore};
pub use types::{JobId, JobOutcome, JobRecord, JobStatus, NewJob};
pub use worker::{CycleReport, WorkerLoop, WorkerPool};
