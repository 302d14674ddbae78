use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use pls_core::{DatabaseConfig, WorkerConfig};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    coordinator::JobCoordinator,
    error::{JobError, QueueError, Result},
    registry::JobRegistry,
    store::{JobStore, SqliteJobStore},
    types::{JobOutcome, JobRecord, JobStatus},
};

/// Counters for one or more polling cycles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Pending ids returned by the listing.
    pub listed: usize,
    /// Ids this worker claimed.
    pub acquired: usize,
    /// Ids another worker claimed first (or that were no longer pending).
    pub contended: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Executions that reported `Indeterminate`; those jobs stay `InProgress`.
    pub indeterminate: usize,
}

impl std::ops::AddAssign for CycleReport {
    fn add_assign(&mut self, rhs: Self) {
        self.listed += rhs.listed;
        self.acquired += rhs.acquired;
        self.contended += rhs.contended;
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
        self.indeterminate += rhs.indeterminate;
    }
}

/// One independent worker: list pending ids, claim, execute, report.
///
/// Owns its store handle; shares nothing with other workers except the
/// database behind it.
pub struct WorkerLoop {
    name: String,
    store: Arc<dyn JobStore>,
    coordinator: JobCoordinator,
    registry: Arc<JobRegistry>,
    batch_limit: usize,
    poll_interval: Duration,
}

impl WorkerLoop {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            coordinator: JobCoordinator::new(store.clone()),
            store,
            registry,
            batch_limit: config.batch_limit.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One polling cycle over at most `batch_limit` pending ids.
    ///
    /// Execution faults become `Failed`; store faults end the cycle with `Err`.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.cycle(None).await
    }

    /// A cycle that stops claiming once `shutdown` reads `true`. The job in
    /// hand is always executed and reported first.
    async fn cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleReport> {
        let store = self.store.clone();
        let limit = self.batch_limit;
        let ids = blocking(move || store.list_ids_by_status(JobStatus::Pending, limit)).await?;
        let mut report = CycleReport {
            listed: ids.len(),
            ..CycleReport::default()
        };

        for id in ids {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                debug!(worker = %self.name, "shutdown requested, ending cycle early");
                break;
            }

            let coordinator = self.coordinator.clone();
            let Some(job) = blocking(move || coordinator.acquire_job(&id)).await? else {
                report.contended += 1;
                continue;
            };
            report.acquired += 1;

            match self.execute(&job).await {
                JobOutcome::Success => {
                    if self.report(&job, JobStatus::Succeeded).await?.is_some() {
                        report.succeeded += 1;
                    } else {
                        debug!(job_id = %job.id, "success not recorded: job no longer in progress");
                    }
                }
                JobOutcome::Failure => {
                    if self.report(&job, JobStatus::Failed).await?.is_some() {
                        report.failed += 1;
                    } else {
                        debug!(job_id = %job.id, "failure not recorded: job no longer in progress");
                    }
                }
                JobOutcome::Indeterminate => {
                    // No transition is defined for this outcome. The job stays
                    // in progress and shows up in the recovery scan.
                    warn!(job_id = %job.id, kind = %job.kind, "indeterminate outcome; job left in progress");
                    report.indeterminate += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run `cycles` polling cycles back to back and sum their reports.
    pub async fn run_cycles(&self, cycles: usize) -> Result<CycleReport> {
        let mut total = CycleReport::default();
        for _ in 0..cycles {
            total += self.run_cycle().await?;
        }
        Ok(total)
    }

    /// Poll until `shutdown` broadcasts `true` (or its sender is dropped).
    ///
    /// Sleeps `poll_interval` after a cycle that claimed nothing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<CycleReport> {
        info!(worker = %self.name, "worker started");
        let mut total = CycleReport::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.cycle(Some(&shutdown)).await?;
            total += report;

            if report.acquired == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker = %self.name, acquired = total.acquired, "worker stopped");
        Ok(total)
    }

    /// Record the terminal status of a job this loop acquired.
    async fn report(&self, job: &JobRecord, status: JobStatus) -> Result<Option<JobRecord>> {
        let coordinator = self.coordinator.clone();
        let id = job.id.clone();
        blocking(move || match status {
            JobStatus::Succeeded => coordinator.mark_succeeded(&id),
            _ => coordinator.mark_failed(&id),
        })
        .await
    }

    /// Execute an acquired job, folding every fault into `Failure`.
    async fn execute(&self, job: &JobRecord) -> JobOutcome {
        debug!(job_id = %job.id, kind = %job.kind, "executing job");
        let result = match AssertUnwindSafe(self.registry.dispatch(job))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.id, kind = %job.kind, error = %e, "job execution failed");
                JobOutcome::Failure
            }
        }
    }
}

/// Run a store call on the blocking pool; it may wait up to the busy timeout.
async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| QueueError::WorkerTask(e.to_string()))?
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A fixed set of worker loops run as one task group.
///
/// Every loop is joined and the reports are summed. A store fault or a
/// panicked task in any loop is returned to the caller once the others have
/// stopped. Healthy loops are never aborted, so a job they hold is still
/// reported.
pub struct WorkerPool {
    workers: Vec<WorkerLoop>,
}

impl WorkerPool {
    /// Build `count` loops, each with its own store from `open_store`.
    pub fn new<F>(
        count: usize,
        registry: Arc<JobRegistry>,
        config: &WorkerConfig,
        mut open_store: F,
    ) -> Result<Self>
    where
        F: FnMut() -> Result<Arc<dyn JobStore>>,
    {
        let workers = (0..count)
            .map(|i| -> Result<WorkerLoop> {
                let store = open_store()?;
                Ok(WorkerLoop::new(
                    format!("worker-{i}"),
                    store,
                    registry.clone(),
                    config,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { workers })
    }

    /// One SQLite connection per worker, all on the configured database file.
    pub fn from_config(
        database: &DatabaseConfig,
        config: &WorkerConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(config.workers, registry, config, || {
            let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(database)?);
            Ok(store)
        })
    }

    /// Every worker runs `cycles` cycles concurrently; returns the summed report.
    pub async fn run_cycles(self, cycles: usize) -> Result<CycleReport> {
        let mut set = JoinSet::new();
        for worker in self.workers {
            let span = info_span!("worker", name = %worker.name());
            set.spawn(async move { worker.run_cycles(cycles).await }.instrument(span));
        }
        join_all(set, None).await
    }

    /// Every worker polls until `shutdown` flips to `true`, or until any
    /// worker faults, in which case the rest stop at their next job boundary.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<CycleReport> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let mut set = JoinSet::new();
        for worker in self.workers {
            let span = info_span!("worker", name = %worker.name());
            let stop = stop_rx.clone();
            set.spawn(async move { worker.run(stop).await }.instrument(span));
        }

        let forward = {
            let stop_tx = stop_tx.clone();
            tokio::spawn(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                stop_tx.send_replace(true);
            })
        };

        let result = join_all(set, Some(&stop_tx)).await;
        forward.abort();
        result
    }
}

/// Wait for every task and return the first fault, if any. On a fault the
/// remaining loops are asked to stop through `stop`; none is aborted.
async fn join_all(
    mut set: JoinSet<Result<CycleReport>>,
    stop: Option<&watch::Sender<bool>>,
) -> Result<CycleReport> {
    let mut total = CycleReport::default();
    let mut first_err: Option<QueueError> = None;

    while let Some(joined) = set.join_next().await {
        let err = match joined {
            Ok(Ok(report)) => {
                total += report;
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => QueueError::WorkerTask(e.to_string()),
        };

        error!(error = %err, "worker stopped with an error");
        if first_err.is_none() {
            if let Some(stop) = stop {
                stop.send_replace(true);
            }
            first_err = Some(err);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Job;
    use crate::types::NewJob;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(tag = "mode", rename_all = "snake_case")]
    enum Scripted {
        Succeed,
        Fail,
        Error,
        Panic,
        Unsure,
        Sleep { ms: u64 },
    }

    #[async_trait]
    impl Job for Scripted {
        const KIND: &'static str = "scripted";

        async fn execute(&self) -> std::result::Result<JobOutcome, JobError> {
            match self {
                Scripted::Succeed => Ok(JobOutcome::Success),
                Scripted::Fail => Ok(JobOutcome::Failure),
                Scripted::Error => Err(JobError::execution("boom")),
                Scripted::Panic => panic!("job blew up"),
                Scripted::Unsure => Ok(JobOutcome::Indeterminate),
                Scripted::Sleep { ms } => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    Ok(JobOutcome::Success)
                }
            }
        }
    }

    fn worker() -> (Arc<dyn JobStore>, WorkerLoop) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let mut registry = JobRegistry::new();
        registry.register::<Scripted>();
        let worker = WorkerLoop::new(
            "test-worker",
            store.clone(),
            Arc::new(registry),
            &WorkerConfig::default(),
        );
        (store, worker)
    }

    fn enqueue(store: &Arc<dyn JobStore>, job: Scripted) -> JobRecord {
        store.insert(NewJob::from_job(&job).unwrap()).unwrap()
    }

    fn status(store: &Arc<dyn JobStore>, job: &JobRecord) -> JobStatus {
        store.get(&job.id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn every_outcome_maps_to_its_transition() {
        let (store, worker) = worker();
        let ok = enqueue(&store, Scripted::Succeed);
        let fail = enqueue(&store, Scripted::Fail);
        let err = enqueue(&store, Scripted::Error);
        let panicked = enqueue(&store, Scripted::Panic);
        let unsure = enqueue(&store, Scripted::Unsure);

        let report = worker.run_cycle().await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                listed: 5,
                acquired: 5,
                contended: 0,
                succeeded: 1,
                failed: 3,
                indeterminate: 1,
            }
        );
        assert_eq!(status(&store, &ok), JobStatus::Succeeded);
        assert_eq!(status(&store, &fail), JobStatus::Failed);
        assert_eq!(status(&store, &err), JobStatus::Failed);
        assert_eq!(status(&store, &panicked), JobStatus::Failed);
        assert_eq!(status(&store, &unsure), JobStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_kind_fails_the_job_not_the_loop() {
        let (store, worker) = worker();
        let orphan = store
            .insert(NewJob::new("resize_image", json!({ "w": 10 })))
            .unwrap();
        let ok = enqueue(&store, Scripted::Succeed);

        let report = worker.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(status(&store, &orphan), JobStatus::Failed);
        assert_eq!(status(&store, &ok), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_cycle() {
        let (_store, worker) = worker();
        assert_eq!(worker.run_cycle().await.unwrap(), CycleReport::default());
    }

    #[tokio::test]
    async fn batch_limit_bounds_a_cycle() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let mut registry = JobRegistry::new();
        registry.register::<Scripted>();
        let config = WorkerConfig {
            batch_limit: 2,
            ..WorkerConfig::default()
        };
        let worker = WorkerLoop::new("small", store.clone(), Arc::new(registry), &config);
        for _ in 0..5 {
            enqueue(&store, Scripted::Succeed);
        }

        assert_eq!(worker.run_cycle().await.unwrap().acquired, 2);
        assert_eq!(worker.run_cycles(3).await.unwrap().acquired, 3);
        assert!(store
            .list_ids_by_status(JobStatus::Pending, 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (store, worker) = worker();
        enqueue(&store, Scripted::Succeed);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { worker.run(rx).await });
        // Let the worker drain the queue and go idle before stopping it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_claiming_mid_cycle() {
        let (store, worker) = worker();
        let a = enqueue(&store, Scripted::Succeed);
        let b = enqueue(&store, Scripted::Succeed);
        let (_tx, rx) = watch::channel(true);

        let report = worker.cycle(Some(&rx)).await.unwrap();
        assert_eq!(report.listed, 2);
        assert_eq!(report.acquired, 0);
        assert_eq!(status(&store, &a), JobStatus::Pending);
        assert_eq!(status(&store, &b), JobStatus::Pending);
    }

    /// Lists nothing for a moment, then fails like a lost database.
    struct BrokenStore;

    impl BrokenStore {
        fn fault<T>() -> Result<T> {
            Err(QueueError::StoreUnavailable(rusqlite::Error::InvalidQuery))
        }
    }

    impl JobStore for BrokenStore {
        fn insert(&self, _job: NewJob) -> Result<JobRecord> {
            Self::fault()
        }
        fn list_ids_by_status(&self, _: JobStatus, _: usize) -> Result<Vec<crate::JobId>> {
            std::thread::sleep(Duration::from_millis(100));
            Self::fault()
        }
        fn compare_and_set_status(
            &self,
            _: &crate::JobId,
            _: JobStatus,
            _: JobStatus,
        ) -> Result<Option<JobRecord>> {
            Self::fault()
        }
        fn list_by_status(&self, _: JobStatus) -> Result<Vec<JobRecord>> {
            Self::fault()
        }
        fn get(&self, _: &crate::JobId) -> Result<Option<JobRecord>> {
            Self::fault()
        }
    }

    /// A healthy worker holding a slow job next to one whose store breaks.
    fn pool_with_broken_sibling() -> (Arc<dyn JobStore>, JobRecord, WorkerPool) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let slow = enqueue(&store, Scripted::Sleep { ms: 300 });
        let mut registry = JobRegistry::new();
        registry.register::<Scripted>();

        let broken: Arc<dyn JobStore> = Arc::new(BrokenStore);
        let mut stores = vec![store.clone(), broken].into_iter();
        let pool = WorkerPool::new(2, Arc::new(registry), &WorkerConfig::default(), || {
            Ok(stores.next().unwrap())
        })
        .unwrap();
        (store, slow, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_fault_lets_sibling_finish_its_job() {
        let (store, slow, pool) = pool_with_broken_sibling();

        let err = pool.run_cycles(1).await.unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert_eq!(status(&store, &slow), JobStatus::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_fault_stops_polling_pool_without_stranding() {
        let (store, slow, pool) = pool_with_broken_sibling();
        let (_tx, rx) = watch::channel(false);

        let err = tokio::time::timeout(Duration::from_secs(5), pool.run(rx))
            .await
            .expect("pool should stop after a worker fault")
            .unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert_eq!(status(&store, &slow), JobStatus::Succeeded);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
