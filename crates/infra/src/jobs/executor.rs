//! Job executor: acquisition threads feeding a bounded worker pool.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use procengine_core::{EngineError, EngineResult};

use super::acquisition::{
    AcquisitionHandle, AcquisitionRunnable, AcquisitionStrategyRegistry,
};
use super::cmd::{ExecuteJobCmd, FailedJobCmd, JobOutcome, UnlockJobCmd};
use super::pool::{ShutdownReport, ThreadPool};
use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;
use crate::engine::ProcessEngine;

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub jobs_acquired: u64,
    pub lock_conflicts: u64,
    pub executed: u64,
    pub failed: u64,
    pub lock_lost: u64,
    pub rejected: u64,
}

/// Hands acquired jobs to the pool, one task per job.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    pool: Arc<ThreadPool>,
    lock_owner: String,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobDispatcher {
    pub(crate) fn new(
        pool: Arc<ThreadPool>,
        lock_owner: impl Into<String>,
        stats: Arc<Mutex<ExecutorStats>>,
    ) -> Self {
        Self {
            pool,
            lock_owner: lock_owner.into(),
            stats,
        }
    }

    pub(crate) fn stats(&self) -> Arc<Mutex<ExecutorStats>> {
        Arc::clone(&self.stats)
    }

    /// Submit every job to the pool, blocking while it is saturated. Jobs a
    /// closed pool rejects are unlocked so another node can pick them up.
    /// Returns the number of rejected jobs.
    pub fn execute_jobs(&self, job_ids: Vec<String>, engine: &CommandExecutor) -> usize {
        let mut rejected = 0;
        for job_id in job_ids {
            let task = {
                let engine = engine.clone();
                let lock_owner = self.lock_owner.clone();
                let stats = Arc::clone(&self.stats);
                let job_id = job_id.clone();
                move || run_job(&engine, &job_id, &lock_owner, &stats)
            };

            if let Err(err) = self.pool.submit(job_id.as_str(), Box::new(task)) {
                warn!(job_id = %job_id, error = %err, "job rejected, unlocking");
                rejected += 1;
                self.record(|s| s.rejected += 1);
                if let Err(err) = engine.execute(UnlockJobCmd::new(job_id.as_str())) {
                    error!(job_id = %job_id, error = %err, "failed to unlock rejected job");
                }
            }
        }
        rejected
    }

    fn record(&self, update: impl FnOnce(&mut ExecutorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Message stored on the job: the handler's own message for business
/// failures, the engine error otherwise.
fn failure_message(err: &EngineError) -> String {
    match err {
        EngineError::Job(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

fn run_job(
    engine: &CommandExecutor,
    job_id: &str,
    lock_owner: &str,
    stats: &Mutex<ExecutorStats>,
) {
    let record = |update: fn(&mut ExecutorStats)| {
        update(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
    };

    match engine.execute(ExecuteJobCmd::new(job_id, lock_owner)) {
        Ok(JobOutcome::Executed) => record(|s| s.executed += 1),
        Ok(JobOutcome::LockLost) => record(|s| s.lock_lost += 1),
        Ok(outcome) => debug!(job_id, ?outcome, "job not executed"),
        Err(err) => {
            record(|s| s.failed += 1);
            warn!(job_id, error = %err, "job execution failed");
            let failed = FailedJobCmd::new(job_id, lock_owner, failure_message(&err), format!("{err:?}"));
            match engine.execute(failed) {
                Ok(Some(retries)) => debug!(job_id, retries, "job failure recorded"),
                Ok(None) => {}
                Err(err) => error!(job_id, error = %err, "failed to record job failure"),
            }
        }
    }
}

/// Background job executor.
///
/// Acquisition threads lock due jobs of the registered engines and dispatch
/// them to a shared worker pool. `stop` ends acquisition first, then waits
/// up to the configured shutdown timeout for running jobs.
pub struct JobExecutor {
    config: JobExecutorConfig,
    strategies: AcquisitionStrategyRegistry,
    engines: Vec<CommandExecutor>,
    pool: Option<Arc<ThreadPool>>,
    acquisitions: Vec<AcquisitionHandle>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(
        config: JobExecutorConfig,
        strategies: AcquisitionStrategyRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;
        // fail fast on an unknown strategy name
        strategies.create(&config.acquisition_strategy, &config)?;
        Ok(Self {
            config,
            strategies,
            engines: Vec::new(),
            pool: None,
            acquisitions: Vec::new(),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        })
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Add an engine to the acquisitions created from now on.
    pub fn register_engine(&mut self, engine: &ProcessEngine) {
        info!(executor = %self.config.name, engine = engine.name(), "engine registered");
        self.engines.push(engine.command_executor().clone());
    }

    pub fn is_active(&self) -> bool {
        self.pool.is_some()
    }

    /// Start the worker pool and the default acquisition.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.is_active() {
            return Ok(());
        }
        self.pool = Some(Arc::new(ThreadPool::from_config(&self.config)));
        let runnable = self.new_acquisition()?;
        let handle = self.schedule_acquisition(runnable)?;
        self.acquisitions.push(handle);
        info!(
            executor = %self.config.name,
            lock_owner = %self.config.lock_owner,
            engines = self.engines.len(),
            "job executor started"
        );
        Ok(())
    }

    fn dispatcher(&self) -> EngineResult<JobDispatcher> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| EngineError::validation("job executor is not started"))?;
        Ok(JobDispatcher::new(
            Arc::clone(pool),
            self.config.lock_owner.as_str(),
            Arc::clone(&self.stats),
        ))
    }

    /// An acquisition over all registered engines, not yet running.
    pub fn new_acquisition(&self) -> EngineResult<AcquisitionRunnable> {
        let strategy = self
            .strategies
            .create(&self.config.acquisition_strategy, &self.config)?;
        Ok(AcquisitionRunnable::new(
            format!("{}-acquisition-{}", self.config.name, self.acquisitions.len()),
            self.engines.clone(),
            self.config.clone(),
            strategy,
            self.dispatcher()?,
        ))
    }

    /// Run an acquisition on its own thread.
    pub fn schedule_acquisition(&self, runnable: AcquisitionRunnable) -> EngineResult<AcquisitionHandle> {
        AcquisitionHandle::spawn(runnable)
    }

    pub fn unschedule_acquisition(&self, handle: AcquisitionHandle) {
        handle.stop();
    }

    /// Dispatch already locked jobs directly. Returns the number of rejected
    /// jobs.
    pub fn execute_jobs(&self, job_ids: Vec<String>, engine: &CommandExecutor) -> EngineResult<usize> {
        Ok(self.dispatcher()?.execute_jobs(job_ids, engine))
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop acquisition, then wait for running jobs up to the shutdown
    /// timeout. Jobs still running afterwards keep their locks until they
    /// expire.
    pub fn stop(&mut self) -> ShutdownReport {
        for handle in &self.acquisitions {
            handle.request_stop();
        }
        // releases acquisitions blocked on a saturated pool
        if let Some(pool) = &self.pool {
            pool.close();
        }
        for handle in self.acquisitions.drain(..) {
            handle.stop();
        }
        let Some(pool) = self.pool.take() else {
            return ShutdownReport {
                terminated: true,
                ..Default::default()
            };
        };
        let report = pool.shutdown(self.config.shutdown_timeout);
        info!(
            executor = %self.config.name,
            terminated = report.terminated,
            stats = ?self.stats(),
            "job executor stopped"
        );
        report
    }
}

impl Drop for JobExecutor {
    fn drop(&mut self) {
        if self.is_active() {
            self.stop();
        }
    }
}

impl core::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("name", &self.config.name)
            .field("engines", &self.engines.len())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use procengine_core::{EntityKind, ManualClock};
    use serde_json::Value as JsonValue;

    use crate::command::{CommandContext, FnCommand};
    use crate::db::InMemoryStorage;
    use crate::jobs::cmd::AcquireJobsCmd;
    use crate::jobs::handler::FnJobHandler;
    use crate::jobs::store::JobStore;
    use crate::jobs::types::JobEntity;
    use procengine_core::Clock;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    fn create_jobs(engine: &ProcessEngine, job_type: &'static str, count: usize) {
        engine
            .command_executor()
            .execute(FnCommand::new("create-jobs", move |ctx: &mut CommandContext| {
                for _ in 0..count {
                    let job = JobEntity::new(job_type, JsonValue::Null, 3, ctx.now());
                    ctx.insert_job(&job)?;
                }
                Ok(())
            }))
            .unwrap();
    }

    fn config() -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_lock_owner("test-node")
            .with_wait_time(Duration::from_millis(20), Duration::from_millis(50))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    #[test]
    fn executes_committed_jobs() {
        let storage = Arc::new(InMemoryStorage::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let engine = ProcessEngine::builder()
            .storage(storage.clone())
            .job_handler(FnJobHandler::new("count", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build()
            .unwrap();

        let mut executor = JobExecutor::new(config(), AcquisitionStrategyRegistry::default()).unwrap();
        executor.register_engine(&engine);
        executor.start().unwrap();
        create_jobs(&engine, "count", 7);

        assert!(wait_until(|| storage.count(&EntityKind::Job) == 0));
        let report = executor.stop();

        assert!(report.terminated);
        assert_eq!(runs.load(Ordering::SeqCst), 7);
        assert_eq!(executor.stats().executed, 7);
    }

    #[test]
    fn failing_jobs_are_rescheduled_with_one_retry_less() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = ManualClock::default();
        let engine = ProcessEngine::builder()
            .storage(storage.clone())
            .clock(clock.clone())
            .job_handler(FnJobHandler::new("broken", |_, _| {
                Err(anyhow::anyhow!("downstream unavailable").into())
            }))
            .build()
            .unwrap();
        create_jobs(&engine, "broken", 1);

        let mut executor = JobExecutor::new(config(), AcquisitionStrategyRegistry::default()).unwrap();
        executor.register_engine(&engine);
        executor.start().unwrap();

        // the manual clock never reaches the new due date, so one attempt only
        assert!(wait_until(|| executor.stats().failed == 1));
        assert!(wait_until(|| {
            storage.rows(&EntityKind::Job)[0].data["retries"] == 2
        }));
        executor.stop();

        let row = &storage.rows(&EntityKind::Job)[0];
        assert_eq!(row.data["exception_message"], "downstream unavailable");
        assert!(row.data["lock_owner"].is_null());
        let due: chrono::DateTime<chrono::Utc> =
            serde_json::from_value(row.data["due_date"].clone()).unwrap();
        assert!(due > clock.now());
    }

    #[test]
    fn jobs_rejected_by_a_closed_pool_are_unlocked() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = ProcessEngine::builder()
            .storage(storage.clone())
            .job_handler(FnJobHandler::new("noop", |_, _| Ok(())))
            .build()
            .unwrap();
        create_jobs(&engine, "noop", 2);

        let mut executor = JobExecutor::new(config(), AcquisitionStrategyRegistry::default()).unwrap();
        executor.register_engine(&engine);
        // dispatch by hand, without an acquisition thread competing
        let pool = Arc::new(ThreadPool::from_config(executor.config()));
        pool.close();
        executor.pool = Some(pool);

        let acquired = engine
            .command_executor()
            .execute(AcquireJobsCmd::new("test-node", Duration::from_secs(60), 5))
            .unwrap();
        assert_eq!(acquired.job_ids().len(), 2);
        let rejected = executor
            .execute_jobs(acquired.job_ids(), engine.command_executor())
            .unwrap();

        assert_eq!(rejected, 2);
        assert!(
            storage
                .rows(&EntityKind::Job)
                .iter()
                .all(|row| row.data["lock_owner"].is_null())
        );
        assert!(executor.stop().terminated);
        assert_eq!(storage.count(&EntityKind::Job), 2);
        assert_eq!(executor.stats().rejected, 2);
    }

    #[test]
    fn saturated_pool_applies_backpressure_instead_of_dropping_jobs() {
        let storage = Arc::new(InMemoryStorage::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let engine = ProcessEngine::builder()
            .storage(storage.clone())
            .job_handler(FnJobHandler::new("slow", move |_, _| {
                thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .build()
            .unwrap();
        create_jobs(&engine, "slow", 6);

        let config = config().with_pool(1, 1, 1).with_max_jobs_per_acquisition(6);
        let mut executor = JobExecutor::new(config, AcquisitionStrategyRegistry::default()).unwrap();
        executor.register_engine(&engine);
        executor.start().unwrap();

        assert!(wait_until(|| storage.count(&EntityKind::Job) == 0));
        assert!(executor.stop().terminated);
        assert_eq!(runs.load(Ordering::SeqCst), 6);
        assert_eq!(executor.stats().rejected, 0);
    }

    #[test]
    fn unknown_strategies_are_refused() {
        let config = config().with_acquisition_strategy("lottery");
        assert!(JobExecutor::new(config, AcquisitionStrategyRegistry::default()).is_err());
    }

    #[test]
    fn stopping_an_idle_executor_terminates() {
        let mut executor = JobExecutor::new(config(), AcquisitionStrategyRegistry::default()).unwrap();
        assert!(executor.stop().terminated);
        executor.start().unwrap();
        assert!(executor.is_active());
        assert!(executor.stop().terminated);
        assert!(!executor.is_active());
    }
}
