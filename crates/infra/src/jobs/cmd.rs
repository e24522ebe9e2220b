//! Commands of the job lifecycle: acquire, execute, fail, unlock, retry,
//! suspend.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, json};
use tracing::{debug, warn};

use procengine_core::{EngineError, EngineResult, EntityKind, SuspensionState};

use super::store::JobStore;
use super::types::{ByteArrayEntity, IncidentEntity, JobDefinitionEntity, truncate_message};
use crate::command::{Command, CommandContext, OptimisticLockingListener, OptimisticLockingResult};
use crate::db::{DbOperation, Filter};

pub(crate) fn chrono_duration(duration: Duration) -> EngineResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| EngineError::validation(format!("duration out of range: {duration:?}")))
}

/// Jobs locked by one acquisition.
///
/// The lost set is filled while the acquiring context flushes, so it is only
/// complete once the command has returned.
#[derive(Debug, Clone, Default)]
pub struct AcquiredJobs {
    selected: Vec<String>,
    lost: Arc<Mutex<BTreeSet<String>>>,
}

impl AcquiredJobs {
    /// Ids of jobs this acquisition holds the lock of, in acquisition order.
    pub fn job_ids(&self) -> Vec<String> {
        let lost = self.lost.lock().unwrap_or_else(PoisonError::into_inner);
        self.selected
            .iter()
            .filter(|id| !lost.contains(*id))
            .cloned()
            .collect()
    }

    /// Jobs whose lock went to a competing acquisition.
    pub fn lost_count(&self) -> usize {
        self.lost.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }
}

/// Records jobs whose lock update lost an optimistic race and lets the rest
/// of the flush proceed.
struct LostLockListener {
    lost: Arc<Mutex<BTreeSet<String>>>,
}

impl OptimisticLockingListener for LostLockListener {
    fn entity_kind(&self) -> Option<EntityKind> {
        Some(EntityKind::Job)
    }

    fn failed_operation(&mut self, operation: &DbOperation) -> OptimisticLockingResult {
        if let Some(id) = operation.entity_id() {
            debug!(job_id = id, "job locked by another acquisition");
            self.lost
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.to_string());
        }
        OptimisticLockingResult::Ignore
    }
}

/// Select due jobs and lock them for `lock_owner`.
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub lock_owner: String,
    pub lock_time: Duration,
    pub max_jobs: usize,
}

impl AcquireJobsCmd {
    pub fn new(lock_owner: impl Into<String>, lock_time: Duration, max_jobs: usize) -> Self {
        Self {
            lock_owner: lock_owner.into(),
            lock_time,
            max_jobs,
        }
    }
}

impl Command for AcquireJobsCmd {
    type Output = AcquiredJobs;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<AcquiredJobs> {
        let lock_until = ctx.now() + chrono_duration(self.lock_time)?;
        let mut acquired = AcquiredJobs::default();

        for mut job in ctx.find_acquirable_jobs(self.max_jobs)? {
            job.lock(&self.lock_owner, lock_until);
            ctx.update(&job)?;
            acquired.selected.push(job.id);
        }

        ctx.add_optimistic_locking_listener(LostLockListener {
            lost: Arc::clone(&acquired.lost),
        });
        Ok(acquired)
    }
}

/// Result of one job execution attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler ran and the job was deleted.
    Executed,
    /// The job no longer exists.
    NotFound,
    /// The lock expired or belongs to someone else; the job stays due.
    LockLost,
    /// The job was suspended after acquisition and has been unlocked.
    Suspended,
}

/// Run a locked job's handler and delete the job in the same flush.
#[derive(Debug, Clone)]
pub struct ExecuteJobCmd {
    pub job_id: String,
    pub lock_owner: String,
}

impl ExecuteJobCmd {
    pub fn new(job_id: impl Into<String>, lock_owner: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            lock_owner: lock_owner.into(),
        }
    }
}

impl Command for ExecuteJobCmd {
    type Output = JobOutcome;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<JobOutcome> {
        let Some(mut job) = ctx.find_job(&self.job_id)? else {
            debug!(job_id = %self.job_id, "job to execute no longer exists");
            return Ok(JobOutcome::NotFound);
        };

        if !job.is_locked_by(&self.lock_owner, ctx.now()) {
            debug!(
                job_id = %job.id,
                lock_owner = %self.lock_owner,
                current_owner = ?job.lock_owner,
                "job lock no longer held"
            );
            return Ok(JobOutcome::LockLost);
        }

        if job.suspension_state.is_suspended() {
            job.unlock();
            ctx.update(&job)?;
            return Ok(JobOutcome::Suspended);
        }

        let handler = ctx
            .services()
            .job_handlers()
            .get(&job.job_type)
            .cloned()
            .ok_or_else(|| {
                EngineError::validation(format!("no job handler registered for '{}'", job.job_type))
            })?;

        debug!(job_id = %job.id, job_type = %job.job_type, "executing job");
        handler.execute(&job, ctx)?;
        ctx.delete_job(&job)?;
        Ok(JobOutcome::Executed)
    }

    fn is_retryable(&self) -> bool {
        true
    }
}

/// Record a failed execution: one retry less, failure stored, lock released,
/// and either a new due date or an incident.
#[derive(Debug, Clone)]
pub struct FailedJobCmd {
    pub job_id: String,
    pub lock_owner: String,
    pub message: String,
    pub details: String,
}

impl FailedJobCmd {
    pub fn new(
        job_id: impl Into<String>,
        lock_owner: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            lock_owner: lock_owner.into(),
            message: message.into(),
            details: details.into(),
        }
    }
}

impl Command for FailedJobCmd {
    /// Retries left, or `None` when the failure was not recorded.
    type Output = Option<u32>;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Option<u32>> {
        let now = ctx.now();
        let Some(mut job) = ctx.find_job(&self.job_id)? else {
            return Ok(None);
        };
        if job.is_locked_at(now) && job.lock_owner.as_deref() != Some(self.lock_owner.as_str()) {
            warn!(
                job_id = %job.id,
                lock_owner = ?job.lock_owner,
                "job relocked by another owner, failure not recorded"
            );
            return Ok(None);
        }

        job.retries = job.retries.saturating_sub(1);
        job.exception_message = Some(truncate_message(&self.message));

        let details = self.details.clone().into_bytes();
        let existing = match &job.exception_byte_array_id {
            Some(id) => ctx.find::<ByteArrayEntity>(id)?,
            None => None,
        };
        match existing {
            Some(mut bytes) => {
                bytes.bytes = details;
                ctx.update(&bytes)?;
            }
            None => {
                let bytes = ByteArrayEntity::new("job.exceptionByteArray", details);
                ctx.insert(&bytes)?;
                job.exception_byte_array_id = Some(bytes.id);
            }
        }

        job.unlock();
        if job.retries > 0 {
            let policy = &ctx.config().job_retry_policy;
            let delay = chrono_duration(policy.delay_for_remaining(job.retries))?;
            job.due_date = Some(now + delay);
        } else {
            match ctx.incident_for_job(&job.id)? {
                Some(mut incident) => {
                    incident.message = job.exception_message.clone();
                    incident.incident_timestamp = now;
                    ctx.update(&incident)?;
                }
                None => {
                    let incident = IncidentEntity::failed_job(&job, now);
                    warn!(job_id = %job.id, incident_id = %incident.id, "job out of retries, incident created");
                    ctx.insert(&incident)?;
                }
            }
        }

        ctx.update(&job)?;
        Ok(Some(job.retries))
    }

    fn is_retryable(&self) -> bool {
        true
    }
}

/// Release a job's lock without executing it.
#[derive(Debug, Clone)]
pub struct UnlockJobCmd {
    pub job_id: String,
}

impl UnlockJobCmd {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}

impl Command for UnlockJobCmd {
    type Output = bool;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<bool> {
        let Some(mut job) = ctx.find_job(&self.job_id)? else {
            return Ok(false);
        };
        job.unlock();
        ctx.update(&job)?;
        Ok(true)
    }
}

/// Set the retries of a job; a positive value resolves its incident.
#[derive(Debug, Clone)]
pub struct SetJobRetriesCmd {
    pub job_id: String,
    pub retries: u32,
}

impl SetJobRetriesCmd {
    pub fn new(job_id: impl Into<String>, retries: u32) -> Self {
        Self {
            job_id: job_id.into(),
            retries,
        }
    }
}

impl Command for SetJobRetriesCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let mut job = ctx
            .find_job(&self.job_id)?
            .ok_or_else(|| EngineError::not_found("Job", self.job_id.as_str()))?;

        job.retries = self.retries;
        if self.retries > 0
            && let Some(incident) = ctx.incident_for_job(&job.id)?
        {
            debug!(job_id = %job.id, incident_id = %incident.id, "resolving incident");
            ctx.delete(&incident)?;
        }
        ctx.update(&job)
    }
}

/// Suspend or activate a job definition, optionally with its jobs.
pub(crate) fn set_job_definition_suspension(
    ctx: &mut CommandContext,
    job_definition_id: &str,
    state: SuspensionState,
    include_jobs: bool,
) -> EngineResult<()> {
    let mut definition: JobDefinitionEntity = ctx.get(job_definition_id)?;
    definition.suspension_state = state;
    ctx.update(&definition)?;

    if include_jobs {
        let mut assignments = Map::new();
        assignments.insert("suspension_state".to_string(), json!(state));
        ctx.bulk_update(
            EntityKind::Job,
            "updateJobSuspensionStateByJobDefinitionId",
            Filter::eq("job_definition_id", job_definition_id),
            assignments,
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SuspendJobDefinitionCmd {
    pub job_definition_id: String,
    pub include_jobs: bool,
}

impl SuspendJobDefinitionCmd {
    pub fn new(job_definition_id: impl Into<String>, include_jobs: bool) -> Self {
        Self {
            job_definition_id: job_definition_id.into(),
            include_jobs,
        }
    }
}

impl Command for SuspendJobDefinitionCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        set_job_definition_suspension(
            ctx,
            &self.job_definition_id,
            SuspensionState::Suspended,
            self.include_jobs,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ActivateJobDefinitionCmd {
    pub job_definition_id: String,
    pub include_jobs: bool,
}

impl ActivateJobDefinitionCmd {
    pub fn new(job_definition_id: impl Into<String>, include_jobs: bool) -> Self {
        Self {
            job_definition_id: job_definition_id.into(),
            include_jobs,
        }
    }
}

impl Command for ActivateJobDefinitionCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        set_job_definition_suspension(
            ctx,
            &self.job_definition_id,
            SuspensionState::Active,
            self.include_jobs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryStorage, Storage};
    use crate::engine::ProcessEngine;
    use crate::jobs::handler::FnJobHandler;
    use crate::jobs::types::{JobEntity, RetryPolicy};
    use crate::config::EngineConfig;
    use procengine_core::{Clock, ManualClock};
    use serde_json::Value as JsonValue;

    const OWNER: &str = "node-1";

    struct Fixture {
        engine: ProcessEngine,
        storage: Arc<InMemoryStorage>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(InMemoryStorage::new());
            let clock = ManualClock::default();
            let engine = ProcessEngine::builder()
                .storage(storage.clone())
                .clock(clock.clone())
                .config(EngineConfig::default().with_job_retry_policy(RetryPolicy::fixed(
                    3,
                    Duration::from_secs(30),
                )))
                .job_handler(FnJobHandler::new("ok", |_, _| Ok(())))
                .job_handler(FnJobHandler::new("fails", |_, _| {
                    Err(anyhow::anyhow!("remote system rejected the call").into())
                }))
                .build()
                .unwrap();
            Self {
                engine,
                storage,
                clock,
            }
        }

        fn run<C: Command>(&self, command: C) -> EngineResult<C::Output> {
            self.engine.command_executor().execute(command)
        }

        fn create_job(&self, job_type: &str, retries: u32) -> JobEntity {
            let job = JobEntity::new(job_type, JsonValue::Null, retries, self.clock.now());
            let created = job.clone();
            self.run(crate::command::FnCommand::new("create-job", move |ctx: &mut CommandContext| {
                ctx.insert_job(&job)
            }))
            .unwrap();
            created
        }

        fn job(&self, id: &str) -> Option<JobEntity> {
            self.storage
                .find(&EntityKind::Job, id)
                .unwrap()
                .map(|row| serde_json::from_value(row.data).unwrap())
        }
    }

    #[test]
    fn acquisition_locks_due_jobs() {
        let fx = Fixture::new();
        let job = fx.create_job("ok", 3);

        let acquired = fx
            .run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5))
            .unwrap();

        assert_eq!(acquired.job_ids(), vec![job.id.clone()]);
        let stored = fx.job(&job.id).unwrap();
        assert!(stored.is_locked_by(OWNER, fx.clock.now()));
        assert!(
            fx.run(AcquireJobsCmd::new("node-2", Duration::from_secs(60), 5))
                .unwrap()
                .job_ids()
                .is_empty()
        );
    }

    #[test]
    fn successful_execution_deletes_the_job() {
        let fx = Fixture::new();
        let job = fx.create_job("ok", 3);
        fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5)).unwrap();

        let outcome = fx.run(ExecuteJobCmd::new(&job.id, OWNER)).unwrap();

        assert_eq!(outcome, JobOutcome::Executed);
        assert!(fx.job(&job.id).is_none());
    }

    #[test]
    fn expired_or_foreign_locks_are_not_executed() {
        let fx = Fixture::new();
        let job = fx.create_job("ok", 3);
        fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5)).unwrap();

        assert_eq!(
            fx.run(ExecuteJobCmd::new(&job.id, "node-2")).unwrap(),
            JobOutcome::LockLost
        );
        fx.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(
            fx.run(ExecuteJobCmd::new(&job.id, OWNER)).unwrap(),
            JobOutcome::LockLost
        );
        assert!(fx.job(&job.id).is_some());
        assert_eq!(
            fx.run(ExecuteJobCmd::new("missing", OWNER)).unwrap(),
            JobOutcome::NotFound
        );
    }

    #[test]
    fn handler_failure_rolls_back_execution() {
        let fx = Fixture::new();
        let job = fx.create_job("fails", 3);
        fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5)).unwrap();

        let err = fx.run(ExecuteJobCmd::new(&job.id, OWNER)).unwrap_err();

        assert!(matches!(err, EngineError::Job(_)));
        assert_eq!(fx.job(&job.id).unwrap().retries, 3);
    }

    #[test]
    fn failure_with_retries_left_reschedules() {
        let fx = Fixture::new();
        let job = fx.create_job("fails", 3);
        fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5)).unwrap();
        let failed_at = fx.clock.now();

        let left = fx
            .run(FailedJobCmd::new(&job.id, OWNER, "remote system rejected the call", "trace"))
            .unwrap();

        assert_eq!(left, Some(2));
        let stored = fx.job(&job.id).unwrap();
        assert_eq!(stored.retries, 2);
        assert_eq!(stored.exception_message.as_deref(), Some("remote system rejected the call"));
        assert!(stored.exception_byte_array_id.is_some());
        assert!(stored.due_date.unwrap() > failed_at);
        assert!(stored.lock_owner.is_none());
        assert_eq!(fx.storage.count(&EntityKind::Incident), 0);
    }

    #[test]
    fn last_failure_creates_one_incident() {
        let fx = Fixture::new();
        let job = fx.create_job("fails", 1);

        fx.run(FailedJobCmd::new(&job.id, OWNER, "boom", "trace 1")).unwrap();
        let incidents = fx.storage.rows(&EntityKind::Incident);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].data["configuration"], job.id.as_str());
        assert_eq!(fx.job(&job.id).unwrap().retries, 0);

        // a second failure updates the open incident instead of adding one
        fx.run(FailedJobCmd::new(&job.id, OWNER, "boom again", "trace 2")).unwrap();
        let incidents = fx.storage.rows(&EntityKind::Incident);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].data["message"], "boom again");
        assert_eq!(fx.storage.count(&EntityKind::ByteArray), 1);
    }

    #[test]
    fn setting_retries_resolves_the_incident() {
        let fx = Fixture::new();
        let job = fx.create_job("fails", 1);
        fx.run(FailedJobCmd::new(&job.id, OWNER, "boom", "trace")).unwrap();
        assert!(fx.job(&job.id).unwrap().retries == 0);

        fx.run(SetJobRetriesCmd::new(&job.id, 2)).unwrap();

        assert_eq!(fx.job(&job.id).unwrap().retries, 2);
        assert_eq!(fx.storage.count(&EntityKind::Incident), 0);
        assert!(matches!(
            fx.run(SetJobRetriesCmd::new("missing", 1)),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn unlock_releases_the_lock() {
        let fx = Fixture::new();
        let job = fx.create_job("ok", 3);
        fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5)).unwrap();

        assert!(fx.run(UnlockJobCmd::new(&job.id)).unwrap());
        assert!(fx.job(&job.id).unwrap().lock_owner.is_none());
        assert!(!fx.run(UnlockJobCmd::new("missing")).unwrap());
    }

    #[test]
    fn suspended_definitions_hide_their_jobs_from_acquisition() {
        let fx = Fixture::new();
        let definition = JobDefinitionEntity::new("ok");
        let job = JobEntity::new("ok", JsonValue::Null, 3, fx.clock.now()).with_job_definition(&definition);
        let setup = (definition.clone(), job.clone());
        fx.run(crate::command::FnCommand::new("setup", move |ctx: &mut CommandContext| {
            ctx.insert(&setup.0)?;
            ctx.insert_job(&setup.1)
        }))
        .unwrap();

        fx.run(SuspendJobDefinitionCmd::new(&definition.id, true)).unwrap();
        assert!(fx.job(&job.id).unwrap().suspension_state.is_suspended());
        assert!(
            fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5))
                .unwrap()
                .job_ids()
                .is_empty()
        );

        fx.run(ActivateJobDefinitionCmd::new(&definition.id, true)).unwrap();
        assert_eq!(
            fx.run(AcquireJobsCmd::new(OWNER, Duration::from_secs(60), 5))
                .unwrap()
                .job_ids(),
            vec![job.id]
        );
    }
}
