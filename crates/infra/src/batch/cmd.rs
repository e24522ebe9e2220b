//! Batch management commands.

use serde::Serialize;
use tracing::info;

use procengine_core::{EngineError, EngineResult, SuspensionState};

use super::entity::{BatchEntity, HistoricBatchEntity};
use super::handler::{BatchJobConfiguration, new_batch_job};
use super::{BATCH_EXECUTION_JOB, BATCH_MONITOR_JOB, BATCH_SEED_JOB, delete_batch};
use crate::command::{Command, CommandContext};
use crate::jobs::cmd::set_job_definition_suspension;
use crate::jobs::store::JobStore;
use crate::jobs::types::JobDefinitionEntity;

/// Start a batch over `items`.
#[derive(Debug, Clone)]
pub struct CreateBatchCmd {
    pub batch_type: String,
    pub items: Vec<String>,
    pub tenant_id: Option<String>,
    /// Overrides the engine's `batch_jobs_per_seed`.
    pub batch_jobs_per_seed: Option<u32>,
    /// Overrides the engine's `invocations_per_batch_job`.
    pub invocations_per_batch_job: Option<u32>,
}

impl CreateBatchCmd {
    pub fn new(batch_type: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            batch_type: batch_type.into(),
            items,
            tenant_id: None,
            batch_jobs_per_seed: None,
            invocations_per_batch_job: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_sizes(mut self, jobs_per_seed: u32, invocations_per_job: u32) -> Self {
        self.batch_jobs_per_seed = Some(jobs_per_seed);
        self.invocations_per_batch_job = Some(invocations_per_job);
        self
    }
}

impl Command for CreateBatchCmd {
    type Output = BatchEntity;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<BatchEntity> {
        if self.items.is_empty() {
            return Err(EngineError::validation("a batch needs at least one item"));
        }
        let per_seed = self
            .batch_jobs_per_seed
            .unwrap_or(ctx.config().batch_jobs_per_seed);
        let per_job = self
            .invocations_per_batch_job
            .unwrap_or(ctx.config().invocations_per_batch_job);
        if per_seed == 0 || per_job == 0 {
            return Err(EngineError::validation("batch sizes must be positive"));
        }
        if ctx.services().batch_handlers().get(&self.batch_type).is_none() {
            return Err(EngineError::validation(format!(
                "no batch job handler registered for '{}'",
                self.batch_type
            )));
        }

        let definition = |job_type: &str| {
            JobDefinitionEntity::new(job_type)
                .with_configuration(self.batch_type.as_str())
                .with_tenant(self.tenant_id.clone())
        };
        let seed_definition = definition(BATCH_SEED_JOB);
        let monitor_definition = definition(BATCH_MONITOR_JOB);
        let execution_definition = definition(BATCH_EXECUTION_JOB);

        let mut batch = BatchEntity::new(
            self.batch_type.as_str(),
            self.items.clone(),
            per_seed,
            per_job,
            ctx.now(),
        );
        batch.tenant_id = self.tenant_id.clone();
        batch.seed_job_definition_id = seed_definition.id.clone();
        batch.monitor_job_definition_id = monitor_definition.id.clone();
        batch.batch_job_definition_id = execution_definition.id.clone();

        for definition in [&seed_definition, &monitor_definition, &execution_definition] {
            ctx.insert(definition)?;
        }
        ctx.insert(&batch)?;
        ctx.insert(&HistoricBatchEntity::from_batch(&batch))?;

        let seed = BatchJobConfiguration {
            batch_id: batch.id.clone(),
            items: Vec::new(),
        };
        let seed_job = new_batch_job(ctx, &seed_definition, &seed)?;
        ctx.insert_job(&seed_job)?;

        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            total_jobs = batch.total_jobs,
            "batch created"
        );
        Ok(batch)
    }
}

/// Progress of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStatistics {
    pub batch_id: String,
    pub total_jobs: u32,
    pub remaining_jobs: u32,
    pub completed_jobs: u32,
    /// Open execution jobs without retries left.
    pub failed_jobs: u32,
    pub suspended: bool,
}

pub(crate) fn batch_statistics(
    ctx: &mut CommandContext,
    batch: &BatchEntity,
) -> EngineResult<BatchStatistics> {
    let open = ctx.jobs_by_definition(&batch.batch_job_definition_id)?;
    let open_count = open.len() as u32;
    let failed = open.iter().filter(|job| job.retries == 0).count() as u32;
    Ok(BatchStatistics {
        batch_id: batch.id.clone(),
        total_jobs: batch.total_jobs,
        remaining_jobs: batch.jobs_to_create() + open_count,
        completed_jobs: batch.jobs_created.saturating_sub(open_count),
        failed_jobs: failed,
        suspended: batch.suspension_state.is_suspended(),
    })
}

#[derive(Debug, Clone)]
pub struct BatchStatisticsCmd {
    pub batch_id: String,
}

impl BatchStatisticsCmd {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
        }
    }
}

impl Command for BatchStatisticsCmd {
    type Output = BatchStatistics;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<BatchStatistics> {
        let batch: BatchEntity = ctx.get(&self.batch_id)?;
        batch_statistics(ctx, &batch)
    }
}

fn set_batch_suspension(
    ctx: &mut CommandContext,
    batch_id: &str,
    state: SuspensionState,
) -> EngineResult<()> {
    let mut batch: BatchEntity = ctx.get(batch_id)?;
    if batch.suspension_state == state {
        return Ok(());
    }
    batch.suspension_state = state;
    ctx.update(&batch)?;
    for definition_id in batch.job_definition_ids() {
        set_job_definition_suspension(ctx, definition_id, state, true)?;
    }
    info!(batch_id, ?state, "batch suspension state changed");
    Ok(())
}

/// Suspend a batch with its job definitions and jobs.
#[derive(Debug, Clone)]
pub struct SuspendBatchCmd {
    pub batch_id: String,
}

impl SuspendBatchCmd {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
        }
    }
}

impl Command for SuspendBatchCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        set_batch_suspension(ctx, &self.batch_id, SuspensionState::Suspended)
    }
}

#[derive(Debug, Clone)]
pub struct ActivateBatchCmd {
    pub batch_id: String,
}

impl ActivateBatchCmd {
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self {
            batch_id: batch_id.into(),
        }
    }
}

impl Command for ActivateBatchCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        set_batch_suspension(ctx, &self.batch_id, SuspensionState::Active)
    }
}

/// Delete a batch with its jobs and job definitions.
///
/// Refused while any of its jobs has an open incident, unless `cascade` is
/// set, in which case the incidents go too.
#[derive(Debug, Clone)]
pub struct DeleteBatchCmd {
    pub batch_id: String,
    pub cascade: bool,
}

impl DeleteBatchCmd {
    pub fn new(batch_id: impl Into<String>, cascade: bool) -> Self {
        Self {
            batch_id: batch_id.into(),
            cascade,
        }
    }
}

impl Command for DeleteBatchCmd {
    type Output = ();

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let batch: BatchEntity = ctx.get(&self.batch_id)?;
        if !self.cascade {
            let mut open_incidents = 0;
            for definition_id in batch.job_definition_ids() {
                open_incidents += ctx.incidents_by_definition(definition_id)?.len();
            }
            if open_incidents > 0 {
                return Err(EngineError::validation(format!(
                    "batch '{}' has {open_incidents} open incident(s); delete with cascade to remove them",
                    batch.id
                )));
            }
        }
        delete_batch(ctx, &batch)
    }
}
