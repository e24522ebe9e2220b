//! Batch job handlers: the application side (`BatchJobHandler`) and the
//! three built-in job handlers driving a batch (seed, execution, monitor).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use procengine_core::{EngineError, EngineResult};

use super::entity::BatchEntity;
use super::{BATCH_EXECUTION_JOB, BATCH_MONITOR_JOB, BATCH_SEED_JOB, delete_batch, remaining_jobs};
use crate::command::CommandContext;
use crate::jobs::cmd::chrono_duration;
use crate::jobs::handler::{JobHandler, JobHandlerRegistry};
use crate::jobs::store::JobStore;
use crate::jobs::types::{JobDefinitionEntity, JobEntity};

/// Application code behind one batch type, run once per execution job with
/// that job's slice of items.
pub trait BatchJobHandler: Send + Sync {
    fn batch_type(&self) -> &str;

    fn execute(
        &self,
        batch: &BatchEntity,
        items: &[String],
        ctx: &mut CommandContext,
    ) -> EngineResult<()>;
}

pub struct FnBatchJobHandler<F> {
    batch_type: String,
    body: F,
}

impl<F> FnBatchJobHandler<F>
where
    F: Fn(&BatchEntity, &[String], &mut CommandContext) -> EngineResult<()> + Send + Sync,
{
    pub fn new(batch_type: impl Into<String>, body: F) -> Self {
        Self {
            batch_type: batch_type.into(),
            body,
        }
    }
}

impl<F> BatchJobHandler for FnBatchJobHandler<F>
where
    F: Fn(&BatchEntity, &[String], &mut CommandContext) -> EngineResult<()> + Send + Sync,
{
    fn batch_type(&self) -> &str {
        &self.batch_type
    }

    fn execute(
        &self,
        batch: &BatchEntity,
        items: &[String],
        ctx: &mut CommandContext,
    ) -> EngineResult<()> {
        (self.body)(batch, items, ctx)
    }
}

#[derive(Clone, Default)]
pub struct BatchJobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn BatchJobHandler>>,
}

impl BatchJobHandlerRegistry {
    pub fn register(&mut self, handler: Arc<dyn BatchJobHandler>) {
        self.handlers.insert(handler.batch_type().to_string(), handler);
    }

    pub fn get(&self, batch_type: &str) -> Option<&Arc<dyn BatchJobHandler>> {
        self.handlers.get(batch_type)
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl core::fmt::Debug for BatchJobHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchJobHandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Handler configuration of seed, execution and monitor jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobConfiguration {
    pub batch_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
}

impl BatchJobConfiguration {
    fn of(job: &JobEntity) -> EngineResult<Self> {
        Ok(serde_json::from_value(job.handler_configuration.clone())?)
    }
}

pub(crate) fn new_batch_job(
    ctx: &mut CommandContext,
    definition: &JobDefinitionEntity,
    configuration: &BatchJobConfiguration,
) -> EngineResult<JobEntity> {
    let retries = ctx.config().default_job_retries();
    let job = JobEntity::new(
        definition.job_type.as_str(),
        serde_json::to_value(configuration)?,
        retries,
        ctx.now(),
    )
    .with_job_definition(definition);
    Ok(job)
}

/// Register the seed, execution and monitor job handlers.
pub fn register_batch_job_handlers(registry: &mut JobHandlerRegistry) {
    registry.register(Arc::new(SeedJobHandler));
    registry.register(Arc::new(ExecutionJobHandler));
    registry.register(Arc::new(MonitorJobHandler));
}

/// Creates the next round of execution jobs, then either the next seed job
/// or, once every execution job exists, the monitor job.
struct SeedJobHandler;

impl JobHandler for SeedJobHandler {
    fn job_type(&self) -> &str {
        BATCH_SEED_JOB
    }

    fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        let config = BatchJobConfiguration::of(job)?;
        let Some(mut batch) = ctx.find::<BatchEntity>(&config.batch_id)? else {
            warn!(batch_id = %config.batch_id, "seed job of a deleted batch");
            return Ok(());
        };

        let execution_definition: JobDefinitionEntity = ctx.get(&batch.batch_job_definition_id)?;
        let count = batch.batch_jobs_per_seed.min(batch.jobs_to_create());
        for index in batch.jobs_created..batch.jobs_created + count {
            let slice = BatchJobConfiguration {
                batch_id: batch.id.clone(),
                items: batch.items_for_job(index).to_vec(),
            };
            let execution_job = new_batch_job(ctx, &execution_definition, &slice)?;
            ctx.insert_job(&execution_job)?;
        }
        batch.jobs_created += count;
        ctx.update(&batch)?;
        debug!(
            batch_id = %batch.id,
            created = count,
            jobs_created = batch.jobs_created,
            total_jobs = batch.total_jobs,
            "batch seeded"
        );

        let next = BatchJobConfiguration {
            batch_id: batch.id.clone(),
            items: Vec::new(),
        };
        let next_definition_id = if batch.is_seeding_complete() {
            &batch.monitor_job_definition_id
        } else {
            &batch.seed_job_definition_id
        };
        let next_definition: JobDefinitionEntity = ctx.get(next_definition_id)?;
        let next_job = new_batch_job(ctx, &next_definition, &next)?;
        ctx.insert_job(&next_job)
    }
}

/// Runs the batch type's handler over one slice of items.
struct ExecutionJobHandler;

impl JobHandler for ExecutionJobHandler {
    fn job_type(&self) -> &str {
        BATCH_EXECUTION_JOB
    }

    fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        let config = BatchJobConfiguration::of(job)?;
        let Some(batch) = ctx.find::<BatchEntity>(&config.batch_id)? else {
            warn!(batch_id = %config.batch_id, job_id = %job.id, "execution job of a deleted batch");
            return Ok(());
        };
        let handler = ctx
            .services()
            .batch_handlers()
            .get(&batch.batch_type)
            .cloned()
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "no batch job handler registered for '{}'",
                    batch.batch_type
                ))
            })?;
        handler.execute(&batch, &config.items, ctx)
    }
}

/// Waits for the execution jobs to finish, then completes the batch.
struct MonitorJobHandler;

impl JobHandler for MonitorJobHandler {
    fn job_type(&self) -> &str {
        BATCH_MONITOR_JOB
    }

    fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        let config = BatchJobConfiguration::of(job)?;
        let Some(batch) = ctx.find::<BatchEntity>(&config.batch_id)? else {
            return Ok(());
        };

        let remaining = remaining_jobs(ctx, &batch)?;
        if remaining > 0 {
            let definition: JobDefinitionEntity = ctx.get(&batch.monitor_job_definition_id)?;
            let due = ctx.now() + chrono_duration(ctx.config().batch_monitor_interval)?;
            let next = new_batch_job(ctx, &definition, &config)?.with_due_date(due);
            debug!(batch_id = %batch.id, remaining, "batch still running");
            return ctx.insert_job(&next);
        }

        info!(batch_id = %batch.id, batch_type = %batch.batch_type, "batch completed");
        delete_batch(ctx, &batch)
    }
}
