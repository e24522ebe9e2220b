//! Batches: bulk work split into jobs.
//!
//! A batch owns three job definitions. A seed job creates execution jobs a
//! round at a time and re-seeds until every execution job exists, then hands
//! over to a monitor job. The monitor re-schedules itself until no execution
//! job is left and finally deletes the batch, leaving its history behind.

pub mod cmd;
pub mod entity;
pub mod handler;

pub use cmd::{
    ActivateBatchCmd, BatchStatistics, BatchStatisticsCmd, CreateBatchCmd, DeleteBatchCmd,
    SuspendBatchCmd,
};
pub use entity::{BatchEntity, HistoricBatchEntity};
pub use handler::{
    BatchJobConfiguration, BatchJobHandler, BatchJobHandlerRegistry, FnBatchJobHandler,
    register_batch_job_handlers,
};

use procengine_core::EngineResult;

use crate::command::CommandContext;
use crate::jobs::store::JobStore;
use crate::jobs::types::JobDefinitionEntity;

pub const BATCH_SEED_JOB: &str = "batch-seed-job";
pub const BATCH_EXECUTION_JOB: &str = "batch-execution-job";
pub const BATCH_MONITOR_JOB: &str = "batch-monitor-job";

pub(crate) fn remaining_jobs(ctx: &mut CommandContext, batch: &BatchEntity) -> EngineResult<u32> {
    Ok(cmd::batch_statistics(ctx, batch)?.remaining_jobs)
}

/// Delete a batch, its job definitions and every job (with incidents) they
/// own, and close its history.
pub(crate) fn delete_batch(ctx: &mut CommandContext, batch: &BatchEntity) -> EngineResult<()> {
    for definition_id in batch.job_definition_ids() {
        for job in ctx.jobs_by_definition(definition_id)? {
            ctx.delete_job(&job)?;
        }
        if let Some(definition) = ctx.find::<JobDefinitionEntity>(definition_id)? {
            ctx.delete(&definition)?;
        }
    }
    ctx.delete(batch)?;

    if let Some(mut historic) = ctx.find::<HistoricBatchEntity>(&batch.id)? {
        historic.end_time = Some(ctx.now());
        ctx.update(&historic)?;
    }
    Ok(())
}
