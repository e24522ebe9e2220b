//! Job handlers keyed by job type.

use std::collections::HashMap;
use std::sync::Arc;

use procengine_core::EngineResult;

use super::types::JobEntity;
use crate::command::CommandContext;

/// Application code behind one job type.
///
/// Runs inside the job's own command context; everything it writes through
/// `ctx` commits together with the deletion of the job. Business failures
/// are returned as `EngineError::Job` (any `anyhow::Error` converts).
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()>;
}

/// A job handler built from a closure.
pub struct FnJobHandler<F> {
    job_type: String,
    body: F,
}

impl<F> FnJobHandler<F>
where
    F: Fn(&JobEntity, &mut CommandContext) -> EngineResult<()> + Send + Sync,
{
    pub fn new(job_type: impl Into<String>, body: F) -> Self {
        Self {
            job_type: job_type.into(),
            body,
        }
    }
}

impl<F> JobHandler for FnJobHandler<F>
where
    F: Fn(&JobEntity, &mut CommandContext) -> EngineResult<()> + Send + Sync,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn execute(&self, job: &JobEntity, ctx: &mut CommandContext) -> EngineResult<()> {
        (self.body)(job, ctx)
    }
}

#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type replaces
    /// the earlier one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type().to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl core::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
