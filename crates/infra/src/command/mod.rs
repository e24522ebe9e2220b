//! Commands and the pipeline that runs them.
//!
//! Every operation against the engine is a [`Command`]. The
//! [`CommandExecutor`] passes it through an ordered interceptor chain whose
//! last link opens a [`CommandContext`], runs the command and closes the
//! context (flush + commit, or rollback on error).

use std::any::Any;

use procengine_core::{DeploymentId, EngineResult};

pub mod context;
pub mod executor;
pub mod interceptor;

pub use context::{
    CommandContext, OptimisticLockingListener, OptimisticLockingResult, SessionResource,
};
pub use executor::CommandExecutor;
pub use interceptor::{
    CommandContextInterceptor, CommandInterceptor, CommandRetryInterceptor,
    ContextSwitchInterceptor, ExecutionScope, ExecutionScopeRegistry, Invocation,
    LogInterceptor, Next, current_deployment,
};

/// Type-erased command result passed along the interceptor chain.
pub type ErasedOutput = Box<dyn Any + Send>;

/// A unit of work executed within one command context.
pub trait Command: Send + Sync {
    type Output: Send + 'static;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;

    /// Whether the whole command may be re-run in a fresh context after a
    /// transient storage failure.
    fn is_retryable(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Deployment whose execution scope the command must run in.
    fn target_deployment(&self) -> Option<DeploymentId> {
        None
    }
}

/// A command built from a closure.
pub struct FnCommand<F> {
    name: String,
    retryable: bool,
    body: F,
}

impl<F, T> FnCommand<F>
where
    F: Fn(&mut CommandContext) -> EngineResult<T> + Send + Sync,
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            retryable: false,
            body,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl<F, T> Command for FnCommand<F>
where
    F: Fn(&mut CommandContext) -> EngineResult<T> + Send + Sync,
    T: Send + 'static,
{
    type Output = T;

    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<T> {
        (self.body)(ctx)
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Object-safe view of a command used inside the chain.
pub(crate) trait ErasedCommand: Send + Sync {
    fn execute_erased(&self, ctx: &mut CommandContext) -> EngineResult<ErasedOutput>;
    fn allows_retry(&self) -> bool;
    fn command_name(&self) -> &str;
    fn deployment(&self) -> Option<DeploymentId>;
}

impl<C: Command> ErasedCommand for C {
    fn execute_erased(&self, ctx: &mut CommandContext) -> EngineResult<ErasedOutput> {
        Ok(Box::new(self.execute(ctx)?))
    }

    fn allows_retry(&self) -> bool {
        self.is_retryable()
    }

    fn command_name(&self) -> &str {
        self.name()
    }

    fn deployment(&self) -> Option<DeploymentId> {
        self.target_deployment()
    }
}
