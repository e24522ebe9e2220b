//! Interceptor chain around command execution.
//!
//! The chain is an ordered slice of interceptors composed once at engine
//! build time. Each interceptor receives the [`Invocation`] and a [`Next`]
//! handle over the remaining links; the last link
//! ([`CommandContextInterceptor`]) owns the transaction boundary.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, debug_span, error, warn};

use procengine_core::{DeploymentId, EngineError, EngineResult};

use super::{CommandContext, ErasedCommand, ErasedOutput};
use crate::db::TransientErrorClassifier;
use crate::engine::EngineServices;

/// One command call travelling down the chain.
pub struct Invocation<'a> {
    command: &'a dyn ErasedCommand,
    services: &'a Arc<EngineServices>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(command: &'a dyn ErasedCommand, services: &'a Arc<EngineServices>) -> Self {
        Self { command, services }
    }

    pub fn command_name(&self) -> &str {
        self.command.command_name()
    }

    pub fn is_retryable(&self) -> bool {
        self.command.allows_retry()
    }

    pub fn target_deployment(&self) -> Option<DeploymentId> {
        self.command.deployment()
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        self.services
    }

    /// Run the command against `ctx`.
    pub fn run_in(&self, ctx: &mut CommandContext) -> EngineResult<ErasedOutput> {
        self.command.execute_erased(ctx)
    }
}

/// A link of the chain.
pub trait CommandInterceptor: Send + Sync {
    fn intercept(&self, invocation: &Invocation<'_>, next: Next<'_>) -> EngineResult<ErasedOutput>;
}

/// The rest of the chain after the current interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn CommandInterceptor>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn CommandInterceptor>]) -> Self {
        Self { rest: chain }
    }

    pub fn run(self, invocation: &Invocation<'_>) -> EngineResult<ErasedOutput> {
        match self.rest.split_first() {
            Some((head, rest)) => head.intercept(invocation, Next { rest }),
            None => Err(EngineError::internal(format!(
                "interceptor chain ended before a context was opened for '{}'",
                invocation.command_name()
            ))),
        }
    }
}

/// Tracing span and start/finish events per command.
#[derive(Debug, Default)]
pub struct LogInterceptor;

impl CommandInterceptor for LogInterceptor {
    fn intercept(&self, invocation: &Invocation<'_>, next: Next<'_>) -> EngineResult<ErasedOutput> {
        let span = debug_span!("command", command = invocation.command_name());
        let _entered = span.enter();

        debug!("command started");
        let result = next.run(invocation);
        match &result {
            Ok(_) => debug!("command finished"),
            Err(err) if err.is_infrastructure() => error!(error = %err, "command failed"),
            Err(err) => debug!(error = %err, "command failed"),
        }
        result
    }
}

/// Re-runs retryable commands after transient storage failures, each time
/// in a fresh context.
#[derive(Debug)]
pub struct CommandRetryInterceptor {
    max_retries: u32,
    backoff: Duration,
    classifier: Arc<dyn TransientErrorClassifier>,
}

impl CommandRetryInterceptor {
    pub fn new(
        max_retries: u32,
        backoff: Duration,
        classifier: Arc<dyn TransientErrorClassifier>,
    ) -> Self {
        Self {
            max_retries,
            backoff,
            classifier,
        }
    }
}

impl CommandInterceptor for CommandRetryInterceptor {
    fn intercept(&self, invocation: &Invocation<'_>, next: Next<'_>) -> EngineResult<ErasedOutput> {
        if !invocation.is_retryable() {
            return next.run(invocation);
        }

        let mut retries = 0;
        loop {
            match next.run(invocation) {
                Err(err) if self.classifier.is_transient(&err) => {
                    if retries >= self.max_retries {
                        return Err(EngineError::TransientRetriesExhausted {
                            command: invocation.command_name().to_string(),
                            attempts: retries + 1,
                            source: Box::new(err),
                        });
                    }
                    retries += 1;
                    warn!(
                        command = invocation.command_name(),
                        retry = retries,
                        error = %err,
                        "transient failure, retrying command"
                    );
                    if !self.backoff.is_zero() {
                        thread::sleep(self.backoff * retries);
                    }
                }
                result => return result,
            }
        }
    }
}

/// Context a deployment's commands run in (class loader, tenant, security
/// principal and the like in an embedding application).
pub trait ExecutionScope: Send + Sync {
    fn enter(&self) {}

    fn exit(&self) {}
}

/// Execution scopes keyed by deployment.
#[derive(Default)]
pub struct ExecutionScopeRegistry {
    scopes: RwLock<HashMap<DeploymentId, Arc<dyn ExecutionScope>>>,
}

impl ExecutionScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, deployment: DeploymentId, scope: Arc<dyn ExecutionScope>) {
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(deployment, scope);
    }

    pub fn unregister(&self, deployment: &DeploymentId) -> Option<Arc<dyn ExecutionScope>> {
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(deployment)
    }

    pub fn get(&self, deployment: &DeploymentId) -> Option<Arc<dyn ExecutionScope>> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(deployment)
            .cloned()
    }
}

impl core::fmt::Debug for ExecutionScopeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let scopes = self.scopes.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ExecutionScopeRegistry")
            .field("deployments", &scopes.keys().collect::<Vec<_>>())
            .finish()
    }
}

thread_local! {
    static ACTIVE_SCOPES: RefCell<Vec<DeploymentId>> = const { RefCell::new(Vec::new()) };
}

/// Deployment whose execution scope is active on this thread.
pub fn current_deployment() -> Option<DeploymentId> {
    ACTIVE_SCOPES.with(|scopes| scopes.borrow().last().cloned())
}

struct ActiveScope {
    scope: Arc<dyn ExecutionScope>,
}

impl ActiveScope {
    fn enter(deployment: DeploymentId, scope: Arc<dyn ExecutionScope>) -> Self {
        scope.enter();
        ACTIVE_SCOPES.with(|scopes| scopes.borrow_mut().push(deployment));
        Self { scope }
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        ACTIVE_SCOPES.with(|scopes| scopes.borrow_mut().pop());
        self.scope.exit();
    }
}

/// Runs a command that targets a deployment inside that deployment's
/// execution scope.
pub struct ContextSwitchInterceptor {
    registry: Arc<ExecutionScopeRegistry>,
}

impl ContextSwitchInterceptor {
    pub fn new(registry: Arc<ExecutionScopeRegistry>) -> Self {
        Self { registry }
    }
}

impl CommandInterceptor for ContextSwitchInterceptor {
    fn intercept(&self, invocation: &Invocation<'_>, next: Next<'_>) -> EngineResult<ErasedOutput> {
        let Some(target) = invocation.target_deployment() else {
            return next.run(invocation);
        };
        if current_deployment().as_ref() == Some(&target) {
            return next.run(invocation);
        }
        let Some(scope) = self.registry.get(&target) else {
            return next.run(invocation);
        };

        debug!(deployment = %target, "switching execution scope");
        let _active = ActiveScope::enter(target, scope);
        next.run(invocation)
    }
}

/// Terminal link: one context, one transaction boundary.
#[derive(Debug, Default)]
pub struct CommandContextInterceptor;

impl CommandInterceptor for CommandContextInterceptor {
    fn intercept(&self, invocation: &Invocation<'_>, _next: Next<'_>) -> EngineResult<ErasedOutput> {
        let mut ctx = CommandContext::new(Arc::clone(invocation.services()));
        match invocation.run_in(&mut ctx) {
            Ok(output) => {
                ctx.close()?;
                Ok(output)
            }
            Err(err) => {
                ctx.close_with_failure();
                Err(err)
            }
        }
    }
}
