//! Entry point for running commands.

use std::sync::Arc;

use procengine_core::{EngineError, EngineResult};

use super::interceptor::{
    CommandContextInterceptor, CommandInterceptor, CommandRetryInterceptor,
    ContextSwitchInterceptor, ExecutionScopeRegistry, Invocation, LogInterceptor, Next,
};
use super::{Command, ErasedCommand};
use crate::engine::EngineServices;

/// Runs commands through a fixed interceptor chain. Cheap to clone.
#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
    chain: Arc<[Arc<dyn CommandInterceptor>]>,
}

impl CommandExecutor {
    pub fn new(services: Arc<EngineServices>, chain: Vec<Arc<dyn CommandInterceptor>>) -> Self {
        Self {
            services,
            chain: chain.into(),
        }
    }

    /// log → transient retry → execution scope switch → context.
    pub fn with_default_chain(
        services: Arc<EngineServices>,
        scopes: Arc<ExecutionScopeRegistry>,
    ) -> Self {
        let config = services.config();
        let chain: Vec<Arc<dyn CommandInterceptor>> = vec![
            Arc::new(LogInterceptor),
            Arc::new(CommandRetryInterceptor::new(
                config.command_retries,
                config.command_retry_backoff,
                Arc::clone(services.classifier()),
            )),
            Arc::new(ContextSwitchInterceptor::new(scopes)),
            Arc::new(CommandContextInterceptor),
        ];
        Self::new(services, chain)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn execute<C: Command>(&self, command: C) -> EngineResult<C::Output> {
        let erased: &dyn ErasedCommand = &command;
        let invocation = Invocation::new(erased, &self.services);
        let output = Next::new(&self.chain).run(&invocation)?;
        output.downcast::<C::Output>().map(|out| *out).map_err(|_| {
            EngineError::internal(format!(
                "command '{}' produced an unexpected output type",
                command.name()
            ))
        })
    }
}

impl core::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("engine", &self.services.config().name)
            .field("interceptors", &self.chain.len())
            .finish()
    }
}
