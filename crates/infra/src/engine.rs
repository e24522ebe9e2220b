//! Engine assembly: shared services and the process engine facade.

use std::sync::{Arc, Mutex, PoisonError, mpsc};

use tracing::info;

use procengine_core::{Clock, DeploymentId, EngineResult, SystemClock};

use crate::batch::{BatchJobHandler, BatchJobHandlerRegistry, register_batch_job_handlers};
use crate::command::{CommandExecutor, ExecutionScope, ExecutionScopeRegistry};
use crate::config::EngineConfig;
use crate::db::{InMemoryStorage, SqlStateClassifier, Storage, TransientErrorClassifier};
use crate::jobs::acquisition::AcquisitionSignal;
use crate::jobs::handler::{JobHandler, JobHandlerRegistry};

/// Everything a command context needs, shared by all contexts of one engine.
pub struct EngineServices {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    classifier: Arc<dyn TransientErrorClassifier>,
    job_handlers: JobHandlerRegistry,
    batch_handlers: BatchJobHandlerRegistry,
    job_hints: Mutex<Vec<mpsc::Sender<AcquisitionSignal>>>,
}

impl EngineServices {
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Arc<dyn TransientErrorClassifier> {
        &self.classifier
    }

    pub fn job_handlers(&self) -> &JobHandlerRegistry {
        &self.job_handlers
    }

    pub fn batch_handlers(&self) -> &BatchJobHandlerRegistry {
        &self.batch_handlers
    }

    /// Wake acquisitions subscribed to this engine, e.g. after new jobs
    /// were committed.
    pub fn notify_new_jobs(&self) {
        let mut hints = self.job_hints.lock().unwrap_or_else(PoisonError::into_inner);
        hints.retain(|tx| tx.send(AcquisitionSignal::Hint).is_ok());
    }

    pub(crate) fn subscribe_job_hints(&self, tx: mpsc::Sender<AcquisitionSignal>) {
        self.job_hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
    }
}

impl core::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EngineServices")
            .field("name", &self.config.name)
            .field("clock", &self.clock)
            .field("job_handlers", &self.job_handlers)
            .finish_non_exhaustive()
    }
}

/// A configured engine: services plus the command executor running against
/// them.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    scopes: Arc<ExecutionScopeRegistry>,
    command_executor: CommandExecutor,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.services.config().name
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        self.services.config()
    }

    pub fn command_executor(&self) -> &CommandExecutor {
        &self.command_executor
    }

    pub fn register_execution_scope(&self, deployment: DeploymentId, scope: Arc<dyn ExecutionScope>) {
        self.scopes.register(deployment, scope);
    }

    pub fn unregister_execution_scope(&self, deployment: &DeploymentId) {
        self.scopes.unregister(deployment);
    }
}

#[derive(Default)]
pub struct ProcessEngineBuilder {
    storage: Option<Arc<dyn Storage>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<EngineConfig>,
    classifier: Option<Arc<dyn TransientErrorClassifier>>,
    job_handlers: JobHandlerRegistry,
    batch_handlers: BatchJobHandlerRegistry,
}

impl ProcessEngineBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the classifier built from the configured error codes.
    pub fn classifier(mut self, classifier: Arc<dyn TransientErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn job_handler(mut self, handler: impl JobHandler + 'static) -> Self {
        self.job_handlers.register(Arc::new(handler));
        self
    }

    pub fn batch_handler(mut self, handler: impl BatchJobHandler + 'static) -> Self {
        self.batch_handlers.register(Arc::new(handler));
        self
    }

    pub fn build(self) -> EngineResult<ProcessEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let classifier = self.classifier.unwrap_or_else(|| {
            Arc::new(
                SqlStateClassifier::new(config.transient_error_codes.iter().cloned())
                    .with_optimistic_locking_retries(config.retry_on_optimistic_locking),
            )
        });
        let mut job_handlers = self.job_handlers;
        register_batch_job_handlers(&mut job_handlers);

        let services = Arc::new(EngineServices {
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(InMemoryStorage::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            classifier,
            job_handlers,
            batch_handlers: self.batch_handlers,
            job_hints: Mutex::new(Vec::new()),
            config,
        });
        let scopes = Arc::new(ExecutionScopeRegistry::new());
        let command_executor = CommandExecutor::with_default_chain(services.clone(), scopes.clone());

        info!(
            engine = %services.config().name,
            job_handlers = ?services.job_handlers().types(),
            batch_handlers = ?services.batch_handlers().types(),
            "process engine built"
        );
        Ok(ProcessEngine {
            services,
            scopes,
            command_executor,
        })
    }
}
