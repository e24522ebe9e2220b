//! Job scheduler: persisted jobs, acquisition, execution and failure handling.
//!
//! ## Design
//!
//! - Jobs are rows like any other entity and change only through commands
//! - Acquisition locks due jobs with an optimistic update; a node that loses
//!   the race simply does not get the job
//! - Locked jobs run on a bounded pool, each in its own command context
//! - Failures decrement retries and reschedule; at zero an incident is raised
//!
//! ## Components
//!
//! - `JobEntity`, `JobDefinitionEntity`, `IncidentEntity`: persisted state
//! - `JobStore`: job queries and writes on the command context
//! - `JobHandler`: application code per job type
//! - `JobExecutor`: acquisition threads plus the worker pool

pub mod acquisition;
pub mod cmd;
pub mod executor;
pub mod handler;
pub mod pool;
pub mod store;
pub mod types;

pub use acquisition::{
    AcquisitionHandle, AcquisitionReport, AcquisitionRunnable, AcquisitionSignal,
    AcquisitionStrategy, AcquisitionStrategyRegistry, BackoffAcquisitionStrategy,
    FixedAcquisitionStrategy,
};
pub use cmd::{
    AcquireJobsCmd, AcquiredJobs, ActivateJobDefinitionCmd, ExecuteJobCmd, FailedJobCmd,
    JobOutcome, SetJobRetriesCmd, SuspendJobDefinitionCmd, UnlockJobCmd,
};
pub use executor::{ExecutorStats, JobDispatcher, JobExecutor};
pub use handler::{FnJobHandler, JobHandler, JobHandlerRegistry};
pub use pool::{Rejected, ShutdownReport, ThreadPool};
pub use store::JobStore;
pub use types::{
    BackoffStrategy, ByteArrayEntity, FAILED_JOB_INCIDENT, IncidentEntity, JobDefinitionEntity,
    JobEntity, MAX_EXCEPTION_MESSAGE_LENGTH, RetryPolicy, truncate_message,
};
