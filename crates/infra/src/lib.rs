//! Engine runtime: persistence, the command pipeline and the job scheduler.
//!
//! Every state change runs as a [`Command`](command::Command) inside a
//! [`CommandContext`](command::CommandContext), which buffers writes and
//! flushes them in ownership order as one atomic batch. Jobs, incidents and
//! batches are ordinary entities driven by commands; the [`JobExecutor`]
//! acquires and runs due jobs on a bounded worker pool.

pub mod batch;
pub mod command;
pub mod config;
pub mod db;
pub mod engine;
pub mod jobs;
pub mod model;

pub use command::{Command, CommandContext, CommandExecutor, FnCommand};
pub use config::{EngineConfig, JobExecutorConfig};
pub use engine::{EngineServices, ProcessEngine, ProcessEngineBuilder};
pub use jobs::{JobExecutor, JobHandler, JobStore};
