//! Engine and job executor configuration.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use procengine_core::{EngineError, EngineResult, new_id};

use crate::jobs::types::RetryPolicy;

/// Job executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Written into the lock of every acquired job
    pub lock_owner: String,
    /// How long an acquired job stays locked
    pub lock_time: Duration,
    pub max_jobs_per_acquisition: usize,
    /// Base wait between acquisition cycles
    pub wait_time: Duration,
    /// Upper bound of the wait after empty cycles
    pub max_wait: Duration,
    pub wait_increase_factor: f64,
    /// Wait after lock conflicts; zero disables conflict backoff
    pub backoff_time: Duration,
    pub max_backoff: Duration,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_size: usize,
    /// Idle time after which workers above the core size exit
    pub keep_alive: Duration,
    /// How long shutdown waits for running jobs
    pub shutdown_timeout: Duration,
    /// Name of the acquisition strategy to use
    pub acquisition_strategy: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            lock_owner: new_id(),
            lock_time: Duration::from_secs(300),
            max_jobs_per_acquisition: 3,
            wait_time: Duration::from_secs(5),
            max_wait: Duration::from_secs(60),
            wait_increase_factor: 2.0,
            backoff_time: Duration::ZERO,
            max_backoff: Duration::ZERO,
            core_pool_size: 3,
            max_pool_size: 10,
            queue_size: 3,
            keep_alive: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(60),
            acquisition_strategy: "sequential".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration, max_wait: Duration) -> Self {
        self.wait_time = wait;
        self.max_wait = max_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration, max_backoff: Duration) -> Self {
        self.backoff_time = backoff;
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_pool(mut self, core: usize, max: usize, queue_size: usize) -> Self {
        self.core_pool_size = core;
        self.max_pool_size = max;
        self.queue_size = queue_size;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_acquisition_strategy(mut self, name: impl Into<String>) -> Self {
        self.acquisition_strategy = name.into();
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.lock_owner.trim().is_empty() {
            return Err(EngineError::validation("job executor lock owner must not be empty"));
        }
        if self.core_pool_size == 0 || self.max_pool_size < self.core_pool_size {
            return Err(EngineError::validation(format!(
                "invalid pool size: core {} / max {}",
                self.core_pool_size, self.max_pool_size
            )));
        }
        if self.queue_size == 0 {
            return Err(EngineError::validation("job executor queue size must be positive"));
        }
        if self.max_jobs_per_acquisition == 0 {
            return Err(EngineError::validation("max jobs per acquisition must be positive"));
        }
        if self.wait_increase_factor < 1.0 {
            return Err(EngineError::validation("wait increase factor must be at least 1"));
        }
        Ok(())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// Extra attempts of a retryable command after a transient failure
    pub command_retries: u32,
    pub command_retry_backoff: Duration,
    /// Backend error codes treated as transient
    pub transient_error_codes: Vec<String>,
    pub retry_on_optimistic_locking: bool,
    /// Retries of new jobs and the backoff between failed attempts
    pub job_retry_policy: RetryPolicy,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub batch_monitor_interval: Duration,
    pub job_executor: JobExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            command_retries: 3,
            command_retry_backoff: Duration::from_millis(10),
            transient_error_codes: vec!["40001".to_string()],
            retry_on_optimistic_locking: false,
            job_retry_policy: RetryPolicy::default(),
            batch_jobs_per_seed: 100,
            invocations_per_batch_job: 1,
            batch_monitor_interval: Duration::from_secs(30),
            job_executor: JobExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_command_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.command_retries = retries;
        self.command_retry_backoff = backoff;
        self
    }

    pub fn with_job_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.job_retry_policy = policy;
        self
    }

    pub fn with_batch_sizes(mut self, jobs_per_seed: u32, invocations_per_job: u32) -> Self {
        self.batch_jobs_per_seed = jobs_per_seed;
        self.invocations_per_batch_job = invocations_per_job;
        self
    }

    pub fn with_batch_monitor_interval(mut self, interval: Duration) -> Self {
        self.batch_monitor_interval = interval;
        self
    }

    pub fn with_job_executor(mut self, config: JobExecutorConfig) -> Self {
        self.job_executor = config;
        self
    }

    /// Retries a new job starts with.
    pub fn default_job_retries(&self) -> u32 {
        self.job_retry_policy.max_attempts
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.batch_jobs_per_seed == 0 || self.invocations_per_batch_job == 0 {
            return Err(EngineError::validation("batch sizes must be positive"));
        }
        self.job_executor.validate()
    }

    /// Defaults overridden by `PROCENGINE_*` environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let mut config = Self::default();
        let jx = &mut config.job_executor;

        if let Some(name) = lookup("PROCENGINE_NAME") {
            config.name = name;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_COMMAND_RETRIES")? {
            config.command_retries = v;
        }
        if let Some(codes) = lookup("PROCENGINE_TRANSIENT_ERROR_CODES") {
            config.transient_error_codes = codes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_RETRY_ON_OPTIMISTIC_LOCKING")? {
            config.retry_on_optimistic_locking = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_DEFAULT_JOB_RETRIES")? {
            config.job_retry_policy.max_attempts = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_BATCH_JOBS_PER_SEED")? {
            config.batch_jobs_per_seed = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_INVOCATIONS_PER_BATCH_JOB")? {
            config.invocations_per_batch_job = v;
        }
        if let Some(v) = parse_millis(&lookup, "PROCENGINE_BATCH_MONITOR_INTERVAL_MS")? {
            config.batch_monitor_interval = v;
        }

        if let Some(owner) = lookup("PROCENGINE_JOB_EXECUTOR_LOCK_OWNER") {
            jx.lock_owner = owner;
        }
        if let Some(v) = parse_millis(&lookup, "PROCENGINE_JOB_EXECUTOR_LOCK_TIME_MS")? {
            jx.lock_time = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_JOB_EXECUTOR_MAX_JOBS_PER_ACQUISITION")? {
            jx.max_jobs_per_acquisition = v;
        }
        if let Some(v) = parse_millis(&lookup, "PROCENGINE_JOB_EXECUTOR_WAIT_TIME_MS")? {
            jx.wait_time = v;
        }
        if let Some(v) = parse_millis(&lookup, "PROCENGINE_JOB_EXECUTOR_MAX_WAIT_MS")? {
            jx.max_wait = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_JOB_EXECUTOR_CORE_POOL_SIZE")? {
            jx.core_pool_size = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_JOB_EXECUTOR_MAX_POOL_SIZE")? {
            jx.max_pool_size = v;
        }
        if let Some(v) = parse(&lookup, "PROCENGINE_JOB_EXECUTOR_QUEUE_SIZE")? {
            jx.queue_size = v;
        }
        if let Some(v) = parse_millis(&lookup, "PROCENGINE_JOB_EXECUTOR_SHUTDOWN_TIMEOUT_MS")? {
            jx.shutdown_timeout = v;
        }
        if let Some(name) = lookup("PROCENGINE_JOB_EXECUTOR_ACQUISITION_STRATEGY") {
            jx.acquisition_strategy = name;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> EngineResult<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| EngineError::validation(format!("{key}: cannot parse '{raw}'")))
        })
        .transpose()
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> EngineResult<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_job_retries(), 3);
        assert_eq!(config.job_executor.acquisition_strategy, "sequential");
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PROCENGINE_NAME", "node-a"),
            ("PROCENGINE_COMMAND_RETRIES", "5"),
            ("PROCENGINE_TRANSIENT_ERROR_CODES", "40001, 40P01"),
            ("PROCENGINE_JOB_EXECUTOR_QUEUE_SIZE", "8"),
            ("PROCENGINE_JOB_EXECUTOR_LOCK_TIME_MS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.name, "node-a");
        assert_eq!(config.command_retries, 5);
        assert_eq!(config.transient_error_codes, vec!["40001", "40P01"]);
        assert_eq!(config.job_executor.queue_size, 8);
        assert_eq!(config.job_executor.lock_time, Duration::from_millis(1500));
    }

    #[test]
    fn unparsable_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("PROCENGINE_COMMAND_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn invalid_pool_sizes_are_rejected() {
        let config = JobExecutorConfig::default().with_pool(4, 2, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "name": "from-file",
            "job_executor": { "max_jobs_per_acquisition": 7 }
        }))
        .unwrap();

        assert_eq!(config.name, "from-file");
        assert_eq!(config.job_executor.max_jobs_per_acquisition, 7);
        assert_eq!(config.command_retries, 3);
    }
}
