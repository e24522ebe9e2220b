//! Job, job definition, incident and retry policy types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use procengine_core::{DbEntity, EntityKind, EntityRef, SuspensionState, new_id};

/// Incident type raised when a job runs out of retries.
pub const FAILED_JOB_INCIDENT: &str = "failedJob";

/// Longest exception message stored on a job or incident.
pub const MAX_EXCEPTION_MESSAGE_LENGTH: usize = 666;

/// A persisted unit of deferred work.
///
/// Lifecycle: created, due once `due_date <= now`, locked by an acquisition,
/// then deleted on success, rescheduled on failure with retries left, or
/// left in place behind an incident once retries reach zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: String,
    /// Handler type used to look up the `JobHandler`.
    pub job_type: String,
    pub handler_configuration: JsonValue,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries: u32,
    pub exception_message: Option<String>,
    /// Id of the `ByteArrayEntity` holding the failure details.
    pub exception_byte_array_id: Option<String>,
    pub job_definition_id: Option<String>,
    pub tenant_id: Option<String>,
    pub priority: i64,
    pub suspension_state: SuspensionState,
    pub deployment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobEntity {
    pub fn new(
        job_type: impl Into<String>,
        handler_configuration: JsonValue,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            job_type: job_type.into(),
            handler_configuration,
            due_date: None,
            lock_owner: None,
            lock_expiration_time: None,
            retries,
            exception_message: None,
            exception_byte_array_id: None,
            job_definition_id: None,
            tenant_id: None,
            priority: 0,
            suspension_state: SuspensionState::Active,
            deployment_id: None,
            created_at: now,
        }
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_job_definition(mut self, definition: &JobDefinitionEntity) -> Self {
        self.job_definition_id = Some(definition.id.clone());
        self.suspension_state = definition.suspension_state;
        if let Some(priority) = definition.overriding_priority {
            self.priority = priority;
        }
        if self.tenant_id.is_none() {
            self.tenant_id = definition.tenant_id.clone();
        }
        if self.deployment_id.is_none() {
            self.deployment_id = definition.deployment_id.clone();
        }
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_deployment(mut self, deployment_id: impl Into<String>) -> Self {
        self.deployment_id = Some(deployment_id.into());
        self
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// A lock is valid while its expiration time lies in the future.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lock_owner.as_deref() == Some(owner) && self.is_locked_at(now)
    }

    /// Due, unlocked (or lock expired), with retries left and not suspended.
    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_due_at(now)
            && !self.is_locked_at(now)
            && self.retries > 0
            && !self.suspension_state.is_suspended()
    }

    pub fn lock(&mut self, owner: &str, until: DateTime<Utc>) {
        self.lock_owner = Some(owner.to_string());
        self.lock_expiration_time = Some(until);
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}

impl DbEntity for JobEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::Job
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<EntityRef> {
        let mut refs = Vec::new();
        if let Some(id) = &self.job_definition_id {
            refs.push(EntityRef::new(EntityKind::JobDefinition, id.clone()));
        }
        if let Some(id) = &self.exception_byte_array_id {
            refs.push(EntityRef::new(EntityKind::ByteArray, id.clone()));
        }
        refs
    }
}

/// Template for a class of jobs, independently suspendable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinitionEntity {
    pub id: String,
    pub job_type: String,
    pub job_configuration: Option<String>,
    pub suspension_state: SuspensionState,
    pub overriding_priority: Option<i64>,
    pub tenant_id: Option<String>,
    pub deployment_id: Option<String>,
}

impl JobDefinitionEntity {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            job_type: job_type.into(),
            job_configuration: None,
            suspension_state: SuspensionState::Active,
            overriding_priority: None,
            tenant_id: None,
            deployment_id: None,
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.job_configuration = Some(configuration.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

impl DbEntity for JobDefinitionEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::JobDefinition
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Record of a job that ran out of retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEntity {
    pub id: String,
    pub incident_type: String,
    pub incident_timestamp: DateTime<Utc>,
    /// Id of the failed job.
    pub configuration: String,
    pub message: Option<String>,
    pub job_definition_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl IncidentEntity {
    pub fn failed_job(job: &JobEntity, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            incident_type: FAILED_JOB_INCIDENT.to_string(),
            incident_timestamp: now,
            configuration: job.id.clone(),
            message: job.exception_message.clone(),
            job_definition_id: job.job_definition_id.clone(),
            tenant_id: job.tenant_id.clone(),
        }
    }
}

impl DbEntity for IncidentEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::Incident
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(EntityKind::Job, self.configuration.clone())]
    }
}

/// Binary payload, used for the failure details of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByteArrayEntity {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ByteArrayEntity {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            bytes,
        }
    }
}

impl DbEntity for ByteArrayEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::ByteArray
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Cut a failure message to the stored maximum, on a char boundary.
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_EXCEPTION_MESSAGE_LENGTH).collect()
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry configuration for failed jobs.
///
/// `max_attempts` is the retry count a new job starts with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the given (1-indexed) retry. Never shorter than 1ms, so a
    /// rescheduled job is always due strictly after its failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis(((delay_ms + jitter).max(1.0)) as u64)
    }

    /// Delay after a failure left `retries_left` retries.
    pub fn delay_for_remaining(&self, retries_left: u32) -> Duration {
        self.delay_for_attempt(self.max_attempts.saturating_sub(retries_left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_remaining(2), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_grows_by_the_base_delay() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 4,
            "base_delay": { "secs": 2, "nanos": 0 },
            "max_delay": { "secs": 5, "nanos": 0 },
            "strategy": "linear",
            "jitter": 0.0,
        }))
        .unwrap();

        assert_eq!(policy.strategy, BackoffStrategy::Linear);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        // one retry used out of four
        assert_eq!(policy.delay_for_remaining(3), Duration::from_secs(2));
    }

    #[test]
    fn zero_delay_is_raised_to_one_millisecond() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
    }

    #[test]
    fn acquirable_requires_due_unlocked_retries_and_active() {
        let mut job = JobEntity::new("noop", JsonValue::Null, 3, now());
        assert!(job.is_acquirable_at(now()));

        job.due_date = Some(now() + chrono::Duration::seconds(5));
        assert!(!job.is_acquirable_at(now()));
        job.due_date = None;

        job.lock("owner-a", now() + chrono::Duration::minutes(5));
        assert!(!job.is_acquirable_at(now()));
        assert!(job.is_locked_by("owner-a", now()));
        assert!(job.is_acquirable_at(now() + chrono::Duration::minutes(6)));
        job.unlock();

        job.retries = 0;
        assert!(!job.is_acquirable_at(now()));
        job.retries = 1;

        job.suspension_state = SuspensionState::Suspended;
        assert!(!job.is_acquirable_at(now()));
    }

    #[test]
    fn jobs_inherit_definition_settings() {
        let mut definition = JobDefinitionEntity::new("batch-execution-job").with_tenant(Some("t1".into()));
        definition.overriding_priority = Some(50);
        definition.suspension_state = SuspensionState::Suspended;

        let job = JobEntity::new("batch-execution-job", JsonValue::Null, 3, now()).with_job_definition(&definition);

        assert_eq!(job.job_definition_id.as_deref(), Some(definition.id.as_str()));
        assert_eq!(job.priority, 50);
        assert_eq!(job.tenant_id.as_deref(), Some("t1"));
        assert!(job.suspension_state.is_suspended());
    }

    #[test]
    fn messages_are_truncated_on_char_boundaries() {
        let long = "é".repeat(MAX_EXCEPTION_MESSAGE_LENGTH + 10);
        assert_eq!(truncate_message(&long).chars().count(), MAX_EXCEPTION_MESSAGE_LENGTH);
        assert_eq!(truncate_message("short"), "short");
    }
}
