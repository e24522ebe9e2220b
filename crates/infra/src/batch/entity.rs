//! Batch rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procengine_core::{DbEntity, EntityKind, SuspensionState, new_id};

/// A long-running bulk operation split into execution jobs.
///
/// `configuration` holds the items the batch works on; execution job `n`
/// covers items `n * invocations_per_batch_job ..`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntity {
    pub id: String,
    pub batch_type: String,
    pub total_jobs: u32,
    pub jobs_created: u32,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub seed_job_definition_id: String,
    pub monitor_job_definition_id: String,
    pub batch_job_definition_id: String,
    pub configuration: Vec<String>,
    pub suspension_state: SuspensionState,
    pub tenant_id: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl BatchEntity {
    /// A batch with its job definition ids still unset.
    pub fn new(
        batch_type: impl Into<String>,
        items: Vec<String>,
        batch_jobs_per_seed: u32,
        invocations_per_batch_job: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let per_job = invocations_per_batch_job.max(1) as usize;
        Self {
            id: new_id(),
            batch_type: batch_type.into(),
            total_jobs: items.len().div_ceil(per_job) as u32,
            jobs_created: 0,
            batch_jobs_per_seed,
            invocations_per_batch_job,
            seed_job_definition_id: String::new(),
            monitor_job_definition_id: String::new(),
            batch_job_definition_id: String::new(),
            configuration: items,
            suspension_state: SuspensionState::Active,
            tenant_id: None,
            start_time: now,
        }
    }

    /// Execution jobs not created yet.
    pub fn jobs_to_create(&self) -> u32 {
        self.total_jobs.saturating_sub(self.jobs_created)
    }

    pub fn is_seeding_complete(&self) -> bool {
        self.jobs_created >= self.total_jobs
    }

    /// Items covered by the execution job with the given index.
    pub fn items_for_job(&self, index: u32) -> &[String] {
        let per_job = self.invocations_per_batch_job.max(1) as usize;
        let start = (index as usize * per_job).min(self.configuration.len());
        let end = (start + per_job).min(self.configuration.len());
        &self.configuration[start..end]
    }

    pub fn job_definition_ids(&self) -> [&str; 3] {
        [
            self.seed_job_definition_id.as_str(),
            self.monitor_job_definition_id.as_str(),
            self.batch_job_definition_id.as_str(),
        ]
    }
}

impl DbEntity for BatchEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::Batch
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// History of a batch; outlives the batch itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricBatchEntity {
    pub id: String,
    pub batch_type: String,
    pub total_jobs: u32,
    pub tenant_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl HistoricBatchEntity {
    pub fn from_batch(batch: &BatchEntity) -> Self {
        Self {
            id: batch.id.clone(),
            batch_type: batch.batch_type.clone(),
            total_jobs: batch.total_jobs,
            tenant_id: batch.tenant_id.clone(),
            start_time: batch.start_time,
            end_time: None,
        }
    }
}

impl DbEntity for HistoricBatchEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::HistoricBatch
    }

    fn id(&self) -> &str {
        &self.id
    }
}
