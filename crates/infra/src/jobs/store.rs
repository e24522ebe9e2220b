//! Job queries and writes on top of the unit of work.

use std::sync::Arc;

use procengine_core::EngineResult;

use super::types::{ByteArrayEntity, IncidentEntity, JobEntity};
use crate::command::CommandContext;
use crate::db::{Filter, Page};

/// Job storage abstraction.
///
/// Implemented for [`CommandContext`], so every read goes through the
/// context's identity map and every write is flushed with the rest of the
/// unit of work.
pub trait JobStore {
    /// Insert a job and wake acquisitions once it is committed.
    fn insert_job(&mut self, job: &JobEntity) -> EngineResult<()>;

    fn find_job(&mut self, job_id: &str) -> EngineResult<Option<JobEntity>>;

    /// Jobs that can be locked now, highest priority first, then by due date.
    fn find_acquirable_jobs(&mut self, max_jobs: usize) -> EngineResult<Vec<JobEntity>>;

    fn jobs_by_definition(&mut self, job_definition_id: &str) -> EngineResult<Vec<JobEntity>>;

    /// Delete a job together with its failure details and incidents.
    fn delete_job(&mut self, job: &JobEntity) -> EngineResult<()>;

    /// The open incident of a job, if any.
    fn incident_for_job(&mut self, job_id: &str) -> EngineResult<Option<IncidentEntity>>;

    fn incidents_by_definition(
        &mut self,
        job_definition_id: &str,
    ) -> EngineResult<Vec<IncidentEntity>>;
}

impl JobStore for CommandContext {
    fn insert_job(&mut self, job: &JobEntity) -> EngineResult<()> {
        self.insert(job)?;
        let services = Arc::clone(self.services());
        self.on_commit(move || services.notify_new_jobs());
        Ok(())
    }

    fn find_job(&mut self, job_id: &str) -> EngineResult<Option<JobEntity>> {
        self.find(job_id)
    }

    fn find_acquirable_jobs(&mut self, max_jobs: usize) -> EngineResult<Vec<JobEntity>> {
        let now = serde_json::to_value(self.now())?;
        let filter = Filter::eq("suspension_state", "active")
            .and(Filter::gt("retries", 0))
            .and(Filter::is_null("due_date").or(Filter::le("due_date", now.clone())))
            .and(
                Filter::is_null("lock_owner")
                    .or(Filter::is_null("lock_expiration_time"))
                    .or(Filter::le("lock_expiration_time", now)),
            );
        // no due date sorts first
        let page = Page::limit(max_jobs).desc("priority").asc("due_date");
        self.query_page(&filter, &page)
    }

    fn jobs_by_definition(&mut self, job_definition_id: &str) -> EngineResult<Vec<JobEntity>> {
        self.query(&Filter::eq("job_definition_id", job_definition_id))
    }

    fn delete_job(&mut self, job: &JobEntity) -> EngineResult<()> {
        if let Some(bytes_id) = &job.exception_byte_array_id
            && let Some(bytes) = self.find::<ByteArrayEntity>(bytes_id)?
        {
            self.delete(&bytes)?;
        }
        for incident in self.query::<IncidentEntity>(&Filter::eq("configuration", job.id.as_str()))? {
            self.delete(&incident)?;
        }
        self.delete(job)
    }

    fn incident_for_job(&mut self, job_id: &str) -> EngineResult<Option<IncidentEntity>> {
        Ok(self
            .query::<IncidentEntity>(&Filter::eq("configuration", job_id))?
            .into_iter()
            .next())
    }

    fn incidents_by_definition(
        &mut self,
        job_definition_id: &str,
    ) -> EngineResult<Vec<IncidentEntity>> {
        self.query(&Filter::eq("job_definition_id", job_definition_id))
    }
}
