//! The unit of work of one command invocation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, trace, warn};

use procengine_core::{DbEntity, EngineError, EngineResult, EntityKind, StorageError};

use super::Command;
use crate::config::EngineConfig;
use crate::db::{
    ConflictResolution, DbOperation, EntityCache, Filter, FlushSummary, Page, calculate_flush,
};
use crate::engine::EngineServices;

/// Answer of an optimistic-locking listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticLockingResult {
    /// Skip the failed operation; the rest of the flush goes ahead.
    Ignore,
    /// Abort the flush.
    Throw,
}

/// Consulted when a flushed operation fails with a concurrent modification.
pub trait OptimisticLockingListener: Send {
    /// Kind this listener is interested in; `None` means every kind.
    fn entity_kind(&self) -> Option<EntityKind> {
        None
    }

    fn failed_operation(&mut self, operation: &DbOperation) -> OptimisticLockingResult;
}

/// A resource scoped to one context, released when the context ends.
pub trait SessionResource: Send {
    fn name(&self) -> &str;

    fn close(&mut self);
}

type Callback = Box<dyn FnOnce() + Send>;

/// Per-invocation unit of work.
///
/// Holds the identity map of loaded and modified entities, pending bulk
/// statements, listeners and scoped resources. Nothing reaches storage before
/// [`CommandContext::close`], which orders every pending operation and
/// applies them as one batch.
pub struct CommandContext {
    services: Arc<EngineServices>,
    cache: EntityCache,
    bulk: Vec<DbOperation>,
    locking_listeners: Vec<Box<dyn OptimisticLockingListener>>,
    commit_listeners: Vec<Callback>,
    rollback_listeners: Vec<Callback>,
    resources: Vec<Box<dyn SessionResource>>,
    closed: bool,
}

impl CommandContext {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            services,
            cache: EntityCache::new(),
            bulk: Vec::new(),
            locking_listeners: Vec::new(),
            commit_listeners: Vec::new(),
            rollback_listeners: Vec::new(),
            resources: Vec::new(),
            closed: false,
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        self.services.config()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock().now()
    }

    /// Look up an entity: the cache first, then storage. Loaded rows are
    /// registered, so later lookups return the same state.
    pub fn find<E: DbEntity>(&mut self, id: &str) -> EngineResult<Option<E>> {
        let kind = E::entity_kind();
        if let Some(entry) = self.cache.get(&kind, id) {
            if entry.state.is_deleted() {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_value(entry.value.clone())?));
        }

        let Some(row) = self.services.storage().find(&kind, id)? else {
            return Ok(None);
        };
        let entity: E = serde_json::from_value(row.data.clone())?;
        self.cache
            .put_loaded(kind, id, row.data, row.revision, entity.references());
        Ok(Some(entity))
    }

    pub fn get<E: DbEntity>(&mut self, id: &str) -> EngineResult<E> {
        self.find(id)?
            .ok_or_else(|| EngineError::not_found(E::entity_kind().name(), id))
    }

    /// Entities of kind `E` matching `filter`, ordered by id.
    ///
    /// Storage rows are merged with the cache: a cached instance wins over
    /// the stored row, entities deleted in this context are hidden and
    /// entities inserted in this context are included.
    pub fn query<E: DbEntity>(&mut self, filter: &Filter) -> EngineResult<Vec<E>> {
        let kind = E::entity_kind();
        for row in self.services.storage().query(&kind, filter)? {
            if self.cache.get(&kind, &row.id).is_some() {
                continue;
            }
            let entity: E = serde_json::from_value(row.data.clone())?;
            self.cache
                .put_loaded(kind.clone(), &row.id, row.data, row.revision, entity.references());
        }

        self.cache
            .entries_of(&kind)
            .filter(|entry| !entry.state.is_deleted() && filter.matches(&entry.value))
            .map(|entry| Ok(serde_json::from_value(entry.value.clone())?))
            .collect()
    }

    /// At most `page.limit` entities of kind `E` matching `filter`, in page
    /// order.
    ///
    /// Storage does the selection; only the returned rows are registered.
    /// Entries of this context win over stored rows as in [`query`](Self::query),
    /// so an entity changed here is judged by its cached state.
    pub fn query_page<E: DbEntity>(&mut self, filter: &Filter, page: &Page) -> EngineResult<Vec<E>> {
        let kind = E::entity_kind();
        let rows = self.services.storage().query_page(&kind, filter, page)?;

        let mut candidates: Vec<(String, JsonValue, Option<u32>)> = Vec::new();
        for row in rows {
            match self.cache.get(&kind, &row.id) {
                Some(entry) if entry.state.is_deleted() || !filter.matches(&entry.value) => {}
                Some(entry) => candidates.push((row.id, entry.value.clone(), None)),
                None => candidates.push((row.id, row.data, Some(row.revision))),
            }
        }
        for entry in self.cache.entries_of(&kind) {
            let pending_only = !candidates.iter().any(|(id, _, _)| *id == entry.id);
            if pending_only && !entry.state.is_deleted() && filter.matches(&entry.value) {
                candidates.push((entry.id.clone(), entry.value.clone(), None));
            }
        }

        candidates.sort_by(|a, b| page.compare((a.0.as_str(), &a.1), (b.0.as_str(), &b.1)));
        if let Some(limit) = page.limit {
            candidates.truncate(limit);
        }

        let mut entities = Vec::with_capacity(candidates.len());
        for (id, value, stored_revision) in candidates {
            let entity: E = serde_json::from_value(value.clone())?;
            if let Some(revision) = stored_revision {
                self.cache
                    .put_loaded(kind.clone(), &id, value, revision, entity.references());
            }
            entities.push(entity);
        }
        Ok(entities)
    }

    /// Number of entities held by this unit of work.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Put an entity loaded elsewhere into the cache. Registering the same
    /// id twice keeps the first instance.
    pub fn register<E: DbEntity>(&mut self, entity: &E, revision: u32) -> EngineResult<()> {
        let value = serde_json::to_value(entity)?;
        self.cache
            .put_loaded(E::entity_kind(), entity.id(), value, revision, entity.references());
        Ok(())
    }

    pub fn insert<E: DbEntity>(&mut self, entity: &E) -> EngineResult<()> {
        let value = serde_json::to_value(entity)?;
        self.cache
            .put_inserted(E::entity_kind(), entity.id(), value, entity.references())
    }

    /// Record the new state of an entity. Entities not loaded in this context
    /// are merged at the revision currently stored.
    pub fn update<E: DbEntity>(&mut self, entity: &E) -> EngineResult<()> {
        let value = serde_json::to_value(entity)?;
        let kind = E::entity_kind();
        let services = &self.services;
        self.cache.put_updated(
            kind.clone(),
            entity.id(),
            value,
            entity.references(),
            || stored_revision(services, &kind, entity.id()),
        )
    }

    pub fn delete<E: DbEntity>(&mut self, entity: &E) -> EngineResult<()> {
        let kind = E::entity_kind();
        let services = &self.services;
        self.cache.mark_deleted(
            kind.clone(),
            entity.id(),
            entity.references(),
            || stored_revision(services, &kind, entity.id()),
        )
    }

    pub fn bulk_update(
        &mut self,
        kind: EntityKind,
        statement: &str,
        filter: Filter,
        assignments: Map<String, JsonValue>,
    ) {
        self.bulk
            .push(DbOperation::bulk_update(kind, statement, filter, assignments));
    }

    pub fn bulk_delete(&mut self, kind: EntityKind, statement: &str, filter: Filter) {
        self.bulk.push(DbOperation::bulk_delete(kind, statement, filter));
    }

    pub fn add_optimistic_locking_listener(
        &mut self,
        listener: impl OptimisticLockingListener + 'static,
    ) {
        self.locking_listeners.push(Box::new(listener));
    }

    /// Run `callback` after a successful flush.
    pub fn on_commit(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.commit_listeners.push(Box::new(callback));
    }

    /// Run `callback` when the context ends without committing.
    pub fn on_rollback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.rollback_listeners.push(Box::new(callback));
    }

    /// Scope a resource to this context. Resources are released in reverse
    /// order of acquisition on every exit path.
    pub fn acquire_resource(&mut self, resource: impl SessionResource + 'static) {
        self.resources.push(Box::new(resource));
    }

    /// Run a nested command inside this unit of work.
    pub fn execute<C: Command>(&mut self, command: &C) -> EngineResult<C::Output> {
        command.execute(self)
    }

    /// Run a nested command in its own context, committed independently of
    /// this one.
    pub fn execute_requires_new<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        let mut ctx = CommandContext::new(Arc::clone(&self.services));
        match command.execute(&mut ctx) {
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

    /// Pending operations in flush order.
    pub fn flush_plan(&self) -> Vec<DbOperation> {
        let mut ops = self.cache.flush_operations();
        ops.extend(self.bulk.iter().cloned());
        calculate_flush(ops)
    }

    /// Flush and commit. Storage failures roll the context back and are
    /// returned.
    pub fn close(mut self) -> EngineResult<FlushSummary> {
        self.closed = true;
        let operations = self.flush_plan();
        debug!(operations = operations.len(), "flushing command context");
        for op in &operations {
            trace!(operation = %op, "flush");
        }

        let storage = self.services.storage();
        let listeners = &mut self.locking_listeners;
        let result = storage.apply(&operations, &mut |op: &DbOperation, err: &StorageError| {
            resolve_conflict(listeners, op, err)
        });

        match result {
            Ok(summary) => {
                for callback in std::mem::take(&mut self.commit_listeners) {
                    callback();
                }
                self.finish();
                Ok(summary)
            }
            Err(err) => {
                debug!(error = %err, "flush failed, rolling back");
                self.rollback();
                Err(err.into())
            }
        }
    }

    /// Discard pending operations and fire rollback listeners.
    pub fn close_with_failure(mut self) {
        self.closed = true;
        self.rollback();
    }

    fn rollback(&mut self) {
        for callback in std::mem::take(&mut self.rollback_listeners) {
            callback();
        }
        self.commit_listeners.clear();
        self.finish();
    }

    fn finish(&mut self) {
        while let Some(mut resource) = self.resources.pop() {
            trace!(resource = resource.name(), "releasing session resource");
            resource.close();
        }
        self.cache.clear();
        self.bulk.clear();
        self.locking_listeners.clear();
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        if !self.closed {
            warn!("command context dropped without being closed");
            self.rollback();
        }
    }
}

fn stored_revision(services: &EngineServices, kind: &EntityKind, id: &str) -> EngineResult<u32> {
    services
        .storage()
        .find(kind, id)?
        .map(|row| row.revision)
        .ok_or_else(|| EngineError::not_found(kind.name(), id))
}

/// Only concurrent modifications may be ignored; the last matching listener
/// decides.
fn resolve_conflict(
    listeners: &mut [Box<dyn OptimisticLockingListener>],
    operation: &DbOperation,
    error: &StorageError,
) -> ConflictResolution {
    if !matches!(error, StorageError::ConcurrentModification { .. }) {
        return ConflictResolution::Abort;
    }

    let mut result = OptimisticLockingResult::Throw;
    for listener in listeners.iter_mut() {
        let interested = listener
            .entity_kind()
            .is_none_or(|kind| &kind == operation.kind());
        if interested {
            result = listener.failed_operation(operation);
        }
    }

    match result {
        OptimisticLockingResult::Ignore => ConflictResolution::Ignore,
        OptimisticLockingResult::Throw => ConflictResolution::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbOperationType, InMemoryStorage, Storage};
    use crate::engine::ProcessEngine;
    use crate::jobs::types::{JobDefinitionEntity, JobEntity};
    use crate::model::{DeploymentEntity, ProcessDefinitionEntity};
    use procengine_core::ManualClock;
    use std::sync::Mutex;

    fn engine() -> (ProcessEngine, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = ProcessEngine::builder()
            .storage(storage.clone())
            .clock(ManualClock::default())
            .build()
            .unwrap();
        (engine, storage)
    }

    fn context(engine: &ProcessEngine) -> CommandContext {
        CommandContext::new(engine.services().clone())
    }

    fn job(ctx: &CommandContext) -> JobEntity {
        JobEntity::new("noop", JsonValue::Null, 3, ctx.now())
    }

    #[test]
    fn nothing_reaches_storage_before_close() {
        let (engine, storage) = engine();
        let mut ctx = context(&engine);
        let job = job(&ctx);

        ctx.insert(&job).unwrap();
        assert_eq!(storage.count(&EntityKind::Job), 0);

        ctx.close().unwrap();
        assert_eq!(storage.count(&EntityKind::Job), 1);
    }

    #[test]
    fn find_returns_the_cached_state() {
        let (engine, _) = engine();
        let mut ctx = context(&engine);
        let mut job = job(&ctx);
        ctx.insert(&job).unwrap();
        ctx.close().unwrap();

        let mut ctx = context(&engine);
        let mut loaded: JobEntity = ctx.get(&job.id).unwrap();
        loaded.retries = 1;
        ctx.update(&loaded).unwrap();

        let again: JobEntity = ctx.get(&job.id).unwrap();
        assert_eq!(again.retries, 1);

        job.retries = 9;
        ctx.register(&job, 1).unwrap();
        let still: JobEntity = ctx.get(&job.id).unwrap();
        assert_eq!(still.retries, 1);
    }

    #[test]
    fn query_merges_storage_with_cache() {
        let (engine, _) = engine();
        let mut ctx = context(&engine);
        let stored_a = job(&ctx);
        let stored_b = job(&ctx);
        ctx.insert(&stored_a).unwrap();
        ctx.insert(&stored_b).unwrap();
        ctx.close().unwrap();

        let mut ctx = context(&engine);
        let fresh = job(&ctx);
        ctx.insert(&fresh).unwrap();
        ctx.delete(&stored_a).unwrap();

        let ids: Vec<String> = ctx
            .query::<JobEntity>(&Filter::eq("job_type", "noop"))
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();

        assert!(ids.contains(&stored_b.id));
        assert!(ids.contains(&fresh.id));
        assert!(!ids.contains(&stored_a.id));
    }

    #[test]
    fn flush_plan_inserts_parents_first() {
        let (engine, _) = engine();
        let mut ctx = context(&engine);
        let deployment = DeploymentEntity::new("d1", "invoice");
        let definition = ProcessDefinitionEntity::new("p1", "invoice", &deployment.id);

        ctx.insert(&definition).unwrap();
        ctx.insert(&deployment).unwrap();

        let plan: Vec<String> = ctx.flush_plan().iter().map(ToString::to_string).collect();
        assert_eq!(plan, vec!["INSERT Deployment[d1]", "INSERT ProcessDefinition[p1]"]);
        ctx.close().unwrap();
    }

    #[test]
    fn bulk_statements_are_flushed_with_entities() {
        let (engine, storage) = engine();
        let mut ctx = context(&engine);
        let definition = JobDefinitionEntity::new("noop");
        let job = job(&ctx).with_job_definition(&definition);
        ctx.insert(&definition).unwrap();
        ctx.insert(&job).unwrap();
        ctx.close().unwrap();

        let mut ctx = context(&engine);
        ctx.bulk_delete(
            EntityKind::Job,
            "deleteJobsByJobDefinitionId",
            Filter::eq("job_definition_id", definition.id.as_str()),
        );
        let plan = ctx.flush_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].op_type(), DbOperationType::Delete);
        ctx.close().unwrap();

        assert_eq!(storage.count(&EntityKind::Job), 0);
        assert_eq!(storage.count(&EntityKind::JobDefinition), 1);
    }

    #[derive(Clone)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }
    }

    struct NamedResource(&'static str, Recorder);

    impl SessionResource for NamedResource {
        fn name(&self) -> &str {
            self.0
        }

        fn close(&mut self) {
            self.1.push(format!("close {}", self.0));
        }
    }

    #[test]
    fn commit_fires_listeners_and_releases_resources_in_reverse() {
        let (engine, _) = engine();
        let recorder = Recorder(Arc::default());
        let mut ctx = context(&engine);

        ctx.acquire_resource(NamedResource("first", recorder.clone()));
        ctx.acquire_resource(NamedResource("second", recorder.clone()));
        let r = recorder.clone();
        ctx.on_commit(move || r.push("commit"));
        let r = recorder.clone();
        ctx.on_rollback(move || r.push("rollback"));
        ctx.close().unwrap();

        assert_eq!(recorder.events(), vec!["commit", "close second", "close first"]);
    }

    #[test]
    fn failed_flush_rolls_back() {
        let (engine, storage) = engine();
        let recorder = Recorder(Arc::default());
        let mut ctx = context(&engine);
        let job = job(&ctx);
        ctx.insert(&job).unwrap();
        ctx.acquire_resource(NamedResource("conn", recorder.clone()));
        let r = recorder.clone();
        ctx.on_rollback(move || r.push("rollback"));
        storage.inject_failure(StorageError::Unavailable("down".into()));

        let err = ctx.close().unwrap_err();

        assert!(err.is_infrastructure());
        assert_eq!(recorder.events(), vec!["rollback", "close conn"]);
        assert_eq!(storage.count(&EntityKind::Job), 0);
    }

    #[test]
    fn dropping_an_open_context_releases_resources() {
        let (engine, _) = engine();
        let recorder = Recorder(Arc::default());
        {
            let mut ctx = context(&engine);
            ctx.acquire_resource(NamedResource("conn", recorder.clone()));
        }
        assert_eq!(recorder.events(), vec!["close conn"]);
    }

    struct IgnoreJobs(Recorder);

    impl OptimisticLockingListener for IgnoreJobs {
        fn entity_kind(&self) -> Option<EntityKind> {
            Some(EntityKind::Job)
        }

        fn failed_operation(&mut self, operation: &DbOperation) -> OptimisticLockingResult {
            self.0.push(operation.to_string());
            OptimisticLockingResult::Ignore
        }
    }

    #[test]
    fn locking_listeners_can_ignore_conflicts() {
        let (engine, storage) = engine();
        let mut ctx = context(&engine);
        let job = job(&ctx);
        ctx.insert(&job).unwrap();
        ctx.close().unwrap();

        // a competing writer bumps the revision
        storage
            .apply(
                &[DbOperation::update(EntityKind::Job, job.id.as_str(), serde_json::to_value(&job).unwrap(), 1)],
                &mut |_, _| ConflictResolution::Abort,
            )
            .unwrap();

        let recorder = Recorder(Arc::default());
        let mut ctx = context(&engine);
        ctx.register(&job, 1).unwrap();
        let mut stale = job.clone();
        stale.retries = 0;
        ctx.update(&stale).unwrap();
        ctx.add_optimistic_locking_listener(IgnoreJobs(recorder.clone()));

        let summary = ctx.close().unwrap();

        assert_eq!(summary.ignored.len(), 1);
        assert_eq!(recorder.events(), vec![format!("UPDATE Job[{}]", job.id)]);
        let row = storage.find(&EntityKind::Job, &job.id).unwrap().unwrap();
        assert_eq!(row.data["retries"], 3);
    }

    #[test]
    fn conflicts_without_listener_abort_the_flush() {
        let (engine, storage) = engine();
        let mut ctx = context(&engine);
        let job = job(&ctx);
        ctx.register(&job, 4).unwrap();
        ctx.delete(&job).unwrap();

        let err = ctx.close().unwrap_err();
        assert!(matches!(
            err.storage_error(),
            Some(StorageError::ConcurrentModification { .. })
        ));
        assert_eq!(storage.count(&EntityKind::Job), 0);
    }

    #[test]
    fn requires_new_commits_independently() {
        let (engine, storage) = engine();
        let mut outer = context(&engine);
        let inner_job = job(&outer);
        let insert = crate::command::FnCommand::new("insert", move |ctx: &mut CommandContext| {
            ctx.insert(&inner_job)
        });

        outer.execute_requires_new(&insert).unwrap();
        assert_eq!(storage.count(&EntityKind::Job), 1);

        outer.close_with_failure();
        assert_eq!(storage.count(&EntityKind::Job), 1);
    }
}
