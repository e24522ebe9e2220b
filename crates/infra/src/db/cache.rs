//! Identity map of a unit of work.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as JsonValue;

use procengine_core::{EngineError, EngineResult, EntityKind, EntityRef};

use super::operation::DbOperation;

/// Lifecycle of an entity inside one command context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Inserted in this context.
    Transient,
    /// Loaded from storage.
    Persistent,
    /// Updated without having been loaded first.
    Merged,
    DeletedTransient,
    DeletedPersistent,
    DeletedMerged,
}

impl EntityState {
    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            EntityState::DeletedTransient | EntityState::DeletedPersistent | EntityState::DeletedMerged
        )
    }
}

#[derive(Debug, Clone)]
pub struct CachedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub state: EntityState,
    pub value: JsonValue,
    /// Value as loaded, for dirty checking of persistent entries.
    snapshot: Option<JsonValue>,
    /// Row revision the entry was read at; `None` for transient entries.
    pub revision: Option<u32>,
    pub references: Vec<EntityRef>,
}

impl CachedEntity {
    pub fn is_dirty(&self) -> bool {
        match self.state {
            EntityState::Persistent => self.snapshot.as_ref() != Some(&self.value),
            EntityState::Merged => true,
            _ => false,
        }
    }
}

/// Entities of one context, keyed by kind and id.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: HashMap<EntityKind, BTreeMap<String, CachedEntity>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: &EntityKind, id: &str) -> Option<&CachedEntity> {
        self.entries.get(kind).and_then(|table| table.get(id))
    }

    /// Cached entries of one kind, ordered by id.
    pub fn entries_of<'a>(&'a self, kind: &EntityKind) -> impl Iterator<Item = &'a CachedEntity> + 'a {
        self.entries.get(kind).into_iter().flat_map(BTreeMap::values)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put a loaded row into the cache. An already cached entry wins.
    pub fn put_loaded(
        &mut self,
        kind: EntityKind,
        id: &str,
        value: JsonValue,
        revision: u32,
        references: Vec<EntityRef>,
    ) -> &CachedEntity {
        self.entries
            .entry(kind.clone())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| CachedEntity {
                kind,
                id: id.to_string(),
                state: EntityState::Persistent,
                snapshot: Some(value.clone()),
                value,
                revision: Some(revision),
                references,
            })
    }

    pub fn put_inserted(
        &mut self,
        kind: EntityKind,
        id: &str,
        value: JsonValue,
        references: Vec<EntityRef>,
    ) -> EngineResult<()> {
        let table = self.entries.entry(kind.clone()).or_default();
        if let Some(existing) = table.get(id)
            && existing.state != EntityState::DeletedTransient
        {
            return Err(EngineError::validation(format!(
                "{kind} '{id}' is already part of this unit of work"
            )));
        }
        table.insert(
            id.to_string(),
            CachedEntity {
                kind,
                id: id.to_string(),
                state: EntityState::Transient,
                value,
                snapshot: None,
                revision: None,
                references,
            },
        );
        Ok(())
    }

    /// Record a new value for an entity. `revision` is only used when the
    /// entity was never cached, which makes it a merged entry.
    pub fn put_updated(
        &mut self,
        kind: EntityKind,
        id: &str,
        value: JsonValue,
        references: Vec<EntityRef>,
        revision: impl FnOnce() -> EngineResult<u32>,
    ) -> EngineResult<()> {
        let table = self.entries.entry(kind.clone()).or_default();
        match table.get_mut(id) {
            Some(entry) if entry.state.is_deleted() => Err(EngineError::validation(format!(
                "{kind} '{id}' was deleted in this unit of work"
            ))),
            Some(entry) => {
                entry.value = value;
                entry.references = references;
                Ok(())
            }
            None => {
                let revision = revision()?;
                table.insert(
                    id.to_string(),
                    CachedEntity {
                        kind,
                        id: id.to_string(),
                        state: EntityState::Merged,
                        value,
                        snapshot: None,
                        revision: Some(revision),
                        references,
                    },
                );
                Ok(())
            }
        }
    }

    /// Mark an entity deleted. Deleting twice is a no-op.
    pub fn mark_deleted(
        &mut self,
        kind: EntityKind,
        id: &str,
        references: Vec<EntityRef>,
        revision: impl FnOnce() -> EngineResult<u32>,
    ) -> EngineResult<()> {
        let table = self.entries.entry(kind.clone()).or_default();
        match table.get_mut(id) {
            Some(entry) => {
                entry.state = match entry.state {
                    EntityState::Transient => EntityState::DeletedTransient,
                    EntityState::Persistent => EntityState::DeletedPersistent,
                    EntityState::Merged => EntityState::DeletedMerged,
                    deleted => deleted,
                };
                Ok(())
            }
            None => {
                let revision = revision()?;
                table.insert(
                    id.to_string(),
                    CachedEntity {
                        kind,
                        id: id.to_string(),
                        state: EntityState::DeletedMerged,
                        value: JsonValue::Null,
                        snapshot: None,
                        revision: Some(revision),
                        references,
                    },
                );
                Ok(())
            }
        }
    }

    /// Pending entity operations in cache order (not yet flush-ordered).
    pub fn flush_operations(&self) -> Vec<DbOperation> {
        let mut ops = Vec::new();
        for table in self.entries.values() {
            for entry in table.values() {
                let revision = entry.revision.unwrap_or(1);
                match entry.state {
                    EntityState::Transient => ops.push(DbOperation::insert(
                        entry.kind.clone(),
                        entry.id.clone(),
                        entry.value.clone(),
                        entry.references.clone(),
                    )),
                    EntityState::Persistent | EntityState::Merged if entry.is_dirty() => {
                        ops.push(DbOperation::update(
                            entry.kind.clone(),
                            entry.id.clone(),
                            entry.value.clone(),
                            revision,
                        ))
                    }
                    EntityState::DeletedPersistent | EntityState::DeletedMerged => {
                        ops.push(DbOperation::delete(
                            entry.kind.clone(),
                            entry.id.clone(),
                            revision,
                            entry.references.clone(),
                        ))
                    }
                    _ => {}
                }
            }
        }
        ops
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::operation::DbOperationType;
    use serde_json::json;

    fn never() -> EngineResult<u32> {
        Err(EngineError::internal("revision lookup not expected"))
    }

    #[test]
    fn loading_twice_keeps_the_first_instance() {
        let mut cache = EntityCache::new();
        cache.put_loaded(EntityKind::Job, "j1", json!({"retries": 3}), 1, vec![]);
        cache.put_loaded(EntityKind::Job, "j1", json!({"retries": 9}), 4, vec![]);

        let entry = cache.get(&EntityKind::Job, "j1").unwrap();
        assert_eq!(entry.value["retries"], 3);
        assert_eq!(entry.revision, Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unchanged_persistent_entries_flush_nothing() {
        let mut cache = EntityCache::new();
        cache.put_loaded(EntityKind::Job, "j1", json!({"retries": 3}), 1, vec![]);
        assert!(cache.flush_operations().is_empty());

        cache
            .put_updated(EntityKind::Job, "j1", json!({"retries": 2}), vec![], never)
            .unwrap();
        let ops = cache.flush_operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type(), DbOperationType::Update);
    }

    #[test]
    fn inserted_then_deleted_flushes_nothing() {
        let mut cache = EntityCache::new();
        cache
            .put_inserted(EntityKind::Incident, "i1", json!({}), vec![])
            .unwrap();
        cache
            .mark_deleted(EntityKind::Incident, "i1", vec![], never)
            .unwrap();

        assert_eq!(
            cache.get(&EntityKind::Incident, "i1").unwrap().state,
            EntityState::DeletedTransient
        );
        assert!(cache.flush_operations().is_empty());
    }

    #[test]
    fn updating_an_uncached_entity_merges_it() {
        let mut cache = EntityCache::new();
        cache
            .put_updated(EntityKind::Job, "j1", json!({}), vec![], || Ok(7))
            .unwrap();

        let entry = cache.get(&EntityKind::Job, "j1").unwrap();
        assert_eq!(entry.state, EntityState::Merged);
        assert_eq!(cache.flush_operations(), vec![DbOperation::update(EntityKind::Job, "j1", json!({}), 7)]);
    }

    #[test]
    fn deleted_entities_cannot_be_updated() {
        let mut cache = EntityCache::new();
        cache.put_loaded(EntityKind::Job, "j1", json!({}), 1, vec![]);
        cache.mark_deleted(EntityKind::Job, "j1", vec![], never).unwrap();

        let err = cache
            .put_updated(EntityKind::Job, "j1", json!({}), vec![], never)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(cache.flush_operations()[0].op_type(), DbOperationType::Delete);
    }

    #[test]
    fn duplicate_inserts_are_rejected() {
        let mut cache = EntityCache::new();
        cache.put_inserted(EntityKind::Job, "j1", json!({}), vec![]).unwrap();
        assert!(cache.put_inserted(EntityKind::Job, "j1", json!({}), vec![]).is_err());
    }
}
