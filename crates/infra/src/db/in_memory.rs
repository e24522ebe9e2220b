//! In-memory storage for tests and embedded use.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use tracing::debug;

use procengine_core::{EntityKind, StorageError};

use super::operation::{DbBulkOperation, DbEntityOperation, DbOperation, DbOperationType};
use super::storage::{ConflictResolution, Filter, FlushSummary, Row, Storage};

type Table = BTreeMap<String, Row>;

/// Per-kind tables behind one lock.
///
/// A batch is staged on copies of the tables it touches and swapped in only
/// when every operation was applied or ignored.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: RwLock<HashMap<EntityKind, Table>>,
    injected: Mutex<VecDeque<StorageError>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next apply fail with `error` before touching any row.
    /// Queued failures are consumed one per apply.
    pub fn inject_failure(&self, error: StorageError) {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Number of rows of one kind.
    pub fn count(&self, kind: &EntityKind) -> usize {
        self.read_tables().get(kind).map_or(0, BTreeMap::len)
    }

    /// All rows of one kind, ordered by id.
    pub fn rows(&self, kind: &EntityKind) -> Vec<Row> {
        self.read_tables()
            .get(kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, HashMap<EntityKind, Table>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected(&self) -> Option<StorageError> {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl Storage for InMemoryStorage {
    fn find(&self, kind: &EntityKind, id: &str) -> Result<Option<Row>, StorageError> {
        Ok(self.read_tables().get(kind).and_then(|t| t.get(id)).cloned())
    }

    fn query(&self, kind: &EntityKind, filter: &Filter) -> Result<Vec<Row>, StorageError> {
        Ok(self
            .read_tables()
            .get(kind)
            .map(|table| {
                table
                    .values()
                    .filter(|row| filter.matches(&row.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn apply(
        &self,
        operations: &[DbOperation],
        resolver: &mut dyn FnMut(&DbOperation, &StorageError) -> ConflictResolution,
    ) -> Result<FlushSummary, StorageError> {
        if let Some(err) = self.take_injected() {
            debug!(error = %err, "injected storage failure");
            return Err(err);
        }

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged: HashMap<EntityKind, Table> = HashMap::new();
        let mut summary = FlushSummary::default();

        for op in operations {
            let table = staged
                .entry(op.kind().clone())
                .or_insert_with(|| tables.get(op.kind()).cloned().unwrap_or_default());

            let result = match op {
                DbOperation::Entity(entity_op) => apply_entity(table, entity_op),
                DbOperation::Bulk(bulk_op) => {
                    apply_bulk(table, bulk_op);
                    Ok(())
                }
            };

            match result {
                Ok(()) => summary.applied += 1,
                Err(err) => match resolver(op, &err) {
                    ConflictResolution::Ignore => {
                        debug!(operation = %op, error = %err, "ignoring failed operation");
                        summary.ignored.push(op.clone());
                    }
                    ConflictResolution::Abort => return Err(err),
                },
            }
        }

        for (kind, table) in staged {
            tables.insert(kind, table);
        }
        Ok(summary)
    }
}

fn apply_entity(table: &mut Table, op: &DbEntityOperation) -> Result<(), StorageError> {
    match op.op_type {
        DbOperationType::Insert => {
            if table.contains_key(&op.id) {
                return Err(StorageError::DuplicateKey {
                    kind: op.kind.name().to_string(),
                    id: op.id.clone(),
                });
            }
            table.insert(
                op.id.clone(),
                Row {
                    kind: op.kind.clone(),
                    id: op.id.clone(),
                    revision: 1,
                    data: op.payload.clone().unwrap_or(JsonValue::Null),
                },
            );
            Ok(())
        }
        DbOperationType::Update => {
            let row = checked_row(table, op)?;
            row.revision += 1;
            row.data = op.payload.clone().unwrap_or(JsonValue::Null);
            Ok(())
        }
        DbOperationType::Delete => {
            checked_row(table, op)?;
            table.remove(&op.id);
            Ok(())
        }
    }
}

/// The row an update/delete targets, if it still carries the expected revision.
fn checked_row<'t>(table: &'t mut Table, op: &DbEntityOperation) -> Result<&'t mut Row, StorageError> {
    match table.get_mut(&op.id) {
        Some(row) if op.revision.is_none_or(|expected| expected == row.revision) => Ok(row),
        _ => Err(StorageError::concurrent_modification(op.kind.name(), op.id.clone())),
    }
}

fn apply_bulk(table: &mut Table, op: &DbBulkOperation) {
    match op.op_type {
        DbOperationType::Delete => table.retain(|_, row| !op.filter.matches(&row.data)),
        DbOperationType::Update | DbOperationType::Insert => {
            for row in table.values_mut().filter(|row| op.filter.matches(&row.data)) {
                if let JsonValue::Object(fields) = &mut row.data {
                    for (field, value) in &op.assignments {
                        fields.insert(field.clone(), value.clone());
                    }
                }
                row.revision += 1;
            }
        }
    }
}
