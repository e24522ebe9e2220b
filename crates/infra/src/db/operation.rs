//! Deferred database operations.
//!
//! A command never writes to storage directly. Its unit of work collects
//! `DbOperation`s which are ordered and applied in one batch when the
//! command context closes.

use core::fmt;

use serde_json::{Map, Value as JsonValue};

use procengine_core::{EntityKind, EntityRef};

use super::storage::Filter;

/// Direction of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbOperationType {
    Insert,
    Update,
    Delete,
}

impl DbOperationType {
    /// Updates and deletes modify rows that already exist.
    pub fn is_modification(self) -> bool {
        matches!(self, DbOperationType::Update | DbOperationType::Delete)
    }
}

impl fmt::Display for DbOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbOperationType::Insert => "INSERT",
            DbOperationType::Update => "UPDATE",
            DbOperationType::Delete => "DELETE",
        })
    }
}

/// An insert, update or delete of one entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct DbEntityOperation {
    pub op_type: DbOperationType,
    pub kind: EntityKind,
    pub id: String,
    /// Row document for inserts and updates.
    pub payload: Option<JsonValue>,
    /// Revision the row was read at; checked by updates and deletes.
    pub revision: Option<u32>,
    pub references: Vec<EntityRef>,
}

/// A statement touching every row of one kind that matches a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct DbBulkOperation {
    pub op_type: DbOperationType,
    pub kind: EntityKind,
    pub statement: String,
    pub filter: Filter,
    /// Field assignments of a bulk update; empty for deletes.
    pub assignments: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbOperation {
    Entity(DbEntityOperation),
    Bulk(DbBulkOperation),
}

impl DbOperation {
    pub fn insert(
        kind: EntityKind,
        id: impl Into<String>,
        payload: JsonValue,
        references: Vec<EntityRef>,
    ) -> Self {
        DbOperation::Entity(DbEntityOperation {
            op_type: DbOperationType::Insert,
            kind,
            id: id.into(),
            payload: Some(payload),
            revision: None,
            references,
        })
    }

    pub fn update(kind: EntityKind, id: impl Into<String>, payload: JsonValue, revision: u32) -> Self {
        DbOperation::Entity(DbEntityOperation {
            op_type: DbOperationType::Update,
            kind,
            id: id.into(),
            payload: Some(payload),
            revision: Some(revision),
            references: Vec::new(),
        })
    }

    pub fn delete(
        kind: EntityKind,
        id: impl Into<String>,
        revision: u32,
        references: Vec<EntityRef>,
    ) -> Self {
        DbOperation::Entity(DbEntityOperation {
            op_type: DbOperationType::Delete,
            kind,
            id: id.into(),
            payload: None,
            revision: Some(revision),
            references,
        })
    }

    pub fn bulk_update(
        kind: EntityKind,
        statement: impl Into<String>,
        filter: Filter,
        assignments: Map<String, JsonValue>,
    ) -> Self {
        DbOperation::Bulk(DbBulkOperation {
            op_type: DbOperationType::Update,
            kind,
            statement: statement.into(),
            filter,
            assignments,
        })
    }

    pub fn bulk_delete(kind: EntityKind, statement: impl Into<String>, filter: Filter) -> Self {
        DbOperation::Bulk(DbBulkOperation {
            op_type: DbOperationType::Delete,
            kind,
            statement: statement.into(),
            filter,
            assignments: Map::new(),
        })
    }

    pub fn op_type(&self) -> DbOperationType {
        match self {
            DbOperation::Entity(op) => op.op_type,
            DbOperation::Bulk(op) => op.op_type,
        }
    }

    pub fn kind(&self) -> &EntityKind {
        match self {
            DbOperation::Entity(op) => &op.kind,
            DbOperation::Bulk(op) => &op.kind,
        }
    }

    pub fn is_bulk(&self) -> bool {
        matches!(self, DbOperation::Bulk(_))
    }

    /// Entity id for single-entity operations.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            DbOperation::Entity(op) => Some(&op.id),
            DbOperation::Bulk(_) => None,
        }
    }

    /// Statement name for bulk operations.
    pub fn statement(&self) -> Option<&str> {
        match self {
            DbOperation::Entity(_) => None,
            DbOperation::Bulk(op) => Some(&op.statement),
        }
    }
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbOperation::Entity(op) => write!(f, "{} {}[{}]", op.op_type, op.kind, op.id),
            DbOperation::Bulk(op) => {
                write!(f, "{} (bulk) {} '{}'", op.op_type, op.kind, op.statement)
            }
        }
    }
}
