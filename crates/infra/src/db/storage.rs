//! Persistence session contract.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::DateTime;
use serde_json::Value as JsonValue;

use procengine_core::{EntityKind, StorageError};

use super::operation::DbOperation;

/// Row selection used by queries and bulk statements.
///
/// Rows are JSON documents; a filter matches on top-level fields. A missing
/// field reads as `null`. Range predicates compare numbers numerically and
/// RFC 3339 timestamps chronologically; `null` never satisfies a range.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    FieldEq(String, JsonValue),
    FieldLe(String, JsonValue),
    FieldGt(String, JsonValue),
    IsNull(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::FieldEq(field.into(), value.into())
    }

    pub fn le(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::FieldLe(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Filter::FieldGt(field.into(), value.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull(field.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    pub fn matches(&self, row: &JsonValue) -> bool {
        match self {
            Filter::All => true,
            Filter::FieldEq(field, expected) => field_of(row, field) == expected,
            Filter::FieldLe(field, bound) => {
                compare_values(field_of(row, field), bound).is_some_and(Ordering::is_le)
            }
            Filter::FieldGt(field, bound) => {
                compare_values(field_of(row, field), bound).is_some_and(Ordering::is_gt)
            }
            Filter::IsNull(field) => field_of(row, field).is_null(),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }
}

fn field_of<'a>(row: &'a JsonValue, field: &str) -> &'a JsonValue {
    row.get(field).unwrap_or(&JsonValue::Null)
}

/// Order two scalar values of the same type. `None` when either is `null`
/// or the types differ.
fn compare_values(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => {
            match (
                DateTime::parse_from_rfc3339(a),
                DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (JsonValue::Bool(a), JsonValue::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// One sort key of a paged query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Order and size of a paged query.
///
/// Rows are ordered by the keys in turn, then by id. `null` sorts before
/// any value in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub order_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl Page {
    pub fn limit(limit: usize) -> Self {
        Self {
            order_by: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(SortKey {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(SortKey {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Compare two row documents (with their ids) by this page's order.
    pub fn compare(&self, a: (&str, &JsonValue), b: (&str, &JsonValue)) -> Ordering {
        self.order_by
            .iter()
            .map(|key| {
                let (x, y) = (field_of(a.1, &key.field), field_of(b.1, &key.field));
                let ord = match (x.is_null(), y.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => compare_values(x, y).unwrap_or(Ordering::Equal),
                };
                if key.descending { ord.reverse() } else { ord }
            })
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| a.0.cmp(b.0))
    }

    /// Sort `rows` by this page's order and cut them to the limit.
    pub fn apply(&self, rows: &mut Vec<Row>) {
        rows.sort_by(|a, b| self.compare((a.id.as_str(), &a.data), (b.id.as_str(), &b.data)));
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
    }
}

/// A stored entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub kind: EntityKind,
    pub id: String,
    pub revision: u32,
    pub data: JsonValue,
}

/// Answer of a conflict resolver for one failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Skip the operation and keep applying the rest of the batch.
    Ignore,
    /// Roll back the whole batch and return the error.
    Abort,
}

/// Outcome of a successful batch apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub applied: usize,
    pub ignored: Vec<DbOperation>,
}

/// Storage backend of the engine.
///
/// `apply` receives operations already in flush order and must apply them
/// in that order, as one atomic batch.
pub trait Storage: Send + Sync {
    fn find(&self, kind: &EntityKind, id: &str) -> Result<Option<Row>, StorageError>;

    fn query(&self, kind: &EntityKind, filter: &Filter) -> Result<Vec<Row>, StorageError>;

    /// Matching rows in page order, at most `page.limit` of them.
    fn query_page(
        &self,
        kind: &EntityKind,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, StorageError> {
        let mut rows = self.query(kind, filter)?;
        page.apply(&mut rows);
        Ok(rows)
    }

    /// Apply an ordered batch. Single-entity updates and deletes compare the
    /// row revision; inserts fail on an existing id. Each failed operation is
    /// handed to `resolver`.
    fn apply(
        &self,
        operations: &[DbOperation],
        resolver: &mut dyn FnMut(&DbOperation, &StorageError) -> ConflictResolution,
    ) -> Result<FlushSummary, StorageError>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn find(&self, kind: &EntityKind, id: &str) -> Result<Option<Row>, StorageError> {
        (**self).find(kind, id)
    }

    fn query(&self, kind: &EntityKind, filter: &Filter) -> Result<Vec<Row>, StorageError> {
        (**self).query(kind, filter)
    }

    fn query_page(
        &self,
        kind: &EntityKind,
        filter: &Filter,
        page: &Page,
    ) -> Result<Vec<Row>, StorageError> {
        (**self).query_page(kind, filter, page)
    }

    fn apply(
        &self,
        operations: &[DbOperation],
        resolver: &mut dyn FnMut(&DbOperation, &StorageError) -> ConflictResolution,
    ) -> Result<FlushSummary, StorageError> {
        (**self).apply(operations, resolver)
    }
}
