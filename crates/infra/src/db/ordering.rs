//! Flush ordering of pending operations.
//!
//! Storage applies operations in exactly the order it receives them, so the
//! order has to respect ownership: parents are inserted before children and
//! children are deleted before parents. The order is produced by a chain of
//! comparators; the first one that does not tie decides.
//!
//! ```text
//! 1. operation type   INSERT before UPDATE/DELETE
//! 2. entity kind      rank table, reversed for INSERT; unranked kinds first
//! 3. structure        bulk statements before single-entity operations
//! 4. entity id        lexicographic, then kind name      (entity operations)
//! 5. statement name   lexicographic, then kind name      (bulk operations)
//! 6. operation type   INSERT < UPDATE < DELETE           (final tie-break)
//! ```
//!
//! A stable sort with this chain is followed by a reference pass that fixes
//! up inserts and deletes of the same rank that point at each other, within
//! one kind (a child execution and its parent) or across kinds (an incident
//! and the job it was raised for).

use std::cmp::Ordering;

use procengine_core::EntityKind;

use super::operation::{DbOperation, DbOperationType};

/// One link of the comparator chain.
pub type OperationComparator = fn(&DbOperation, &DbOperation) -> Ordering;

/// The comparator chain in priority order.
pub const FLUSH_ORDER: [OperationComparator; 6] = [
    compare_operation_type,
    compare_entity_kind,
    compare_bulk_first,
    compare_entity_id,
    compare_bulk_statement,
    compare_operation_ordinal,
];

/// Composed flush comparator.
pub fn compare(a: &DbOperation, b: &DbOperation) -> Ordering {
    if std::ptr::eq(a, b) {
        return Ordering::Equal;
    }
    FLUSH_ORDER
        .iter()
        .map(|cmp| cmp(a, b))
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn direction(op: &DbOperation) -> u8 {
    match op.op_type() {
        DbOperationType::Insert => 0,
        DbOperationType::Update | DbOperationType::Delete => 1,
    }
}

/// INSERT before {UPDATE, DELETE}.
pub fn compare_operation_type(a: &DbOperation, b: &DbOperation) -> Ordering {
    direction(a).cmp(&direction(b))
}

/// Sort key of a kind within one direction.
///
/// Unranked kinds get `(0, 0)` so they come first in both directions.
fn kind_key(kind: &EntityKind, insert: bool) -> (u8, u8) {
    match kind.rank() {
        None => (0, 0),
        Some(rank) if insert => (1, u8::MAX - rank),
        Some(rank) => (1, rank),
    }
}

/// Rank order of the entity kinds, reversed for inserts.
///
/// Only meaningful between operations of the same direction; mixed pairs
/// are already decided by [`compare_operation_type`].
pub fn compare_entity_kind(a: &DbOperation, b: &DbOperation) -> Ordering {
    if direction(a) != direction(b) {
        return Ordering::Equal;
    }
    let insert = direction(a) == 0;
    kind_key(a.kind(), insert).cmp(&kind_key(b.kind(), insert))
}

/// Bulk statements before single-entity operations.
pub fn compare_bulk_first(a: &DbOperation, b: &DbOperation) -> Ordering {
    b.is_bulk().cmp(&a.is_bulk())
}

pub fn compare_entity_id(a: &DbOperation, b: &DbOperation) -> Ordering {
    match (a, b) {
        (DbOperation::Entity(a), DbOperation::Entity(b)) => a
            .id
            .cmp(&b.id)
            .then_with(|| a.kind.name().cmp(b.kind.name())),
        _ => Ordering::Equal,
    }
}

pub fn compare_bulk_statement(a: &DbOperation, b: &DbOperation) -> Ordering {
    match (a, b) {
        (DbOperation::Bulk(a), DbOperation::Bulk(b)) => a
            .statement
            .cmp(&b.statement)
            .then_with(|| a.kind.name().cmp(b.kind.name())),
        _ => Ordering::Equal,
    }
}

pub fn compare_operation_ordinal(a: &DbOperation, b: &DbOperation) -> Ordering {
    a.op_type().cmp(&b.op_type())
}

/// Order pending operations for a flush.
pub fn calculate_flush(mut operations: Vec<DbOperation>) -> Vec<DbOperation> {
    operations.sort_by(compare);
    sort_same_rank_references(operations)
}

/// Within each run of single-entity inserts (or deletes) of one rank, move
/// referenced rows ahead of (inserts) or behind (deletes) the rows that
/// reference them. Operations never leave their run.
fn sort_same_rank_references(operations: Vec<DbOperation>) -> Vec<DbOperation> {
    let mut ordered = Vec::with_capacity(operations.len());
    let mut run: Vec<DbOperation> = Vec::new();

    for op in operations {
        let continues_run = run.last().is_some_and(|last| same_run(last, &op));
        if !continues_run {
            flush_run(&mut run, &mut ordered);
        }
        run.push(op);
    }
    flush_run(&mut run, &mut ordered);
    ordered
}

fn same_run(a: &DbOperation, b: &DbOperation) -> bool {
    match (a, b) {
        (DbOperation::Entity(a), DbOperation::Entity(b)) => {
            a.op_type == b.op_type
                && a.op_type != DbOperationType::Update
                && kind_key(&a.kind, true) == kind_key(&b.kind, true)
        }
        _ => false,
    }
}

fn flush_run(run: &mut Vec<DbOperation>, ordered: &mut Vec<DbOperation>) {
    if run.len() < 2 {
        ordered.append(run);
        return;
    }

    // edges[i] lists positions that must be placed before position i
    let mut must_follow: Vec<Vec<usize>> = vec![Vec::new(); run.len()];
    for (i, op) in run.iter().enumerate() {
        let DbOperation::Entity(entity_op) = op else {
            continue;
        };
        for reference in &entity_op.references {
            let Some(j) = run.iter().position(|other| {
                other.kind() == &reference.kind && other.entity_id() == Some(reference.id.as_str())
            }) else {
                continue;
            };
            if i == j {
                continue;
            }
            match entity_op.op_type {
                // referenced row (j) goes first
                DbOperationType::Insert => must_follow[i].push(j),
                // referencing row (i) goes first
                _ => must_follow[j].push(i),
            }
        }
    }

    let mut placed = vec![false; run.len()];
    let mut sequence = Vec::with_capacity(run.len());
    while sequence.len() < run.len() {
        let next = (0..run.len())
            .find(|&i| !placed[i] && must_follow[i].iter().all(|&dep| placed[dep]))
            // a reference cycle: keep the comparator order for the rest
            .or_else(|| (0..run.len()).find(|&i| !placed[i]));
        let Some(next) = next else { break };
        placed[next] = true;
        sequence.push(next);
    }

    let mut slots: Vec<Option<DbOperation>> = run.drain(..).map(Some).collect();
    ordered.extend(sequence.into_iter().filter_map(|i| slots[i].take()));
}
