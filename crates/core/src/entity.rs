//! Persistable entities and the kinds they belong to.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The kind of a persisted entity.
///
/// Known kinds carry an ownership rank used to order flushes: leaf/detail
/// rows rank low, aggregate roots rank high. `Extension` covers kinds added
/// outside this crate; they have no rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Incident,
    Variable,
    EventSubscription,
    Job,
    Batch,
    HistoricBatch,
    ByteArray,
    Task,
    JobDefinition,
    Execution,
    ProcessDefinition,
    Resource,
    Deployment,
    Extension(String),
}

impl EntityKind {
    pub fn extension(name: impl Into<String>) -> Self {
        Self::Extension(name.into())
    }

    /// Ownership depth of the kind; `None` for unranked extension kinds.
    pub fn rank(&self) -> Option<u8> {
        let rank = match self {
            EntityKind::Incident
            | EntityKind::Variable
            | EntityKind::EventSubscription
            | EntityKind::Job
            | EntityKind::Batch
            | EntityKind::HistoricBatch => 1,
            EntityKind::ByteArray | EntityKind::Task | EntityKind::JobDefinition => 2,
            EntityKind::Execution => 3,
            EntityKind::ProcessDefinition | EntityKind::Resource => 4,
            EntityKind::Deployment => 5,
            EntityKind::Extension(_) => return None,
        };
        Some(rank)
    }

    /// Stable type name, used as the last ordering tie-break and in logs.
    pub fn name(&self) -> &str {
        match self {
            EntityKind::Incident => "Incident",
            EntityKind::Variable => "Variable",
            EntityKind::EventSubscription => "EventSubscription",
            EntityKind::Job => "Job",
            EntityKind::Batch => "Batch",
            EntityKind::HistoricBatch => "HistoricBatch",
            EntityKind::ByteArray => "ByteArray",
            EntityKind::Task => "Task",
            EntityKind::JobDefinition => "JobDefinition",
            EntityKind::Execution => "Execution",
            EntityKind::ProcessDefinition => "ProcessDefinition",
            EntityKind::Resource => "Resource",
            EntityKind::Deployment => "Deployment",
            EntityKind::Extension(name) => name,
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference from one entity to another by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Suspension state shared by jobs, job definitions and batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionState {
    #[default]
    Active,
    Suspended,
}

impl SuspensionState {
    pub fn is_suspended(self) -> bool {
        matches!(self, SuspensionState::Suspended)
    }
}

/// Any persistable object with a stable string id.
///
/// Rows are stored as JSON documents, so entities only need serde support.
/// Two entities are the same row when both their kind and id match.
pub trait DbEntity: Serialize + DeserializeOwned + Clone + Send + 'static {
    fn entity_kind() -> EntityKind;

    fn id(&self) -> &str;

    /// Other entities this one points at. Used to order inserts and deletes
    /// of the same kind relative to each other.
    fn references(&self) -> Vec<EntityRef> {
        Vec::new()
    }
}
