//! Minimal process model rows: deployments, process definitions and
//! executions. They exist so commands have a realistic ownership chain to
//! flush; the process runtime itself lives elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use procengine_core::{DbEntity, EntityKind, EntityRef, SuspensionState, new_id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEntity {
    pub id: String,
    pub name: String,
    pub tenant_id: Option<String>,
}

impl DeploymentEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tenant_id: None,
        }
    }
}

impl DbEntity for DeploymentEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::Deployment
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// A deployed process, owned by its deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinitionEntity {
    pub id: String,
    pub key: String,
    pub version: u32,
    pub deployment_id: String,
    pub suspension_state: SuspensionState,
}

impl ProcessDefinitionEntity {
    pub fn new(id: impl Into<String>, key: impl Into<String>, deployment_id: &str) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            version: 1,
            deployment_id: deployment_id.to_string(),
            suspension_state: SuspensionState::Active,
        }
    }
}

impl DbEntity for ProcessDefinitionEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::ProcessDefinition
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<EntityRef> {
        vec![EntityRef::new(EntityKind::Deployment, self.deployment_id.clone())]
    }
}

/// A running process instance or one of its child executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    pub id: String,
    pub process_definition_id: String,
    /// Parent execution; `None` for the process instance itself.
    pub parent_id: Option<String>,
    pub activity_id: Option<String>,
    pub variables: JsonValue,
}

impl ExecutionEntity {
    pub fn process_instance(definition: &ProcessDefinitionEntity) -> Self {
        Self {
            id: new_id(),
            process_definition_id: definition.id.clone(),
            parent_id: None,
            activity_id: None,
            variables: JsonValue::Null,
        }
    }

    pub fn child_of(parent: &ExecutionEntity) -> Self {
        Self {
            id: new_id(),
            process_definition_id: parent.process_definition_id.clone(),
            parent_id: Some(parent.id.clone()),
            activity_id: None,
            variables: JsonValue::Null,
        }
    }

    pub fn with_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }
}

impl DbEntity for ExecutionEntity {
    fn entity_kind() -> EntityKind {
        EntityKind::Execution
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn references(&self) -> Vec<EntityRef> {
        let mut refs = vec![EntityRef::new(
            EntityKind::ProcessDefinition,
            self.process_definition_id.clone(),
        )];
        if let Some(parent) = &self.parent_id {
            refs.push(EntityRef::new(EntityKind::Execution, parent.clone()));
        }
        refs
    }
}
