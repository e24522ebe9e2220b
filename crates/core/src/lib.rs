//! `procengine-core`: engine building blocks.
//!
//! Identifiers, entity kinds and their ownership ranks, the error taxonomy and
//! the clock abstraction. No storage or threading concerns live here.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{DbEntity, EntityKind, EntityRef, SuspensionState};
pub use error::{EngineError, EngineResult, StorageError};
pub use id::{new_id, DeploymentId};
