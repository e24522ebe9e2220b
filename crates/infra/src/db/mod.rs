//! Persistence: deferred operations, their flush order and the storage seam.

pub mod cache;
pub mod classifier;
pub mod in_memory;
pub mod operation;
pub mod ordering;
pub mod storage;

pub use cache::{CachedEntity, EntityCache, EntityState};
pub use classifier::{SqlStateClassifier, TransientErrorClassifier};
pub use in_memory::InMemoryStorage;
pub use operation::{DbBulkOperation, DbEntityOperation, DbOperation, DbOperationType};
pub use ordering::calculate_flush;
pub use storage::{ConflictResolution, Filter, FlushSummary, Page, Row, SortKey, Storage};
