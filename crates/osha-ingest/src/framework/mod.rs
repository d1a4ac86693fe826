//! Idempotent versioned loading framework
//!
//! Every loader follows the same per-document cycle: hash the document,
//! resolve the existing version for its logical key, decide an action from
//! the load mode, then apply that action inside one transaction. Concrete
//! loaders only provide a typed document and a [`RecordMapper`].

pub mod audit;
pub mod hash;
pub mod loader;
pub mod mode;
pub mod store;

pub use audit::{LoadAudit, LoadAuditRecorder, LoadStatus};
pub use hash::compute_content_hash;
pub use loader::{LoadOptions, LoadStats, RecordFailure, VersionedLoader};
pub use mode::{decide_action, Action, ExistingVersion, LoadMode};
pub use store::{ApplyOutcome, Document, PgVersionStore, RecordMapper, VersionStore};
