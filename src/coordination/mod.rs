//! # Query Coordination
//!
//! Cross-process coordination of query lifecycles. There is no central
//! scheduler: every process mutates the shared query status and task-state
//! records through the [`LockedCacheUpdate`] protocol, and hands results to
//! consumers through the messaging layer.
//!
//! - [`locked_update`]: lock, read, mutate, write, release
//! - [`admission`]: bounding concurrent next calls and starting READY tasks
//! - [`lifecycle`]: the [`QueryCoordinator`] facade
//! - [`executor`]: running tasks through pluggable [`QueryLogic`]
//! - [`dispatch`]: origin-tagged request fan-out

pub mod admission;
pub mod dispatch;
pub mod executor;
pub mod lifecycle;
pub mod locked_update;

pub use admission::{AdmitReadyTask, ClaimNextCall, ReleaseNextCall, TaskAdmission};
pub use dispatch::{
    DispatchReport, HandlerScope, QueryRequest, QueryRequestHandler, QueryRequestMethod, RequestDispatcher,
};
pub use executor::{QueryLogic, TaskExecution, TaskExecutor, TaskOutcome};
pub use lifecycle::QueryCoordinator;
pub use locked_update::{CacheUpdater, Lenient, LockedCacheUpdate, SyncUpdate};
