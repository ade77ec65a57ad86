#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Query Coordinator
//!
//! Lifecycle coordination for long-running, paginated queries executed by a
//! pool of worker processes, with results streamed back to whichever service
//! instance is serving the client.
//!
//! ## Overview
//!
//! A query is decomposed into tasks (create, plan, next, close, cancel). The
//! creator, the executor and the result consumer may all be different
//! processes, so every piece of shared state lives in a lockable key-value
//! store and is only mutated under a per-query lease lock.
//!
//! ## Module Organization
//!
//! - [`state_machine`] - per-query task states with bounded RUNNING slots
//! - [`storage`] - lockable key-value substrate and typed query records
//! - [`coordination`] - locked updates, next-call admission, lifecycle, execution, dispatch
//! - [`messaging`] - per-query result channels over pluggable backends, with claim check
//! - [`config`] - layered configuration
//! - [`error`] - structured error taxonomy
//!
//! ## Quick Start
//!
//! ```rust
//! use query_coordinator::config::CoordinatorConfig;
//! use query_coordinator::coordination::QueryCoordinator;
//! use query_coordinator::models::{QueryCheckpoint, QueryKey, QueryState};
//!
//! # tokio_test::block_on(async {
//! let coordinator = QueryCoordinator::from_config(&CoordinatorConfig::default()).await?;
//!
//! let query_id = coordinator.create_id();
//! let checkpoint = QueryCheckpoint::new(QueryKey::new("default", query_id, "EventQuery"));
//! let create_task = coordinator.create_query(checkpoint, "alice").await?;
//! assert_eq!(create_task.task_id(), 1);
//!
//! coordinator.claim_next_call(&query_id).await?;
//! // ... receive a page of results ...
//! coordinator.release_next_call(&query_id).await?;
//!
//! let status = coordinator.close(&query_id).await?;
//! assert_eq!(status.query_state, QueryState::Close);
//! # Ok::<(), query_coordinator::CoordinationError>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod state_machine;
pub mod storage;

pub use config::{ConfigManager, CoordinatorConfig};
pub use coordination::{QueryCoordinator, RequestDispatcher, TaskExecutor};
pub use error::{CoordinationError, CoordinationResult};
pub use messaging::{MessagingProvider, QueryResultsListener, QueryResultsManager, QueryResultsPublisher};
pub use models::{QueryCheckpoint, QueryKey, QueryState, QueryStatus, QueryTask, TaskAction, TaskKey};
pub use state_machine::{TaskState, TaskStates};
pub use storage::{LockableStore, QueryStorageCache, StorageProvider};
