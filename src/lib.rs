//! # taskhub
//!
//! Task execution coordinator for long-running generation jobs.
//!
//! Jobs are admitted against a per-model, cross-process concurrency limit,
//! run as external worker processes, and stream their progress to any
//! number of live observers with full history replay for late joiners.
//!
//! ## Modules
//!
//! - `admission` - Cross-process counting semaphore over the shared store
//! - `broadcast` - Per-job event fan-out with history replay
//! - `config` - Configuration loading (TOML file and environment)
//! - `error` - Top-level error type and numeric error codes
//! - `events` - Progress event wire type
//! - `job` - Job data model and claim-once finalization
//! - `progress` - Bridge to the worker-written progress hash
//! - `registry` - Concurrency-safe job registry
//! - `sink` - Persistence collaborator interface
//! - `store` - Shared key-value store (Redis or in-process)
//! - `supervisor` - Worker supervision and the `Coordinator` facade
pub mod admission;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod progress;
pub mod registry;
pub mod sink;
pub mod store;
pub mod supervisor;

pub use config::CoordinatorConfig;
pub use error::{CoordinatorError, CoordinatorResult};
pub use events::{EventKind, ProgressEvent};
pub use job::{JobParams, JobSnapshot, JobStatus, ModelCredentials, ModelTarget};
pub use supervisor::{Coordinator, SubmittedJob};
