//! # platen-flow
//!
//! Orchestration engine for the Platen preprocessing service.
//!
//! A producer drops a batch message naming a set of files staged in an
//! object store. This crate owns everything between that message and the
//! terminal status a poller eventually reads:
//!
//! - **Phases**: pluggable pipeline stages with a
//!   discover / execute / reconcile / successor contract
//! - **Tasks**: the per-file unit of work with a deterministic identity
//! - **Spawning**: one ephemeral remote machine per task, bounded per wave
//! - **Alarms**: periodic self-wakeups that guarantee progress under
//!   partial failure
//! - **Callbacks**: idempotent folding of worker-reported outcomes
//!
//! ## Guarantees
//!
//! - **Single writer**: all mutations of a batch's state are serialized
//!   through one lock per batch id
//! - **Deterministic discovery**: the same message always produces the same
//!   task set
//! - **At-least-once spawning**: a task may be spawned more than once, but
//!   its identity is stable, so duplicate worker reports fold idempotently
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use platen_core::storage::MemoryBackend;
//! use platen_flow::config::OrchestratorConfig;
//! use platen_flow::notify::NoopNotifier;
//! use platen_flow::orchestrator::Orchestrator;
//! use platen_flow::spawner::MockSpawner;
//! use platen_flow::store::DocumentStore;
//!
//! # async fn run(message: platen_flow::message::BatchMessage) -> platen_flow::error::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(DocumentStore::new(Arc::new(MemoryBackend::new()))),
//!     Arc::new(MockSpawner::new()),
//!     Arc::new(NoopNotifier),
//! );
//! orchestrator.start_batch(message).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod phase;
pub mod spawner;
pub mod store;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::{BatchState, BatchStatus, StatusView};
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::message::BatchMessage;
    pub use crate::notify::{DownstreamNotifier, HttpNotifier, NoopNotifier};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::phase::{ExecuteOutcome, Phase, PhaseRegistry, PhaseTag};
    pub use crate::spawner::{FlyMachineSpawner, MachineSpawner, MockSpawner, SpawnError};
    pub use crate::store::{DocumentStore, MemoryStore, StateStore};
    pub use crate::task::{CallbackPayload, Task, TaskStatus};
}
