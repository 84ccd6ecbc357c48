//! # platen-core
//!
//! Shared foundation for the Platen preprocessing orchestrator.
//!
//! This crate provides the pieces every other Platen crate builds on:
//!
//! - **Identifiers**: the [`BatchId`] newtype and the deterministic
//!   [`task_id`](id::task_id) function
//! - **Errors**: the core [`Error`] type
//! - **Storage**: the [`StorageBackend`](storage::StorageBackend) abstraction
//!   used to persist orchestrator control state
//! - **Observability**: logging initialization and span helpers

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

pub use error::{Error, Result};
pub use id::BatchId;
