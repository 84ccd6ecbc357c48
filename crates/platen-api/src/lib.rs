//! # platen-api
//!
//! HTTP surface for the Platen preprocessing orchestrator.
//!
//! Exposes the externally visible contract:
//!
//! - `GET  /health`, `GET /ready`: liveness and readiness
//! - `POST /queue/batch`: queue delivery of a batch message
//! - `GET  /status/{batch_id}`: poller-facing status snapshot
//! - `POST /callback/{batch_id}/{task_id}`: worker terminal reports
//! - `POST /admin/reset/{batch_id}`: force a batch into terminal failure

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod server;
