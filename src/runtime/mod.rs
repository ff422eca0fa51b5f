// src/runtime/mod.rs
//! Sandbox execution runtime
//!
//! The core of the engine: worker processes, the per-language pools that
//! keep them warm, and the machinery that turns a request into exactly
//! one bounded task on exactly one worker.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                 Execution façade                      │
//! │        ┌──────────────┬──────────────┐                │
//! │   WorkerPool (javascript)      WorkerPool (python)    │
//! │   ┌──────────┐ ┌──────────┐    ┌──────────┐           │
//! │   │ node     │ │ node     │    │ python3  │  ...      │
//! │   │ + shim   │ │ + shim   │    │ + shim   │           │
//! │   └──────────┘ └──────────┘    └──────────┘           │
//! │                                                       │
//! │   ColdRunner ── AdmissionSemaphore (no warmed pool)   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Each worker speaks the newline-delimited JSON protocol in
//! [`protocol`]; the pool enforces the one-task-per-worker invariant the
//! protocol itself cannot detect.

pub mod admission;
pub mod cold;
pub mod language;
pub mod limits;
pub mod pool;
pub mod protocol;
pub mod worker;

pub use admission::AdmissionSemaphore;
pub use cold::ColdRunner;
pub use language::Language;
pub use limits::{RequestedLimits, ResolvedLimits};
pub use pool::{PoolStats, WorkerPool};
pub use protocol::{ExecutionRequest, ExecutionResult};
pub use worker::Worker;
