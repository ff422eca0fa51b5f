// src/utils/errors.rs
//! Error types for the sandbox engine
//!
//! Everything that can go wrong below the execution façade is a
//! `SandboxError`. The façade converts these into `ExecutionResult`
//! failures; nothing in this crate is allowed to take the host down.

use thiserror::Error;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Configuration could not be loaded or validated
    #[error("configuration error: {0}")]
    Config(String),

    /// Interpreter binary missing or process creation failed
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    /// Worker did not complete the init/ready handshake
    #[error("worker init failed: {0}")]
    InitFailed(String),

    /// Pool is shutting down; queued waiters are rejected with this
    #[error("pool is shutting down")]
    PoolShuttingDown,

    /// Worker stdin/stdout channel broke mid-conversation
    #[error("worker communication error: {0}")]
    WorkerIo(String),

    /// A frame could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Per-execution workspace could not be created
    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
