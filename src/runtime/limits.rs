// src/runtime/limits.rs
//! Per-request resource limits
//!
//! A request may carry optional limit overrides; they are merged with the
//! deployment defaults and clamped to the hard ceilings exactly once, at
//! admission. Everything downstream (worker timers, RLIMIT_AS sizing,
//! disk quota) reads the resolved values and never re-derives them.

use crate::utils::config::LimitsConfig;
use serde::{Deserialize, Serialize};

/// Fixed interpreter baseline added on top of the user memory limit when
/// sizing the address-space rlimit. Node and CPython both need working
/// room for the runtime itself before the first user allocation.
pub const ADDRESS_SPACE_OVERHEAD_MB: u64 = 512;

/// Grace added to the host-side kill timer so the interpreter's own
/// timeout fires first and IPC/serialization overhead is absorbed.
pub const TIMEOUT_GRACE_MS: u64 = 2_000;

/// Limit overrides as they arrive on the wire
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestedLimits {
    pub timeout_ms: Option<u64>,
    #[serde(rename = "memoryMB")]
    pub memory_mb: Option<u64>,
    #[serde(rename = "diskMB")]
    pub disk_mb: Option<u64>,
}

/// Limits after merging with defaults and clamping to ceilings.
/// Invariant: every field is strictly positive and at most its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl ResolvedLimits {
    /// `min(requested > 0 ? requested : default, ceiling)` per axis.
    /// A requested value of 0 is treated as absent rather than producing
    /// a zero limit.
    pub fn resolve(requested: Option<&RequestedLimits>, cfg: &LimitsConfig) -> Self {
        fn clamp(requested: Option<u64>, default: u64, ceiling: u64) -> u64 {
            requested
                .filter(|v| *v > 0)
                .unwrap_or(default)
                .min(ceiling)
        }

        let req = requested.cloned().unwrap_or_default();
        Self {
            timeout_ms: clamp(req.timeout_ms, cfg.default_timeout_ms, cfg.max_timeout_ms),
            memory_mb: clamp(req.memory_mb, cfg.default_memory_mb, cfg.max_memory_mb),
            disk_mb: clamp(req.disk_mb, cfg.default_disk_mb, cfg.max_disk_mb),
        }
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    pub fn disk_quota_bytes(&self) -> u64 {
        self.disk_mb * 1024 * 1024
    }

    /// Address-space cap applied to the worker process at spawn time
    pub fn address_space_bytes(memory_ceiling_mb: u64) -> u64 {
        (memory_ceiling_mb + ADDRESS_SPACE_OVERHEAD_MB) * 1024 * 1024
    }

    /// Deadline for the host-side kill timer
    pub fn host_deadline_ms(&self) -> u64 {
        self.timeout_ms + TIMEOUT_GRACE_MS
    }
}
