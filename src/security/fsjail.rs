// src/security/fsjail.rs
//! Filesystem jail
//!
//! Every execution gets a private scratch directory; the Python shim's
//! wrapped `open` resolves user paths against it and enforces a
//! cumulative written-bytes quota (JavaScript exposes no file API at
//! all). The path rules the shim applies are defined here so they can
//! be tested independently of an interpreter: relative paths only, no
//! `..` segments, nothing resembling a drive or UNC prefix.

use crate::utils::errors::{Result, SandboxError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Why a user-supplied path was rejected by the jail rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailViolation {
    Empty,
    Absolute,
    Traversal,
}

impl JailViolation {
    pub fn message(&self) -> &'static str {
        match self {
            JailViolation::Empty => "Path cannot be empty",
            JailViolation::Absolute => "Absolute paths are not allowed in sandbox",
            JailViolation::Traversal => "Path traversal is not allowed in sandbox",
        }
    }
}

/// Validate a user path against the jail rules without touching the
/// filesystem. Mirrors exactly what the Python shim enforces.
pub fn validate_user_path(path: &str) -> std::result::Result<(), JailViolation> {
    if path.trim().is_empty() {
        return Err(JailViolation::Empty);
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(JailViolation::Absolute);
    }
    // Windows-style drive prefix, just in case
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(JailViolation::Absolute);
    }
    if path
        .split(['/', '\\'])
        .any(|segment| segment == "..")
    {
        return Err(JailViolation::Traversal);
    }
    Ok(())
}

/// Private scratch directory for a single execution. Removed from disk
/// when dropped, win or lose.
#[derive(Debug)]
pub struct ExecWorkspace {
    dir: TempDir,
    disk_quota_bytes: u64,
}

impl ExecWorkspace {
    pub fn create(disk_quota_bytes: u64) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sandbox-exec-")
            .tempdir()
            .map_err(|e| SandboxError::Workspace(e.to_string()))?;
        Ok(Self {
            dir,
            disk_quota_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn disk_quota_bytes(&self) -> u64 {
        self.disk_quota_bytes
    }

    /// Resolve a validated user path inside the workspace
    pub fn resolve(&self, user_path: &str) -> std::result::Result<PathBuf, JailViolation> {
        validate_user_path(user_path)?;
        Ok(self.dir.path().join(user_path))
    }
}
