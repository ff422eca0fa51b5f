// src/runtime/language.rs
//! Supported interpreter languages
//!
//! Each language pairs an interpreter command with an embedded worker
//! shim and its security policy. The shim sources ship inside the binary
//! and are materialized to a private temp directory before the first
//! worker spawns.

use crate::runtime::limits::ResolvedLimits;
use crate::security::policy::{self, CapabilityRule, ModulePolicy};
use crate::utils::errors::{Result, SandboxError};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// Languages the sandbox can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    Python,
}

impl Language {
    pub const ALL: &'static [Language] = &[Language::JavaScript, Language::Python];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
        }
    }

    /// Parse the `{language}` segment of the sandbox route
    pub fn from_route(segment: &str) -> Option<Self> {
        match segment {
            "javascript" | "js" => Some(Language::JavaScript),
            "python" | "py" => Some(Language::Python),
            _ => None,
        }
    }

    /// Interpreter command name, resolved against PATH at spawn time
    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::JavaScript => "node",
            Language::Python => "python3",
        }
    }

    /// Arguments placed before the shim path
    pub fn interpreter_args(&self) -> &'static [&'static str] {
        match self {
            Language::JavaScript => &[],
            // Unbuffered: protocol lines must not sit in a stdio buffer
            Language::Python => &["-u"],
        }
    }

    fn script_filename(&self) -> &'static str {
        match self {
            Language::JavaScript => "worker.js",
            Language::Python => "worker.py",
        }
    }

    fn script_source(&self) -> &'static str {
        match self {
            Language::JavaScript => include_str!("workers/worker.js"),
            Language::Python => include_str!("workers/worker.py"),
        }
    }

    /// Address-space cap applied at spawn, where it is safe to do so.
    /// V8 reserves multi-gigabyte virtual regions up front, so
    /// JavaScript workers get no RLIMIT_AS and rely on the RSS probe;
    /// CPython tolerates the cap fine.
    pub fn address_space_bytes(&self, memory_ceiling_mb: u64) -> Option<u64> {
        match self {
            Language::JavaScript => None,
            Language::Python => Some(ResolvedLimits::address_space_bytes(memory_ceiling_mb)),
        }
    }

    pub fn module_policy(&self) -> ModulePolicy {
        match self {
            Language::JavaScript => ModulePolicy::javascript(),
            Language::Python => ModulePolicy::python(),
        }
    }

    pub fn capability_manifest(&self) -> Vec<CapabilityRule> {
        match self {
            Language::JavaScript => policy::javascript_manifest(),
            Language::Python => policy::python_manifest(),
        }
    }

    /// Locate the interpreter binary
    pub fn resolve_interpreter(&self) -> Result<PathBuf> {
        which::which(self.interpreter()).map_err(|e| {
            SandboxError::SpawnFailed(format!(
                "executable '{}' not found in PATH: {e}",
                self.interpreter()
            ))
        })
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An embedded worker shim written out to disk, removed on drop
#[derive(Debug)]
pub struct WorkerScript {
    path: PathBuf,
    _dir: TempDir,
}

impl WorkerScript {
    pub fn materialize(language: Language) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sandbox-shim-")
            .tempdir()
            .map_err(|e| SandboxError::Workspace(e.to_string()))?;
        let path = dir.path().join(language.script_filename());
        std::fs::write(&path, language.script_source())?;
        info!(language = %language, path = %path.display(), "worker shim materialized");
        Ok(Self { path, _dir: dir })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parsing() {
        assert_eq!(Language::from_route("js"), Some(Language::JavaScript));
        assert_eq!(Language::from_route("javascript"), Some(Language::JavaScript));
        assert_eq!(Language::from_route("python"), Some(Language::Python));
        assert_eq!(Language::from_route("py"), Some(Language::Python));
        assert_eq!(Language::from_route("ruby"), None);
    }

    #[test]
    fn test_materialized_script_matches_asset() {
        let script = WorkerScript::materialize(Language::Python).unwrap();
        let on_disk = std::fs::read_to_string(script.path()).unwrap();
        assert_eq!(on_disk, Language::Python.script_source());
        assert!(script.path().ends_with("worker.py"));
    }

    #[test]
    fn test_script_dir_removed_on_drop() {
        let path;
        {
            let script = WorkerScript::materialize(Language::JavaScript).unwrap();
            path = script.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_policies_per_language() {
        assert_eq!(
            Language::JavaScript.module_policy().mode,
            crate::security::policy::ModuleMode::Allow
        );
        assert_eq!(
            Language::Python.module_policy().mode,
            crate::security::policy::ModuleMode::Deny
        );
        assert!(!Language::Python.capability_manifest().is_empty());
    }
}
