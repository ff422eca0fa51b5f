// src/security/policy.rs
//! Module boundary and capability policy
//!
//! Two per-language controls are generated here and delivered to the
//! worker shim in the `init` frame:
//!
//! - a module policy: JavaScript gets an explicit **allow-list** of
//!   importable packages (data/utility libraries only); Python gets a
//!   **deny-list** enforced by a runtime `__import__` hook in the shim.
//! - a capability manifest: a declarative list of `{symbol path, action}`
//!   entries (`remove` / `freeze` / `wrap`) the shim applies once at boot,
//!   instead of ad hoc scattered global mutation.
//!
//! For Python there is additionally a host-side static pre-check on the
//! submitted source. It is a fast-path optimization and a
//! defense-in-depth layer only: it matches column-0 `import`/`from`
//! statements and literal `__import__("...")` calls, and deliberately does
//! not try to see through indentation, string concatenation or other
//! obfuscation. The authoritative gate is always the runtime hook.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Packages JavaScript user code may `require`. Data and utility
/// libraries only; nothing that touches the filesystem, network or
/// process control.
pub const JS_MODULE_ALLOWLIST: &[&str] = &[
    "lodash",
    "dayjs",
    "date-fns",
    "crypto-js",
    "uuid",
    "qs",
    "papaparse",
];

/// Top-level Python modules user code may not import, directly or
/// indirectly. Covers process/filesystem escape, raw networking that
/// would bypass the egress guard, and introspection deep enough to
/// reach host state.
pub const PY_MODULE_DENYLIST: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "pathlib",
    "io",
    "codecs",
    "tempfile",
    "glob",
    "socket",
    "ssl",
    "http",
    "urllib",
    "ftplib",
    "smtplib",
    "poplib",
    "imaplib",
    "telnetlib",
    "socketserver",
    "asyncio",
    "ctypes",
    "importlib",
    "multiprocessing",
    "threading",
    "signal",
    "resource",
    "pty",
    "tty",
    "fcntl",
    "termios",
    "selectors",
    "webbrowser",
    "pickle",
    "marshal",
    "sysconfig",
    "site",
    "inspect",
    "builtins",
    "gc",
];

/// How a module list is to be interpreted by the shim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleMode {
    Allow,
    Deny,
}

/// Module policy as shipped in the init frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePolicy {
    pub mode: ModuleMode,
    pub modules: Vec<String>,
}

impl ModulePolicy {
    pub fn javascript() -> Self {
        Self {
            mode: ModuleMode::Allow,
            modules: JS_MODULE_ALLOWLIST.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn python() -> Self {
        Self {
            mode: ModuleMode::Deny,
            modules: PY_MODULE_DENYLIST.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// What the shim does to a symbol at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityAction {
    /// Delete / undefine the symbol
    Remove,
    /// Freeze the object in place
    Freeze,
    /// Replace with the shim's validating wrapper
    Wrap,
}

/// One entry of the capability manifest
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRule {
    pub path: String,
    pub action: CapabilityAction,
}

impl CapabilityRule {
    fn new(path: &str, action: CapabilityAction) -> Self {
        Self {
            path: path.to_string(),
            action,
        }
    }
}

/// Manifest applied by the JavaScript shim: strip process control and
/// host networking from the global scope, freeze the (already scrubbed)
/// environment.
pub fn javascript_manifest() -> Vec<CapabilityRule> {
    use CapabilityAction::*;
    [
        ("process.binding", Remove),
        ("process.dlopen", Remove),
        ("process._linkedBinding", Remove),
        ("process.kill", Remove),
        ("process.chdir", Remove),
        ("process.abort", Remove),
        ("process.reallyExit", Remove),
        ("process.setuid", Remove),
        ("process.setgid", Remove),
        ("process.env", Freeze),
        ("fetch", Remove),
        ("XMLHttpRequest", Remove),
        ("WebSocket", Remove),
        ("Bun", Remove),
    ]
    .iter()
    .map(|(p, a)| CapabilityRule::new(p, *a))
    .collect()
}

/// Manifest applied by the Python shim: route `open` through the
/// filesystem jail, route `__import__` through the deny-list hook, and
/// drop interactive/debug builtins from the execution scope.
pub fn python_manifest() -> Vec<CapabilityRule> {
    use CapabilityAction::*;
    [
        ("open", Wrap),
        ("__import__", Wrap),
        ("breakpoint", Remove),
        ("input", Remove),
        ("help", Remove),
        ("exit", Remove),
        ("quit", Remove),
    ]
    .iter()
    .map(|(p, a)| CapabilityRule::new(p, *a))
    .collect()
}

// Column-0 import statements only; indented or string-built imports are
// the runtime hook's job.
static IMPORT_STMT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?:import|from)[ \t]+([A-Za-z_][A-Za-z0-9_.]*)").unwrap());

static IMPORT_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"__import__\s*\(\s*['"]([A-Za-z_][A-Za-z0-9_.]*)"#).unwrap());

/// Fast static scan of Python source for denied imports. Returns the
/// first denied top-level module found, or None. A None result means
/// nothing — the runtime hook still checks every import the interpreter
/// actually performs.
pub fn static_import_check(code: &str, denylist: &[&str]) -> Option<String> {
    for caps in IMPORT_STMT_RE
        .captures_iter(code)
        .chain(IMPORT_CALL_RE.captures_iter(code))
    {
        let module = &caps[1];
        let top_level = module.split('.').next().unwrap_or(module);
        if denylist.contains(&top_level) {
            return Some(top_level.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_check_catches_plain_imports() {
        assert_eq!(
            static_import_check("import os\ndef main():\n    pass", PY_MODULE_DENYLIST),
            Some("os".to_string())
        );
        assert_eq!(
            static_import_check("from subprocess import run", PY_MODULE_DENYLIST),
            Some("subprocess".to_string())
        );
        assert_eq!(
            static_import_check("import os.path", PY_MODULE_DENYLIST),
            Some("os".to_string())
        );
    }

    #[test]
    fn test_static_check_catches_literal_dunder_import() {
        assert_eq!(
            static_import_check("x = __import__('socket')", PY_MODULE_DENYLIST),
            Some("socket".to_string())
        );
        assert_eq!(
            static_import_check(r#"m = __import__( "ctypes" )"#, PY_MODULE_DENYLIST),
            Some("ctypes".to_string())
        );
    }

    #[test]
    fn test_static_check_allows_benign_imports() {
        assert_eq!(
            static_import_check("import math\nimport json", PY_MODULE_DENYLIST),
            None
        );
    }

    #[test]
    fn test_static_check_known_bypasses_deferred_to_runtime_hook() {
        // Indented import: invisible to the column-0 scan on purpose.
        assert_eq!(
            static_import_check("def main():\n    import os\n", PY_MODULE_DENYLIST),
            None
        );
        // String-built import expression: same.
        assert_eq!(
            static_import_check("__import__('o' + 's')", PY_MODULE_DENYLIST),
            None
        );
    }

    #[test]
    fn test_module_policies() {
        let js = ModulePolicy::javascript();
        assert_eq!(js.mode, ModuleMode::Allow);
        assert!(js.modules.iter().any(|m| m == "lodash"));
        assert!(!js.modules.iter().any(|m| m == "fs" || m == "child_process"));

        let py = ModulePolicy::python();
        assert_eq!(py.mode, ModuleMode::Deny);
        assert!(py.modules.iter().any(|m| m == "os"));
    }

    #[test]
    fn test_manifest_wire_shape() {
        let rules = javascript_manifest();
        let v = serde_json::to_value(&rules).unwrap();
        assert_eq!(v[0]["path"], "process.binding");
        assert_eq!(v[0]["action"], "remove");
        let frozen = rules
            .iter()
            .find(|r| r.path == "process.env")
            .expect("env rule");
        assert_eq!(frozen.action, CapabilityAction::Freeze);
    }

    #[test]
    fn test_python_manifest_wraps_open_and_import() {
        let rules = python_manifest();
        for path in ["open", "__import__"] {
            let rule = rules.iter().find(|r| r.path == path).unwrap();
            assert_eq!(rule.action, CapabilityAction::Wrap);
        }
    }
}
