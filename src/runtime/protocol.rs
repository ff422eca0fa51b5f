// src/runtime/protocol.rs
//! Worker IPC protocol
//!
//! A worker is addressed purely through newline-delimited JSON frames over
//! its stdin/stdout; stderr is diagnostic-only and never parsed. Exchange:
//!
//! ```text
//! host → worker   {"type":"init", ...}            exactly once, first write
//! worker → host   {"type":"ready"}                exactly once, first line
//!                 {"type":"init-failed","message":"..."} on boot failure
//! host → worker   {"type":"ping"}                 idle keep-alive
//! worker → host   {"type":"pong"}
//! host → worker   {"code":...,"variables":...}    task request
//! worker → host   {"success":...}                 task result
//! ```
//!
//! There are no sequence numbers: request/response pairing relies on the
//! pool never having more than one task in flight per worker.

use crate::security::policy::{CapabilityRule, ModulePolicy};
use crate::utils::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// First frame written to a freshly spawned worker. Carries the whole
/// security policy so the shim needs no other configuration channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub module_policy: ModulePolicy,
    pub capability_manifest: Vec<CapabilityRule>,
    pub request_limits: RequestLimitsFrame,
    /// CIDR ranges the in-worker network helper must refuse to reach
    pub blocked_cidrs: Vec<String>,
}

impl InitFrame {
    pub fn new(
        module_policy: ModulePolicy,
        capability_manifest: Vec<CapabilityRule>,
        request_limits: RequestLimitsFrame,
        blocked_cidrs: Vec<String>,
    ) -> Self {
        Self {
            kind: "init",
            module_policy,
            capability_manifest,
            request_limits,
            blocked_cidrs,
        }
    }
}

/// Outbound-request caps shipped to the worker, all sizes in bytes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLimitsFrame {
    pub max_requests: u32,
    pub timeout_ms: u64,
    pub max_response_size: u64,
    pub max_request_body_size: u64,
}

/// Idle keep-alive probe
#[derive(Debug, Serialize)]
pub struct PingFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl PingFrame {
    pub fn new() -> Self {
        Self { kind: "ping" }
    }
}

impl Default for PingFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Control frames a worker can send back
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    Ready,
    InitFailed {
        #[serde(default)]
        message: String,
    },
    Pong,
}

/// One task dispatched to a worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFrame {
    pub code: String,
    pub variables: Map<String, Value>,
    pub timeout_ms: u64,
    /// Private per-execution directory the filesystem jail roots into
    pub exec_dir: String,
    pub disk_quota_bytes: u64,
}

/// An execution request as it arrives at the façade. `code` is kept as a
/// raw JSON value so that null / non-string payloads fall into the same
/// "empty code" rejection instead of a deserialization error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub code: Value,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub limits: Option<crate::runtime::limits::RequestedLimits>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: Value::String(code.into()),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// The submitted code, if it is a string with non-whitespace content
    pub fn code_str(&self) -> Option<&str> {
        match &self.code {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }
}

/// The only value ever returned to a caller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ExecutionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionData {
    /// JSON-serializable value the user's `main` returned; null if none
    #[serde(rename = "codeReturn")]
    pub code_return: Value,
    /// Captured print/console output, newline-joined
    #[serde(default)]
    pub log: String,
}

impl ExecutionResult {
    pub fn ok(code_return: Value, log: String) -> Self {
        Self {
            success: true,
            data: Some(ExecutionData { code_return, log }),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Serialize a frame to a single protocol line (no trailing newline)
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    serde_json::to_string(frame).map_err(|e| SandboxError::Protocol(e.to_string()))
}

/// Parse a worker control line (`ready` / `init-failed` / `pong`)
pub fn parse_control(line: &str) -> Option<ControlFrame> {
    serde_json::from_str(line).ok()
}

/// Parse a worker result line; anything that is not a well-formed result
/// frame becomes an "Invalid worker response" failure rather than an error
pub fn parse_result(line: &str) -> ExecutionResult {
    serde_json::from_str(line)
        .unwrap_or_else(|_| ExecutionResult::failure("Invalid worker response"))
}
