// src/security/mod.rs
//! Security boundary policy
//!
//! The OS process boundary is the primary isolation unit. Inside it the
//! interpreter is hardened by the worker shim according to policy
//! generated here: module allow/deny lists and a capability manifest
//! (`policy`), the outbound-network egress block-list and request caps
//! (`netguard`), and the per-execution filesystem jail (`fsjail`).
//!
//! Known residual risk, accepted and documented rather than papered
//! over: a pooled interpreter process is reused across unrelated
//! executions, so implicit global state set by one execution (undeclared
//! globals, monkey-patched builtins) can in principle be observed by a
//! later one in the same worker. The shims rebuild the execution scope
//! per task and the pool force-recycles workers after a configurable
//! number of uses, which reduces but does not eliminate the exposure.
//! Tests assert the guarantees actually held — environment, variables
//! and log isolation — not full interpreter-state isolation.

pub mod fsjail;
pub mod netguard;
pub mod policy;

pub use fsjail::ExecWorkspace;
pub use netguard::EgressPolicy;
pub use policy::{CapabilityAction, CapabilityRule, ModuleMode, ModulePolicy};
