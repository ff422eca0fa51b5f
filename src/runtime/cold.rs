// src/runtime/cold.rs
//! Cold-spawn execution path
//!
//! Used when a language has no warmed pool: a fresh interpreter is
//! spawned for the single task and killed afterwards. Total concurrency
//! of this path is bounded system-wide by the admission semaphore,
//! independent of any pool sizing.

use crate::runtime::admission::AdmissionSemaphore;
use crate::runtime::language::{Language, WorkerScript};
use crate::runtime::limits::ResolvedLimits;
use crate::runtime::protocol::{ExecutionResult, InitFrame, TaskFrame};
use crate::runtime::worker::{run_task, TaskOutcome, Worker};
use crate::security::fsjail::ExecWorkspace;
use crate::security::netguard::{self, EgressPolicy};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub struct ColdRunner {
    admission: AdmissionSemaphore,
    scripts: HashMap<Language, WorkerScript>,
    init_frames: HashMap<Language, InitFrame>,
    memory_ceiling_mb: u64,
    next_id: AtomicU64,
}

impl ColdRunner {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        let egress = EgressPolicy::builtin();
        let mut scripts = HashMap::new();
        let mut init_frames = HashMap::new();
        for &language in Language::ALL {
            scripts.insert(language, WorkerScript::materialize(language)?);
            init_frames.insert(
                language,
                InitFrame::new(
                    language.module_policy(),
                    language.capability_manifest(),
                    netguard::request_limits(&cfg.network),
                    egress.cidr_strings(),
                ),
            );
        }
        Ok(Self {
            admission: AdmissionSemaphore::new(cfg.pool.max_cold_spawns),
            scripts,
            init_frames,
            memory_ceiling_mb: cfg.limits.max_memory_mb,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn admission(&self) -> &AdmissionSemaphore {
        &self.admission
    }

    /// Spawn, run one task, kill. The permit is held for the whole
    /// lifetime of the process.
    pub async fn execute(
        &self,
        language: Language,
        code: &str,
        variables: Map<String, Value>,
        limits: &ResolvedLimits,
        workspace: &ExecWorkspace,
    ) -> Result<ExecutionResult> {
        if code.trim().is_empty() {
            return Ok(ExecutionResult::failure("Code cannot be empty"));
        }

        let _permit = self.admission.acquire().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%language, worker_id = id, "cold-spawning worker");

        let script = &self.scripts[&language];
        let init = &self.init_frames[&language];
        let mut worker =
            match Worker::spawn(id, language, script.path(), init, self.memory_ceiling_mb).await {
                Ok(worker) => worker,
                Err(e) => {
                    warn!(%language, error = %e, "cold spawn failed");
                    return Ok(ExecutionResult::failure(format!(
                        "Failed to start sandbox worker: {e}"
                    )));
                }
            };

        let task = TaskFrame {
            code: code.to_string(),
            variables,
            timeout_ms: limits.timeout_ms,
            exec_dir: workspace.path().display().to_string(),
            disk_quota_bytes: limits.disk_quota_bytes(),
        };
        if let Err(e) = worker.send_frame(&task).await {
            let message = format!("Worker communication error: {e}{}", worker.recent_stderr());
            worker.kill();
            return Ok(ExecutionResult::failure(message));
        }

        let outcome = run_task(&mut worker, limits).await;
        worker.kill();
        Ok(match outcome {
            TaskOutcome::Result(result) => result,
            TaskOutcome::Timeout => ExecutionResult::failure(format!(
                "Script execution timed out after {}ms",
                limits.timeout_ms
            )),
            TaskOutcome::MemoryExceeded { .. } => ExecutionResult::failure(format!(
                "Memory limit exceeded: {}MB allowed",
                limits.memory_mb
            )),
            TaskOutcome::Crashed { detail } => {
                ExecutionResult::failure(format!("Worker crashed during execution ({detail})"))
            }
        })
    }
}
