// src/executor/mod.rs
//! Execution façade
//!
//! The single public entry point for running untrusted code. Validates
//! the request, runs the cheap host-side security pre-checks, resolves
//! limits against the deployment ceilings, creates the per-execution
//! workspace, and routes the task to the language's warmed pool (or the
//! admission-bounded cold path when no pool is configured).
//!
//! Every failure mode below this point — input validation, security
//! rejection, resource exhaustion, worker infrastructure failure, user
//! code errors — terminates in an `ExecutionResult`. Nothing escapes as
//! a panic or an unbounded hang.

use crate::runtime::cold::ColdRunner;
use crate::runtime::language::Language;
use crate::runtime::limits::ResolvedLimits;
use crate::runtime::pool::{PoolStats, WorkerPool};
use crate::runtime::protocol::{ExecutionRequest, ExecutionResult};
use crate::security::fsjail::ExecWorkspace;
use crate::security::policy::{self, PY_MODULE_DENYLIST};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};
use ulid::Ulid;

pub struct SandboxExecutor {
    config: EngineConfig,
    pools: HashMap<Language, WorkerPool>,
    cold: ColdRunner,
}

impl SandboxExecutor {
    /// Build pools for every language with a non-zero size plus the cold
    /// runner. Workers are not spawned until [`init`](Self::init).
    pub fn new(config: EngineConfig) -> Result<Self> {
        let mut pools = HashMap::new();
        for (&language, size) in [
            (&Language::JavaScript, config.pool.javascript_pool_size),
            (&Language::Python, config.pool.python_pool_size),
        ] {
            if size > 0 {
                pools.insert(language, WorkerPool::new(language, size, &config)?);
            }
        }
        let cold = ColdRunner::new(&config)?;
        Ok(Self {
            config,
            pools,
            cold,
        })
    }

    /// Preheat every configured pool; resolves once all workers are ready
    pub async fn init(&self) -> Result<()> {
        for pool in self.pools.values() {
            pool.init().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }

    /// Pool occupancy per language, for the health endpoint
    pub async fn pool_stats(&self) -> HashMap<&'static str, PoolStats> {
        let mut stats = HashMap::new();
        for (language, pool) in &self.pools {
            stats.insert(language.as_str(), pool.stats().await);
        }
        stats
    }

    /// Execute one request. Infallible by design: every error becomes an
    /// in-band failure result.
    pub async fn execute(&self, language: Language, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = Ulid::new();
        let started = Instant::now();

        let result = self.execute_inner(language, request, execution_id).await;

        let outcome = if result.success { "success" } else { "failure" };
        counter!(
            "sandbox_executions_total",
            "language" => language.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("sandbox_execution_duration_seconds", "language" => language.as_str())
            .record(started.elapsed().as_secs_f64());

        info!(
            execution_id = %execution_id,
            %language,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution settled"
        );
        result
    }

    async fn execute_inner(
        &self,
        language: Language,
        request: ExecutionRequest,
        execution_id: Ulid,
    ) -> ExecutionResult {
        let Some(code) = request.code_str() else {
            return ExecutionResult::failure("Code cannot be empty");
        };

        // Fast-path rejection of obviously denied Python imports. The
        // authoritative gate stays the runtime hook inside the worker.
        if language == Language::Python {
            if let Some(module) = policy::static_import_check(code, PY_MODULE_DENYLIST) {
                return ExecutionResult::failure(format!(
                    "Module '{module}' is not allowed in sandbox"
                ));
            }
        }

        let limits = ResolvedLimits::resolve(request.limits.as_ref(), &self.config.limits);
        let workspace = match ExecWorkspace::create(limits.disk_quota_bytes()) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "workspace creation failed");
                return ExecutionResult::failure(format!("Failed to prepare sandbox: {e}"));
            }
        };

        info!(
            execution_id = %execution_id,
            %language,
            code_len = code.len(),
            timeout_ms = limits.timeout_ms,
            pooled = self.pools.contains_key(&language),
            "executing code"
        );

        let outcome = match self.pools.get(&language) {
            Some(pool) => {
                pool.execute(code, request.variables.clone(), &limits, &workspace)
                    .await
            }
            None => {
                self.cold
                    .execute(language, code, request.variables.clone(), &limits, &workspace)
                    .await
            }
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "execution not admitted");
                ExecutionResult::failure(format!("Sandbox unavailable: {e}"))
            }
        }
    }
}
