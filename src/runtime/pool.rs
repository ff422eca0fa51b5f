// src/runtime/pool.rs
//! Worker process pool
//!
//! One pool per language keeps `pool_size` interpreter processes warm and
//! hands them out under strict mutual exclusion:
//!
//! ```text
//! WorkerPool
//! ├─ idle:    [Worker, Worker, ...]   FIFO, available for acquire
//! ├─ busy:    counted; the Worker value is owned by the execution
//! └─ waiters: [oneshot, oneshot, ...] FIFO, served on release/respawn
//! ```
//!
//! A worker is idle xor busy, never both; a released worker is handed
//! straight to the oldest waiter without an idle round-trip. Any
//! unexpected loss (crash, timeout kill, failed ping, recycling) spawns
//! one replacement asynchronously while the pool is in its ready phase,
//! so capacity self-heals without spawn storms.

use crate::runtime::language::{Language, WorkerScript};
use crate::runtime::limits::ResolvedLimits;
use crate::runtime::protocol::{self, ControlFrame, ExecutionResult, InitFrame, PingFrame, TaskFrame};
use crate::runtime::worker::{self, run_task, TaskOutcome, Worker};
use crate::security::fsjail::ExecWorkspace;
use crate::security::netguard::{self, EgressPolicy};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{Result, SandboxError};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// When a healthy worker is retired anyway
#[derive(Debug, Clone, Copy)]
pub struct RecyclePolicy {
    /// Executions after which the worker is replaced
    pub max_uses: u32,
    /// Age after which the health check replaces it
    pub max_age: Duration,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    pub pool_size: usize,
}

struct PoolState {
    idle: VecDeque<Worker>,
    waiters: VecDeque<oneshot::Sender<Result<Worker>>>,
    /// Live workers (idle + busy + momentarily in a health-check ping)
    live: usize,
    busy: usize,
    ready: bool,
    shutting_down: bool,
    next_id: u64,
    /// Pid registry so shutdown can signal workers checked out by
    /// in-flight executions
    pids: HashMap<u64, u32>,
}

struct PoolInner {
    language: Language,
    pool_size: usize,
    init_frame: InitFrame,
    memory_ceiling_mb: u64,
    recycle: RecyclePolicy,
    script: WorkerScript,
    state: Mutex<PoolState>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(language: Language, pool_size: usize, cfg: &EngineConfig) -> Result<Self> {
        let script = WorkerScript::materialize(language)?;
        let egress = EgressPolicy::builtin();
        let init_frame = InitFrame::new(
            language.module_policy(),
            language.capability_manifest(),
            netguard::request_limits(&cfg.network),
            egress.cidr_strings(),
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                language,
                pool_size,
                init_frame,
                memory_ceiling_mb: cfg.limits.max_memory_mb,
                recycle: RecyclePolicy {
                    max_uses: cfg.pool.max_worker_reuse,
                    max_age: Duration::from_secs(cfg.pool.idle_worker_max_age_secs),
                },
                script,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    live: 0,
                    busy: 0,
                    ready: false,
                    shutting_down: false,
                    next_id: 0,
                    pids: HashMap::new(),
                }),
                health_task: Mutex::new(None),
            }),
        })
    }

    pub fn language(&self) -> Language {
        self.inner.language
    }

    /// Spawn all workers in parallel; resolves only once every one of
    /// them is ready, then starts the periodic health check. A failed
    /// spawn fails the whole init — the caller decides whether to retry
    /// or abort startup.
    pub async fn init(&self) -> Result<()> {
        let spawns = (0..self.inner.pool_size).map(|_| self.spawn_worker());
        futures::future::try_join_all(spawns).await?;
        self.inner.state.lock().await.ready = true;

        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.tick().await; // immediate first tick is not a check
            loop {
                ticker.tick().await;
                pool.run_health_check().await;
            }
        });
        *self.inner.health_task.lock().await = Some(handle);

        info!(
            language = %self.inner.language,
            workers = self.inner.pool_size,
            "worker pool preheated"
        );
        Ok(())
    }

    /// Spawn one worker and make it available: straight to the oldest
    /// waiter if any, otherwise onto the idle queue.
    async fn spawn_worker(&self) -> Result<()> {
        let id = {
            let mut st = self.inner.state.lock().await;
            let id = st.next_id;
            st.next_id += 1;
            id
        };
        let worker = Worker::spawn(
            id,
            self.inner.language,
            self.inner.script.path(),
            &self.inner.init_frame,
            self.inner.memory_ceiling_mb,
        )
        .await?;

        let mut st = self.inner.state.lock().await;
        if st.shutting_down {
            // Pool shut down while this spawn was in flight
            worker.terminate();
            return Ok(());
        }
        if let Some(pid) = worker.pid() {
            st.pids.insert(id, pid);
        }
        st.live += 1;
        Self::offer_worker(&mut st, worker);
        Ok(())
    }

    /// Hand a worker to the oldest live waiter or park it idle. Must be
    /// called with the state lock held.
    fn offer_worker(st: &mut PoolState, mut worker: Worker) {
        loop {
            match st.waiters.pop_front() {
                Some(tx) => {
                    st.busy += 1;
                    match tx.send(Ok(worker)) {
                        Ok(()) => return,
                        Err(returned) => {
                            // Waiter gave up; try the next one
                            st.busy -= 1;
                            match returned {
                                Ok(w) => worker = w,
                                Err(_) => return,
                            }
                        }
                    }
                }
                None => {
                    st.idle.push_back(worker);
                    return;
                }
            }
        }
    }

    /// Pop an idle worker or join the FIFO wait queue
    async fn acquire(&self) -> Result<Worker> {
        loop {
            let rx = {
                let mut st = self.inner.state.lock().await;
                if !st.ready {
                    return Err(SandboxError::PoolShuttingDown);
                }
                if let Some(mut w) = st.idle.pop_front() {
                    if w.has_exited() {
                        warn!(
                            language = %self.inner.language,
                            worker_id = w.id,
                            "worker exited while idle, replacing"
                        );
                        Self::forget_locked(&mut st, &w, false);
                        drop(st);
                        self.respawn_async();
                        continue;
                    }
                    st.busy += 1;
                    return Ok(w);
                }
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                rx
            };
            return rx.await.map_err(|_| SandboxError::PoolShuttingDown)?;
        }
    }

    /// Return a worker after a completed task. Past its reuse budget it
    /// is recycled instead; after shutdown it is terminated, never
    /// requeued.
    async fn release(&self, worker: Worker) {
        let mut st = self.inner.state.lock().await;
        if !st.ready {
            Self::forget_locked(&mut st, &worker, true);
            worker.terminate();
            return;
        }
        if worker.uses >= self.inner.recycle.max_uses {
            debug!(
                language = %self.inner.language,
                worker_id = worker.id,
                uses = worker.uses,
                "worker reached reuse budget, recycling"
            );
            Self::forget_locked(&mut st, &worker, true);
            drop(st);
            let mut worker = worker;
            worker.kill();
            self.respawn_async();
            return;
        }
        st.busy = st.busy.saturating_sub(1);
        Self::offer_worker(&mut st, worker);
    }

    /// Drop a worker that died or was killed while busy, and replace it
    async fn dispose(&self, mut worker: Worker) {
        worker.kill();
        let ready = {
            let mut st = self.inner.state.lock().await;
            Self::forget_locked(&mut st, &worker, true);
            st.ready
        };
        if ready {
            self.respawn_async();
        }
    }

    /// Erase a worker from the books. `was_busy` distinguishes workers
    /// checked out by an execution from idle/ping-limbo ones.
    fn forget_locked(st: &mut PoolState, worker: &Worker, was_busy: bool) {
        st.live = st.live.saturating_sub(1);
        if was_busy {
            st.busy = st.busy.saturating_sub(1);
        }
        st.pids.remove(&worker.id);
    }

    /// Best-effort asynchronous replacement; failures are logged, not
    /// retried recursively.
    fn respawn_async(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            if !pool.inner.state.lock().await.ready {
                return;
            }
            if let Err(e) = pool.spawn_worker().await {
                error!(
                    language = %pool.inner.language,
                    error = %e,
                    "failed to respawn worker"
                );
            }
        });
    }

    /// Run one task on a pooled worker. The worker is consumed by exactly
    /// one settlement branch, so a busy slot can never leak.
    pub async fn execute(
        &self,
        code: &str,
        variables: Map<String, Value>,
        limits: &ResolvedLimits,
        workspace: &ExecWorkspace,
    ) -> Result<ExecutionResult> {
        if code.trim().is_empty() {
            return Ok(ExecutionResult::failure("Code cannot be empty"));
        }

        let mut worker = self.acquire().await?;
        let task = TaskFrame {
            code: code.to_string(),
            variables,
            timeout_ms: limits.timeout_ms,
            exec_dir: workspace.path().display().to_string(),
            disk_quota_bytes: limits.disk_quota_bytes(),
        };

        if let Err(e) = worker.send_frame(&task).await {
            let message = format!("Worker communication error: {e}{}", worker.recent_stderr());
            self.dispose(worker).await;
            return Ok(ExecutionResult::failure(message));
        }

        match run_task(&mut worker, limits).await {
            TaskOutcome::Result(result) => {
                worker.uses += 1;
                self.release(worker).await;
                Ok(result)
            }
            TaskOutcome::Timeout => {
                warn!(
                    language = %self.inner.language,
                    worker_id = worker.id,
                    timeout_ms = limits.timeout_ms,
                    "execution timed out, killing worker"
                );
                self.dispose(worker).await;
                Ok(ExecutionResult::failure(format!(
                    "Script execution timed out after {}ms",
                    limits.timeout_ms
                )))
            }
            TaskOutcome::MemoryExceeded { rss_bytes } => {
                warn!(
                    language = %self.inner.language,
                    worker_id = worker.id,
                    rss_mb = rss_bytes / (1024 * 1024),
                    limit_mb = limits.memory_mb,
                    "worker exceeded memory limit, killing"
                );
                self.dispose(worker).await;
                Ok(ExecutionResult::failure(format!(
                    "Memory limit exceeded: {}MB allowed",
                    limits.memory_mb
                )))
            }
            TaskOutcome::Crashed { detail } => {
                self.dispose(worker).await;
                Ok(ExecutionResult::failure(format!(
                    "Worker crashed during execution ({detail})"
                )))
            }
        }
    }

    /// Ping every idle worker. Idle workers are drained out of the idle
    /// queue under the lock before being ping'd, so a concurrent acquire
    /// can never race the health check onto the same worker.
    pub async fn run_health_check(&self) {
        let drained: Vec<Worker> = {
            let mut st = self.inner.state.lock().await;
            if !st.ready {
                return;
            }
            st.idle.drain(..).collect()
        };

        for mut worker in drained {
            if worker.has_exited() {
                warn!(
                    language = %self.inner.language,
                    worker_id = worker.id,
                    "worker died while idle, replacing"
                );
                self.retire_idle(worker).await;
                continue;
            }
            if worker.age() > self.inner.recycle.max_age {
                debug!(
                    language = %self.inner.language,
                    worker_id = worker.id,
                    "idle worker exceeded max age, recycling"
                );
                self.retire_idle(worker).await;
                continue;
            }
            match self.ping(&mut worker).await {
                Ok(()) => {
                    let mut st = self.inner.state.lock().await;
                    if st.ready {
                        Self::offer_worker(&mut st, worker);
                    } else {
                        Self::forget_locked(&mut st, &worker, false);
                        worker.terminate();
                    }
                }
                Err(reason) => {
                    warn!(
                        language = %self.inner.language,
                        worker_id = worker.id,
                        %reason,
                        "replacing worker"
                    );
                    self.retire_idle(worker).await;
                }
            }
        }
    }

    async fn retire_idle(&self, mut worker: Worker) {
        worker.kill();
        let ready = {
            let mut st = self.inner.state.lock().await;
            Self::forget_locked(&mut st, &worker, false);
            st.ready
        };
        if ready {
            self.respawn_async();
        }
    }

    async fn ping(&self, worker: &mut Worker) -> std::result::Result<(), String> {
        if let Err(e) = worker.send_frame(&PingFrame::new()).await {
            return Err(format!("health check write error: {e}"));
        }
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, worker.next_line()).await {
            Err(_) => Err("health check timeout (no pong)".to_string()),
            Ok(None) => Err("health check stream closed".to_string()),
            Ok(Some(line)) => match protocol::parse_control(&line) {
                Some(ControlFrame::Pong) => Ok(()),
                Some(_) => Err("health check invalid response".to_string()),
                None => Err("health check parse error".to_string()),
            },
        }
    }

    /// Stop the health check, reject queued waiters, signal every worker,
    /// clear the books. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.health_task.lock().await.take() {
            handle.abort();
        }
        let mut st = self.inner.state.lock().await;
        st.ready = false;
        st.shutting_down = true;
        for tx in st.waiters.drain(..) {
            let _ = tx.send(Err(SandboxError::PoolShuttingDown));
        }
        let idle: Vec<Worker> = st.idle.drain(..).collect();
        for worker in idle {
            st.pids.remove(&worker.id);
            worker.terminate();
        }
        // Workers checked out by in-flight executions only exist in the
        // pid registry; signal them there.
        for (_, pid) in st.pids.drain() {
            worker::terminate_pid(pid);
        }
        st.live = 0;
        st.busy = 0;
        info!(language = %self.inner.language, "worker pool shut down");
    }

    pub async fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock().await;
        PoolStats {
            total: st.live,
            idle: st.idle.len(),
            busy: st.busy,
            queued: st.waiters.len(),
            pool_size: self.inner.pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::limits::RequestedLimits;
    use serde_json::json;

    fn python_missing() -> bool {
        let missing = which::which("python3").is_err();
        if missing {
            eprintln!("python3 not found in PATH, skipping pool test");
        }
        missing
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
    }

    async fn python_pool(size: usize) -> WorkerPool {
        let pool = WorkerPool::new(Language::Python, size, &test_config()).unwrap();
        pool.init().await.unwrap();
        pool
    }

    fn limits_with_timeout(timeout_ms: u64) -> ResolvedLimits {
        ResolvedLimits::resolve(
            Some(&RequestedLimits {
                timeout_ms: Some(timeout_ms),
                ..Default::default()
            }),
            &test_config().limits,
        )
    }

    async fn run(pool: &WorkerPool, code: &str, variables: Map<String, Value>) -> ExecutionResult {
        let workspace = ExecWorkspace::create(1024 * 1024).unwrap();
        pool.execute(code, variables, &limits_with_timeout(10_000), &workspace)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_init_stats() {
        if python_missing() {
            return;
        }
        let pool = python_pool(2).await;
        let s = pool.stats().await;
        assert_eq!(s.total, 2);
        assert_eq!(s.idle, 2);
        assert_eq!(s.busy, 0);
        assert_eq!(s.queued, 0);
        assert_eq!(s.pool_size, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_zeroes_stats_and_is_idempotent() {
        if python_missing() {
            return;
        }
        let pool = python_pool(2).await;
        pool.shutdown().await;
        pool.shutdown().await;
        let s = pool.stats().await;
        assert_eq!(s.total, 0);
        assert_eq!(s.idle, 0);
        assert_eq!(s.busy, 0);
    }

    #[tokio::test]
    async fn test_execute_returns_worker_to_idle() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        let result = run(&pool, "def main():\n    return {'ok': True}", Map::new()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.data.unwrap().code_return, json!({"ok": true}));
        let s = pool.stats().await;
        assert_eq!(s.idle, 1);
        assert_eq!(s.busy, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_code_rejected_without_touching_workers() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        let result = run(&pool, "   \n  ", Map::new()).await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("empty"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_size_one_pool_all_succeed() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        let mut handles = Vec::new();
        for i in 0..5 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut variables = Map::new();
                variables.insert("idx".into(), json!(i));
                run(
                    &pool,
                    "def main(variables):\n    return {'idx': variables['idx']}",
                    variables,
                )
                .await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert!(result.success, "{result:?}");
            assert_eq!(result.data.unwrap().code_return, json!({"idx": i}));
        }
        let s = pool.stats().await;
        assert_eq!(s.total, 1);
        assert_eq!(s.idle, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_settles_within_grace_and_capacity_survives() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        let workspace = ExecWorkspace::create(0).unwrap();
        let start = std::time::Instant::now();
        let result = pool
            .execute(
                "def main():\n    while True:\n        pass",
                Map::new(),
                &limits_with_timeout(1_000),
                &workspace,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.unwrap().to_lowercase().contains("timed out"));
        // Worker-side timeout fires before the host deadline (1s + 2s grace)
        assert!(start.elapsed() < Duration::from_millis(4_000));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let result = run(&pool, "def main():\n    return {'recovered': True}", Map::new()).await;
        assert!(result.success, "{result:?}");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_crash_reported_and_replaced() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        // SystemExit is not caught by the shim's handler; the process dies
        let result = run(
            &pool,
            "def main():\n    raise SystemExit(1)",
            Map::new(),
        )
        .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("crashed"));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let result = run(&pool, "def main():\n    return 1", Map::new()).await;
        assert!(result.success, "{result:?}");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_waiters() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let workspace = ExecWorkspace::create(0).unwrap();
                pool.execute(
                    "import time\ndef main():\n    time.sleep(3)\n    return {'done': True}",
                    Map::new(),
                    &limits_with_timeout(10_000),
                    &workspace,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let workspace = ExecWorkspace::create(0).unwrap();
                pool.execute(
                    "def main():\n    return {'queued': True}",
                    Map::new(),
                    &limits_with_timeout(10_000),
                    &workspace,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.stats().await.queued, 1);

        pool.shutdown().await;
        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(err, SandboxError::PoolShuttingDown));
        let _ = slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_keeps_healthy_workers() {
        if python_missing() {
            return;
        }
        let pool = python_pool(2).await;
        for _ in 0..3 {
            pool.run_health_check().await;
        }
        let s = pool.stats().await;
        assert_eq!(s.total, 2);
        assert_eq!(s.idle, 2);
        let result = run(&pool, "def main():\n    return {'alive': True}", Map::new()).await;
        assert!(result.success, "{result:?}");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_check_replaces_dead_idle_worker() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        // Kill the idle worker behind the pool's back
        {
            let mut st = pool.inner.state.lock().await;
            if let Some(w) = st.idle.front_mut() {
                w.kill();
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.run_health_check().await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(pool.stats().await.total, 1);
        let result = run(&pool, "def main():\n    return {'replaced': True}", Map::new()).await;
        assert!(result.success, "{result:?}");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiter_served_while_health_check_holds_worker() {
        if python_missing() {
            return;
        }
        let pool = python_pool(1).await;
        // Ping in the background; the worker is out of the idle queue
        // for the duration, so the execute below has to queue and then
        // be served by the post-pong handoff.
        let checker = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run_health_check().await })
        };
        let result = run(&pool, "def main():\n    return {'fromWaiter': True}", Map::new()).await;
        assert!(result.success, "{result:?}");
        checker.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reuse_budget_recycles_worker() {
        if python_missing() {
            return;
        }
        let mut cfg = test_config();
        cfg.pool.max_worker_reuse = 2;
        let pool = WorkerPool::new(Language::Python, 1, &cfg).unwrap();
        pool.init().await.unwrap();

        let first_id = {
            let st = pool.inner.state.lock().await;
            st.idle.front().map(|w| w.id).unwrap()
        };
        for _ in 0..3 {
            let result = run(&pool, "def main():\n    return 1", Map::new()).await;
            assert!(result.success, "{result:?}");
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
        let current_id = {
            let st = pool.inner.state.lock().await;
            st.idle.front().map(|w| w.id).unwrap()
        };
        assert_ne!(first_id, current_id, "worker should have been recycled");
        pool.shutdown().await;
    }
}
