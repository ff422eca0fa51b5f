// src/runtime/worker.rs
//! A single sandbox worker process
//!
//! One worker = one long-lived interpreter process with the security shim
//! preloaded. The host talks to it through newline-delimited JSON on
//! stdin/stdout; stderr is drained continuously into a small ring buffer
//! used only for diagnostics on failure. A worker is never shared by two
//! concurrent tasks: ownership of the `Worker` value *is* the busy state.

use crate::runtime::language::Language;
use crate::runtime::limits::ResolvedLimits;
use crate::runtime::protocol::{self, ControlFrame, InitFrame};
use crate::utils::errors::{Result, SandboxError};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

/// How long a spawned interpreter gets to report `ready`
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(120);

/// Most-recent stderr lines kept per worker
const STDERR_RING_CAPACITY: usize = 20;

/// Longest protocol line accepted from a worker (bounds result payloads)
const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Environment variables forwarded into worker processes. Everything
/// else — host secrets included — is scrubbed; user code only ever sees
/// what the host re-injects as `variables`.
const ENV_ALLOWLIST: &[&str] = &["PATH"];

pub fn scrubbed_env() -> Vec<(String, String)> {
    ENV_ALLOWLIST
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

pub struct Worker {
    pub id: u64,
    pub language: Language,
    pub(crate) child: Child,
    stdin: ChildStdin,
    pub(crate) lines: FramedRead<ChildStdout, LinesCodec>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    /// Tasks completed on this worker; drives forced recycling
    pub uses: u32,
    spawned_at: Instant,
}

impl Worker {
    /// Spawn an interpreter with scrubbed environment and piped stdio,
    /// deliver the init frame, and wait for `ready` on the first stdout
    /// line under the spawn timeout.
    pub async fn spawn(
        id: u64,
        language: Language,
        script: &Path,
        init: &InitFrame,
        memory_ceiling_mb: u64,
    ) -> Result<Self> {
        let interpreter = language.resolve_interpreter()?;
        debug!(worker_id = id, %language, interpreter = %interpreter.display(), "spawning worker");

        let mut cmd = Command::new(interpreter);
        cmd.args(language.interpreter_args())
            .arg(script)
            .env_clear()
            .envs(scrubbed_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Best-effort address-space cap: user ceiling + interpreter
        // baseline. Not supported everywhere (and not applicable to
        // every interpreter); never fatal.
        #[cfg(target_os = "linux")]
        if let Some(bytes) = language.address_space_bytes(memory_ceiling_mb) {
            unsafe {
                cmd.pre_exec(move || {
                    use nix::sys::resource::{setrlimit, Resource};
                    let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
                    Ok(())
                });
            }
            debug!(worker_id = id, rlimit_as_bytes = bytes, "address-space limit requested");
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = memory_ceiling_mb;
            debug!(worker_id = id, "address-space limit not supported on this platform");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("failed to capture stderr".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut buf = tail.lock();
                if buf.len() == STDERR_RING_CAPACITY {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        });

        let mut worker = Self {
            id,
            language,
            child,
            stdin,
            lines: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            stderr_tail,
            uses: 0,
            spawned_at: Instant::now(),
        };

        worker.send_frame(init).await?;
        worker.await_ready().await?;
        debug!(worker_id = id, %language, "worker ready");
        Ok(worker)
    }

    async fn await_ready(&mut self) -> Result<()> {
        let first = tokio::time::timeout(SPAWN_TIMEOUT, self.lines.next()).await;
        match first {
            Err(_) => {
                self.kill();
                Err(SandboxError::InitFailed(format!(
                    "worker {} init timeout after {}ms{}",
                    self.id,
                    SPAWN_TIMEOUT.as_millis(),
                    self.recent_stderr()
                )))
            }
            Ok(None) => Err(SandboxError::InitFailed(format!(
                "worker {} exited during init{}",
                self.id,
                self.recent_stderr()
            ))),
            Ok(Some(Err(e))) => Err(SandboxError::WorkerIo(e.to_string())),
            Ok(Some(Ok(line))) => match protocol::parse_control(&line) {
                Some(ControlFrame::Ready) => Ok(()),
                Some(ControlFrame::InitFailed { message }) => Err(SandboxError::InitFailed(
                    format!("worker {} init failed: {message}", self.id),
                )),
                _ => Err(SandboxError::InitFailed(format!(
                    "worker {} invalid init response: {line}",
                    self.id
                ))),
            },
        }
    }

    /// Write one protocol frame followed by a newline
    pub async fn send_frame<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let mut line = protocol::encode(frame)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SandboxError::WorkerIo(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SandboxError::WorkerIo(e.to_string()))
    }

    /// Next stdout line; None on EOF or oversized/invalid framing
    pub async fn next_line(&mut self) -> Option<String> {
        match self.lines.next().await {
            Some(Ok(line)) => Some(line),
            Some(Err(e)) => {
                warn!(worker_id = self.id, error = %e, "worker output framing error");
                None
            }
            None => None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn age(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// True if the process has already exited
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Resident set size, Linux only; None elsewhere or on read failure
    #[cfg(target_os = "linux")]
    pub fn rss_bytes(&self) -> Option<u64> {
        let pid = self.child.id()?;
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn rss_bytes(&self) -> Option<u64> {
        None
    }

    /// SIGKILL, immediate and best-effort
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(worker_id = self.id, error = %e, "kill failed (already dead?)");
        }
    }

    /// SIGTERM for graceful shutdown paths
    pub fn terminate(&self) {
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    /// Recent stderr formatted for error messages; empty when quiet
    pub fn recent_stderr(&self) -> String {
        let buf = self.stderr_tail.lock();
        if buf.is_empty() {
            String::new()
        } else {
            format!(
                " | stderr: {}",
                buf.iter().cloned().collect::<Vec<_>>().join("\n")
            )
        }
    }
}

/// SIGTERM a process by pid; used at shutdown for workers currently
/// checked out by executions (their `Worker` value lives elsewhere).
pub fn terminate_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// How a dispatched task settled. Exactly one of these happens per task;
/// the caller decides whether the worker survives.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The worker produced a result line (possibly a failure result)
    Result(crate::runtime::protocol::ExecutionResult),
    /// The host deadline (`timeout + grace`) elapsed first
    Timeout,
    /// The RSS probe caught the worker above its memory limit
    MemoryExceeded { rss_bytes: u64 },
    /// The process exited before producing a response line
    Crashed { detail: String },
}

/// Await settlement of the task already written to the worker: races the
/// next stdout line against the host deadline, unexpected process exit,
/// and (Linux) a 200ms RSS probe against the memory limit. The grace in
/// the deadline lets the interpreter's own timeout fire first.
pub async fn run_task(worker: &mut Worker, limits: &ResolvedLimits) -> TaskOutcome {
    let deadline = tokio::time::sleep(Duration::from_millis(limits.host_deadline_ms()));
    tokio::pin!(deadline);
    let mut rss_poll = tokio::time::interval(Duration::from_millis(200));
    rss_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let memory_limit = limits.memory_bytes();

    loop {
        tokio::select! {
            biased;
            line = worker.lines.next() => {
                return match line {
                    Some(Ok(line)) => {
                        TaskOutcome::Result(crate::runtime::protocol::parse_result(&line))
                    }
                    Some(Err(_)) => TaskOutcome::Result(
                        crate::runtime::protocol::ExecutionResult::failure(
                            "Invalid worker response",
                        ),
                    ),
                    None => TaskOutcome::Crashed {
                        detail: format!("stdout closed{}", worker.recent_stderr()),
                    },
                };
            }
            _ = &mut deadline => return TaskOutcome::Timeout,
            status = worker.child.wait() => {
                let exit = status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return TaskOutcome::Crashed {
                    detail: format!("{exit}{}", worker.recent_stderr()),
                };
            }
            _ = rss_poll.tick() => {
                if let Some(rss) = worker.rss_bytes() {
                    if rss > memory_limit {
                        return TaskOutcome::MemoryExceeded { rss_bytes: rss };
                    }
                }
            }
        }
    }
}
