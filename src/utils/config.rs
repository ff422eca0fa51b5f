// src/utils/config.rs
//! Engine configuration
//!
//! One resolved `EngineConfig` is built at startup from environment
//! variables (prefix `SANDBOX_`, `__` as the nesting separator, e.g.
//! `SANDBOX_LIMITS__MAX_TIMEOUT_MS=30000`) layered over an optional
//! `sandbox.yaml` file. The rest of the engine only ever sees this
//! struct; nothing below the binary entry point reads the environment.

use crate::utils::errors::{Result, SandboxError};
use serde::Deserialize;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub network: NetworkConfig,
    pub pool: PoolSettings,
}

/// HTTP front door settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on /sandbox/* routes; None disables auth
    pub bearer_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3060,
            bearer_token: None,
        }
    }
}

/// Per-request resource limit defaults and hard ceilings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub default_memory_mb: u64,
    pub max_memory_mb: u64,
    pub default_disk_mb: u64,
    pub max_disk_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            default_memory_mb: 256,
            max_memory_mb: 1024,
            default_disk_mb: 64,
            max_disk_mb: 512,
        }
    }
}

/// Caps on the outbound `httpRequest` helper exposed to user code
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Max outbound requests per execution
    pub max_requests: u32,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Max response body size in megabytes
    pub max_response_size_mb: u64,
    /// Max request body size in megabytes
    pub max_request_body_size_mb: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            request_timeout_ms: 60_000,
            max_response_size_mb: 2,
            max_request_body_size_mb: 1,
        }
    }
}

/// Pool sizing and worker recycling policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Warmed workers per language; 0 disables the pool for that
    /// language and routes its requests through the cold-spawn path
    pub javascript_pool_size: usize,
    pub python_pool_size: usize,
    /// Bound on concurrent cold-spawn executions (admission semaphore)
    pub max_cold_spawns: usize,
    /// Executions after which a worker is recycled even if healthy
    pub max_worker_reuse: u32,
    /// Workers older than this are recycled by the health check
    pub idle_worker_max_age_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            javascript_pool_size: 4,
            python_pool_size: 4,
            max_cold_spawns: 8,
            max_worker_reuse: 64,
            idle_worker_max_age_secs: 3600,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `sandbox.yaml` (optional) and `SANDBOX_*`
    /// environment variables, environment winning
    pub fn load() -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name("sandbox").required(false))
            .add_source(config::Environment::with_prefix("SANDBOX").separator("__"))
            .build()
            .map_err(|e| SandboxError::Config(e.to_string()))?;

        let cfg: EngineConfig = raw
            .try_deserialize()
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot produce valid resolved limits
    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        if l.max_timeout_ms == 0 || l.max_memory_mb == 0 || l.max_disk_mb == 0 {
            return Err(SandboxError::Config(
                "limit ceilings must be greater than zero".into(),
            ));
        }
        if l.default_timeout_ms > l.max_timeout_ms {
            return Err(SandboxError::Config(format!(
                "default_timeout_ms {} exceeds max_timeout_ms {}",
                l.default_timeout_ms, l.max_timeout_ms
            )));
        }
        if l.default_memory_mb > l.max_memory_mb {
            return Err(SandboxError::Config(format!(
                "default_memory_mb {} exceeds max_memory_mb {}",
                l.default_memory_mb, l.max_memory_mb
            )));
        }
        if l.default_disk_mb > l.max_disk_mb {
            return Err(SandboxError::Config(format!(
                "default_disk_mb {} exceeds max_disk_mb {}",
                l.default_disk_mb, l.max_disk_mb
            )));
        }
        if self.network.max_requests == 0 {
            return Err(SandboxError::Config("max_requests cannot be 0".into()));
        }
        Ok(())
    }
}
