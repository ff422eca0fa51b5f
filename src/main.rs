// src/main.rs
//! Sandbox Engine
//!
//! Multi-tenant sandbox service executing untrusted JavaScript and
//! Python under strict resource and capability constraints.

use anyhow::Result;
use sandbox_engine::observability::{init_metrics, init_tracing};
use sandbox_engine::server::ApiServer;
use sandbox_engine::{EngineConfig, SandboxExecutor};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let metrics = init_metrics()?;

    info!("Starting Sandbox Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load()?;
    info!(
        js_pool = config.pool.javascript_pool_size,
        python_pool = config.pool.python_pool_size,
        "Configuration loaded"
    );

    let executor = Arc::new(SandboxExecutor::new(config.clone())?);
    info!("Preheating worker pools");
    executor.init().await?;

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Received shutdown signal, cleaning up...");
    };

    let server = ApiServer::new(Arc::clone(&executor), config.server.clone(), Some(metrics));
    let served = server.run(shutdown_signal).await;

    executor.shutdown().await;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}
