// src/main.rs
//! Lab Kernel Engine
//!
//! Serves one JSON request per stdin line and writes one JSON response per
//! stdout line. Requests are handled concurrently; each response echoes the
//! request's `id`. Logs go to stderr.

use anyhow::{Context, Result};
use futures::StreamExt;
use lab_kernel_engine::observability::{init_metrics, init_tracing};
use lab_kernel_engine::utils::config::EngineConfig;
use lab_kernel_engine::{KernelPool, LabService, PoolConfig, SubprocessLauncher, WorkspaceManager};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{error, info, warn};

/// Largest request line accepted (code is capped separately)
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(config.observability.log_json)?;
    if let Some(addr) = config.observability.metrics_addr {
        init_metrics(addr)?;
    }

    info!("Starting Lab Kernel Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let workspaces = WorkspaceManager::new(config.workspace.clone())
        .context("failed to prepare workspace root")?;
    let launcher = SubprocessLauncher::new(config.kernel.clone())
        .context("kernel interpreter unavailable")?
        .with_workspaces(workspaces.clone());

    let pool = KernelPool::new(PoolConfig::from(&config.pool), Arc::new(launcher));
    let sweeper = pool.spawn_sweeper();
    let service = Arc::new(LabService::new(Arc::clone(&pool), workspaces));

    let (replies, mut outgoing) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = outgoing.recv().await {
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("Failed to write response: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut requests = FramedRead::new(
        tokio::io::stdin(),
        LinesCodec::new_with_max_length(MAX_REQUEST_BYTES),
    );

    info!("Ready for requests on stdin");
    loop {
        tokio::select! {
            line = requests.next() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let service = Arc::clone(&service);
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        let reply = service.handle_line(&line).await;
                        let _ = replies.send(reply);
                    });
                }
                Some(Err(e)) => {
                    warn!("Unreadable request line: {}", e);
                    let reply = service.handle_line("").await;
                    let _ = replies.send(reply);
                }
                None => {
                    info!("stdin closed, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    let terminated = pool.shutdown_all().await;
    info!("Terminated {} kernels", terminated);
    if let Err(e) = sweeper.await {
        warn!("Sweeper task ended abnormally: {}", e);
    }

    // in-flight handlers still hold sender clones; give them a moment to finish
    drop(replies);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), writer).await;

    info!("Engine stopped");
    Ok(())
}
