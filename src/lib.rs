//! SiteMedic -- Appliance-grade website quality testing orchestrator.
//!
//! This crate provides the client-side orchestration core for a suite of
//! website quality tests (stress, security, API, SEO, performance,
//! compatibility): submission, concurrency-limited admission, progress
//! fan-out to observers, cancellation, and recurring schedules. The tests
//! themselves run on a remote runner backend.

pub mod api;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::backend::HttpRunnerBackend;
use crate::config::Config;
use crate::engine::Orchestrator;
use crate::scheduler::Scheduler;

/// Start the SiteMedic daemon: API server, engine, and scheduler.
pub async fn serve(config: Config) -> Result<()> {
    tracing::info!(db_path = %config.daemon.db_path, "initializing task store");
    if let Some(parent) = std::path::Path::new(&config.daemon.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let pool = storage::open_pool(&config.daemon.db_path)?;

    let backend = Arc::new(HttpRunnerBackend::new(&config.daemon.runner_url));
    let engine = Orchestrator::new(backend, &config.engine, &config.transport, &config.retry);

    let scheduler = Scheduler::new(pool, engine.clone());
    scheduler.seed_defaults().await?;

    let loop_scheduler = scheduler.clone();
    let tick = Duration::from_secs(config.daemon.scheduler_tick_secs);
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(loop_scheduler, tick).await;
    });

    let state = api::state::AppState { engine, scheduler };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config.daemon.bind.parse()?;
    tracing::info!(%addr, "SiteMedic listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
