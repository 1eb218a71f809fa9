//! kv-cache-sched: admission-controlled scheduler with a paged, quantized
//! KV cache.
//!
//! Starts one runtime instance with the synthetic backend and exposes the
//! ops API (health, metrics, stats).

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use kv_cache_sched::config::{Cli, Config};
use kv_cache_sched::runtime::{Runtime, RuntimeHandle};
use kv_cache_sched::sequence::{Priority, Request};
use kv_cache_sched::server::{self, AppState};
use kv_cache_sched::telemetry::PrometheusSink;
use kv_cache_sched::worker::SyntheticBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_cache_sched=debug,tower_http=debug"
    } else {
        "kv_cache_sched=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-cache-sched v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(preset) = cli.preset {
        config.apply_preset(preset);
        info!(preset = ?preset, "Applied preset");
    }
    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }

    // Print cache sizing.
    info!(
        capacity_pages = config.cache.capacity_pages,
        page_tokens = config.cache.page_tokens,
        page_bytes = config.page_bytes(),
        full_precision_page_bytes = config.full_precision_page_bytes(),
        max_sequence_pages = config.max_sequence_pages(),
        "KV cache capacity"
    );

    // Start the runtime.
    let metrics = Arc::new(PrometheusSink::new()?);
    let backend = Arc::new(SyntheticBackend::new(config.model.kv_dim).with_delay(Duration::from_millis(5)));
    let listen = config.server.listen.clone();
    let runtime = Runtime::start(config, backend, metrics.clone())?;

    if cli.demo_requests > 0 {
        tokio::spawn(drive_demo_load(runtime.handle(), cli.demo_requests));
    }

    // Build application state.
    let state = Arc::new(AppState {
        runtime: runtime.handle(),
        metrics,
        start_time: Instant::now(),
    });

    // Start the server.
    server::serve(state, &listen, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    runtime.shutdown().await;
    Ok(())
}

/// Submit a mix of synthetic requests across all tiers and log the outcomes.
async fn drive_demo_load(handle: RuntimeHandle, count: usize) {
    let mut pending = Vec::with_capacity(count);
    for i in 0..count {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let request = Request::generate(32 + (i % 7) * 48, 16 + (i % 5) * 16).with_priority(priority);
        match handle.submit(request) {
            Ok(submission) => pending.push(submission),
            Err(e) => warn!(error = %e, retryable = e.is_retryable(), "Demo request rejected"),
        }
    }
    info!(submitted = pending.len(), "Demo load submitted");

    let outcomes = futures::future::join_all(pending.into_iter().map(|s| s.wait())).await;
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, kv_cache_sched::admission::RequestOutcome::Completed { .. }))
        .count();
    info!(completed, total = outcomes.len(), "Demo load finished");
}
