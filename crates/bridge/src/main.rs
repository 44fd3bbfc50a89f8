//! PBS bridge - schedules cluster pods through a PBS batch scheduler
//!
//! Every unscheduled pod becomes a PBS job sized by its resource requests;
//! once PBS starts the job on a host, the pod is bound to that host.

use anyhow::{Context, Result};
use bridge_lib::{
    health::{components, HealthRegistry},
    observability::{BridgeMetrics, StructuredLogger},
    BatchScheduler, Binder, EventNotifier, FitEngine, HttpOrchestrator, Orchestrator, PbsClient,
    Reconciler,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pbs-bridge");

    let config = config::BridgeConfig::load()?;
    info!(
        api_server = %config.api_server,
        hostname_to_ip = config.hostname_to_ip,
        sweep_interval_secs = config.tunables.sweep_interval_secs,
        "Bridge configured"
    );

    // Initialize health registry
    let health_registry =
        HealthRegistry::with_failure_threshold(config.tunables.unhealthy_after_failures);
    health_registry.register(components::WATCH).await;
    health_registry.register(components::SWEEP).await;
    health_registry.register(components::ORCHESTRATOR).await;
    health_registry.register(components::BATCH_SCHEDULER).await;

    let metrics = BridgeMetrics::new();
    let logger = StructuredLogger::new(&config.tunables.event_component);
    logger.log_startup(BRIDGE_VERSION, config.api_server.as_str());

    let orchestrator: Arc<dyn Orchestrator> = Arc::new(
        HttpOrchestrator::new(config.orchestrator())
            .await
            .context("Failed to set up cluster API client")?,
    );
    let batch: Arc<dyn BatchScheduler> = Arc::new(PbsClient::new(config.pbs()));
    let notifier = EventNotifier::new(orchestrator.clone(), &config.tunables.event_component)
        .with_namespace(&config.tunables.namespace);

    let fit = FitEngine::new(
        orchestrator.clone(),
        batch,
        notifier.clone(),
        config.fit(),
        logger.clone(),
    );
    let binder = Binder::new(orchestrator.clone(), notifier, config.hostname_to_ip);
    let reconciler = Arc::new(Reconciler::new(
        orchestrator,
        fit,
        binder,
        config.reconciler(),
        health_registry.clone(),
        logger.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(
        config.tunables.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let watch_handle = tokio::spawn(Arc::clone(&reconciler).run_watch_loop(shutdown_tx.subscribe()));
    let sweep_handle = tokio::spawn(Arc::clone(&reconciler).run_sweep_loop(shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await?;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    for (name, handle) in [("watch", watch_handle), ("sweep", sweep_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT received")
            }
            _ = terminate.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok("ctrl-c received")
    }
}
