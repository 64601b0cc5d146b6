//! Campaign Automation: multi-step email flow engine.
//!
//! Main entry point: restores engine state, starts the scheduler and serves
//! the control and tracking API until interrupted.

use campaign_api::ApiServer;
use campaign_core::config::AppConfig;
use campaign_core::event_bus::TracingSink;
use campaign_flow::{FlowEngine, Journal, LogMailer, Scheduler, TemplateLibrary};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-automation")]
#[command(about = "Multi-step email campaign automation engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOMATION__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOMATION__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Metrics port (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOMATION__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Cursor snapshot file (overrides config)
    #[arg(long, env = "CAMPAIGN_AUTOMATION__FLOW__SNAPSHOT_PATH")]
    snapshot_path: Option<String>,

    /// JSON file of email templates keyed by template ref
    #[arg(long)]
    templates: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_automation=info,campaign_flow=info,campaign_api=info,activity=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Automation starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    if let Some(path) = cli.snapshot_path {
        config.flow.snapshot_path = Some(path);
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        scheduler_interval_ms = config.flow.scheduler_interval_ms,
        snapshot_path = ?config.flow.snapshot_path,
        "Configuration loaded"
    );

    let templates = match &cli.templates {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await?;
            let library = TemplateLibrary::from_json(&raw)?;
            info!(path = %path.display(), templates = library.len(), "Templates loaded");
            library
        }
        None => TemplateLibrary::new(),
    };

    let mut engine = FlowEngine::new(config.flow.clone(), Arc::new(LogMailer), Arc::new(templates))
        .with_event_sink(Arc::new(TracingSink));

    // Journal every change between snapshots
    if let Some(path) = &config.flow.snapshot_path {
        match Journal::open(path, config.flow.journal_fsync) {
            Ok(journal) => {
                info!(path = %journal.path().display(), "Change journal opened");
                engine = engine.with_journal(Arc::new(journal));
            }
            Err(e) => error!(error = %e, "Failed to open change journal, relying on periodic snapshots"),
        }
    }

    // Restore snapshot and journal, then re-drive anything stranded mid-step
    if let Some(path) = &config.flow.snapshot_path {
        match engine.load_snapshot(path).await {
            Ok(Some(restored)) => info!(restored, "Snapshot restored"),
            Ok(None) => info!(path = %path, "No snapshot found, starting empty"),
            Err(e) => error!(error = %e, "Failed to restore snapshot, starting empty"),
        }
    }
    match engine.recover(Utc::now()).await {
        Ok(0) => {}
        Ok(resumed) => info!(resumed, "Resumed in-flight cursors"),
        Err(e) => error!(error = %e, "Cursor recovery failed"),
    }

    // Start scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(Scheduler::new(engine.clone()).run(shutdown_rx));

    let api_server = ApiServer::new(config.clone(), engine);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Campaign Automation is ready to serve traffic");

    // Serve until Ctrl-C
    api_server
        .start_http(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Scheduler writes a final snapshot on its way out
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task failed");
    }

    info!("Campaign Automation stopped");
    Ok(())
}
