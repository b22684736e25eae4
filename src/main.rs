// Brummer - developer-facing supervisor for package.json projects
//
// Architecture:
// - Event bus: typed pub/sub over a bounded worker pool, shared by everything
// - Supervisor (tokio::process): runs scripts through the detected package
//   manager and streams their output
// - Log pipeline: bounded store with collapse, classification and URL
//   extraction
// - Proxy (axum + reqwest): intercepts app traffic and injects the browser
//   monitoring script
// - JSON-RPC endpoint (axum): tools, resources and SSE subscriptions on /mcp
// - Hub (--mcp): stdio JSON-RPC router across discovered instances

mod bus;
mod cli;
mod config;
mod detector;
mod discovery;
mod events;
mod hub;
mod logs;
mod mcp;
mod process;
mod proxy;
mod repl;
mod scripts;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bus::EventBus;
use config::Config;
use discovery::Discovery;
use logs::{LogStore, LogStoreConfig};
use process::{ProcessManager, ProcessManagerConfig};
use proxy::server::{spawn_url_watcher, ProxyConfig, ProxyServer};
use proxy::MappingTable;
use repl::ReplGateway;
use scripts::ScriptsLibrary;
use telemetry::{ApiState, NoProcessResolver, TelemetryCollector, TelemetryConfig};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let project_dir = match cli.project_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("brummer: cannot resolve working directory: {e}");
            return ExitCode::from(2);
        }
    };

    // Configuration errors are their own exit code
    let config = match Config::load(&project_dir, &cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("brummer: configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("brummer={},tower_http=warn", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("brummer: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = if cli.mcp {
        runtime.block_on(run_hub(config))
    } else {
        runtime.block_on(run_instance(config))
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("startup error: {e:#}");
            eprintln!("brummer: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Hub mode: stdio JSON-RPC routed to discovered instances.
async fn run_hub(config: Config) -> Result<()> {
    let discovery = Arc::new(Discovery::new(config.instances_dir.clone()));
    let hub = hub::HubRouter::new(discovery);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let health = hub.spawn_health_checker(shutdown_rx);

    hub::stdio::run(hub.clone()).await?;

    let _ = shutdown_tx.send(true);
    let _ = health.await;
    Ok(())
}

/// Full instance: supervisor, log pipeline, proxy, endpoint, discovery.
async fn run_instance(config: Config) -> Result<()> {
    let bus = Arc::new(EventBus::new());

    let store = Arc::new(LogStore::new(
        LogStoreConfig {
            global_capacity: config.max_logs,
            ..Default::default()
        },
        bus.clone(),
    ));
    let (ingest, ingest_task) = logs::spawn_ingest(store.clone(), 1024);

    let detection =
        detector::detect(&config.project_dir, config.preferred_package_manager).await;
    tracing::info!(
        manager = detection.manager.command(),
        source = ?detection.source,
        dir = %config.project_dir.display(),
        "package manager resolved"
    );
    let processes = Arc::new(ProcessManager::new(
        detection,
        ingest.clone(),
        bus.clone(),
        ProcessManagerConfig::default(),
    ));

    let telemetry_collector = Arc::new(TelemetryCollector::new(
        TelemetryConfig::default(),
        bus.clone(),
    ));
    let repl = Arc::new(ReplGateway::new());
    let (sweep_tx, sweep_rx) = tokio::sync::watch::channel(false);
    let sweeper = telemetry::spawn_sweeper(telemetry_collector.clone(), repl.clone(), sweep_rx);

    let scripts_library = Arc::new(ScriptsLibrary::new(
        config.scripts_dir.clone(),
        scripts::DEFAULT_CACHE_TTL,
    ));

    // Proxy (optional)
    let mappings = Arc::new(MappingTable::new());
    let api_state = ApiState {
        collector: telemetry_collector.clone(),
        repl: repl.clone(),
        store: store.clone(),
        resolver: if config.no_proxy {
            Arc::new(NoProcessResolver)
        } else {
            mappings.clone()
        },
        scripts: scripts_library.clone(),
    };

    let proxy_server = if config.no_proxy {
        tracing::info!("proxy disabled");
        None
    } else {
        let server = ProxyServer::new(
            ProxyConfig {
                port: config.proxy_port,
                mode: config.proxy_mode,
                ..Default::default()
            },
            mappings.clone(),
            api_state.clone(),
            bus.clone(),
        )?;
        server.start().await.context("failed to start proxy")?;
        spawn_url_watcher(server.clone(), &bus);
        Some(server)
    };

    // JSON-RPC endpoint (optional) and discovery registration
    let discovery = Arc::new(Discovery::new(config.instances_dir.clone()));
    let mut endpoint_shutdown = None;
    let mut endpoint_task = None;
    let mut registration = None;

    if config.no_mcp {
        tracing::info!("JSON-RPC endpoint disabled");
    } else {
        let mcp_server = mcp::McpServer::new(bus.clone());
        mcp::tools::register_all(
            &mcp_server,
            mcp::tools::ToolContext {
                processes: processes.clone(),
                logs: store.clone(),
                proxy: proxy_server.clone(),
                telemetry: telemetry_collector.clone(),
                repl: repl.clone(),
                scripts: scripts_library.clone(),
            },
        );
        mcp::resources::register_all(
            &mcp_server,
            mcp::resources::ResourceContext {
                bus: bus.clone(),
                processes: processes.clone(),
                logs: store.clone(),
                proxy: proxy_server.clone(),
                telemetry: telemetry_collector.clone(),
                discovery: discovery.clone(),
            },
        );
        mcp_server.start_notifier();

        let app = mcp::server::router(mcp_server, api_state.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let (port, task) = mcp::server::run(app, config.mcp_port, shutdown_rx)
            .await
            .context("failed to start JSON-RPC endpoint")?;
        endpoint_shutdown = Some(shutdown_tx);
        endpoint_task = Some(task);

        registration = Some(
            discovery::Registration::start(
                discovery.clone(),
                port,
                config.project_dir.clone(),
            )
            .context("failed to register instance")?,
        );
    }

    tracing::info!("brummer running (headless), Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    tracing::info!("shutting down...");

    // Orderly teardown: stop advertising, stop children, close listeners,
    // then drain the bus.
    if let Some(registration) = registration {
        registration.deregister().await;
    }
    processes.cleanup().await;
    if let Some(proxy) = &proxy_server {
        proxy.shutdown().await;
    }
    if let Some(shutdown_tx) = endpoint_shutdown {
        let _ = shutdown_tx.send(());
    }
    if let Some(task) = endpoint_task {
        let _ = task.await;
    }
    let _ = sweep_tx.send(true);
    let _ = sweeper.await;

    drop(ingest);
    drop(processes);
    let _ = tokio::time::timeout(Duration::from_secs(2), ingest_task).await;

    bus.shutdown(Duration::from_secs(5)).await;
    tracing::info!("shutdown complete");
    Ok(())
}
