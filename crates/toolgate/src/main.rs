mod api;
mod catalog;
mod classify;
mod config;
mod domain;
mod health;
mod launcher;
mod modes;
mod ports;
mod probe;
mod runtime;
mod secrets;
mod spawn;
mod supervisor;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use parking_lot::{Mutex, RwLock};
use tabled::Tabled;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiState, ModeView};
use crate::catalog::ConfigDigest;
use crate::classify::ErrorBoard;
use crate::config::{ProxyMode, Settings};
use crate::domain::ServerSpec;
use crate::health::{HealthHistory, HealthMonitor, DEFAULT_PROBE_INTERVAL};
use crate::launcher::BridgeLauncher;
use crate::modes::multi::GatewayTimings;
use crate::modes::unified::UnifiedTimings;
use crate::modes::{ModeHandle, MultiTransportManager, UnifiedManager};
use crate::ports::PortPool;
use crate::probe::{HttpEndpointProber, HttpProber};
use crate::secrets::SecretStore;
use crate::spawn::TokioSpawner;
use crate::supervisor::{Shared, Supervisor, SupervisorTimings};

#[derive(Parser)]
#[command(name = "toolgate", about = "Supervisor and reverse-gateway for MCP tool servers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and management API
    Serve,
    /// Show server status from a running daemon
    Status,
    /// Parse and validate the catalog, then exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing();
    let settings = Settings::load().context("failed to load settings")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(settings).await,
        Commands::Status => run_status(settings).await,
        Commands::Check => run_check(settings),
    }
}

async fn run_serve(settings: Settings) -> anyhow::Result<()> {
    runtime::ensure_runtime_paths(&settings)?;
    let settings = Arc::new(settings);
    let shutdown = CancellationToken::new();
    let secrets = Arc::new(SecretStore::open(&settings));
    let catalog_view: Arc<RwLock<Vec<ServerSpec>>> = Arc::new(RwLock::new(Vec::new()));

    // Reload nudges come from the file watcher and from the management API.
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel::<()>();

    let mut last_digest: Option<ConfigDigest> = None;
    let initial = match catalog::load(&settings.config_path) {
        Ok(catalog) => {
            last_digest = Some(catalog.digest.clone());
            *catalog_view.write() = catalog.servers.clone();
            catalog.servers
        }
        Err(err) => {
            warn!(
                path = %settings.config_path.display(),
                %err,
                "catalog not loadable at boot; starting empty"
            );
            Vec::new()
        }
    };

    // Bind the management API before bringing anything up; failure here is
    // fatal to the whole process.
    let api_listener = tokio::net::TcpListener::bind(settings.manager_listen)
        .await
        .with_context(|| format!("failed to bind management API on {}", settings.manager_listen))?;
    info!(addr = %settings.manager_listen, "management API listening");

    let launcher = Arc::new(BridgeLauncher::new(settings.runtime_dir.clone()));
    let board = Arc::new(ErrorBoard::new());

    let (mode_handle, view, supervisor_task) = match settings.mode {
        ProxyMode::Individual => {
            let shared = Shared::new(PortPool::new(
                settings.port_range_start,
                settings.port_range_end,
            ));
            let (line_tx, line_rx) = mpsc::channel(1024);
            tokio::spawn(classify::run_classifier(
                line_rx,
                Arc::clone(&board),
                shutdown.clone(),
            ));
            let spawner = Arc::new(TokioSpawner::new(line_tx));
            let prober = Arc::new(HttpProber::new());
            let history = HealthHistory::new();

            let (supervisor, handle) = Supervisor::new(
                Arc::clone(&shared),
                BridgeLauncher::new(settings.runtime_dir.clone()),
                spawner,
                prober.clone(),
                Arc::clone(&board),
                Arc::clone(&secrets),
                SupervisorTimings::default(),
                settings.default_proxy_type,
                shutdown.clone(),
            );
            let supervisor_task = tokio::spawn(supervisor.run());

            let monitor = HealthMonitor::new(
                Arc::clone(&shared),
                prober,
                Arc::clone(&history),
                handle.clone(),
                DEFAULT_PROBE_INTERVAL,
                shutdown.clone(),
            );
            tokio::spawn(monitor.run());

            let view = ModeView::Individual {
                shared,
                board: Arc::clone(&board),
                history,
                supervisor: handle.clone(),
            };
            (ModeHandle::Individual(handle), view, supervisor_task)
        }
        ProxyMode::Unified => {
            let ports = Arc::new(Mutex::new(PortPool::new(
                settings.port_range_start,
                settings.port_range_end,
            )));
            let (line_tx, line_rx) = mpsc::channel(1024);
            tokio::spawn(classify::run_classifier(
                line_rx,
                Arc::clone(&board),
                shutdown.clone(),
            ));
            let spawner = Arc::new(TokioSpawner::new(line_tx));
            let prober = Arc::new(HttpEndpointProber::new());

            if settings.transports.any() {
                let (manager, handle, unified_state, gateways) = MultiTransportManager::new(
                    Arc::clone(&launcher),
                    spawner,
                    prober,
                    Arc::clone(&secrets),
                    Arc::clone(&ports),
                    settings.runtime_dir.clone(),
                    settings.transports,
                    GatewayTimings::default(),
                    UnifiedTimings::default(),
                    shutdown.clone(),
                );
                let task = tokio::spawn(manager.run());
                let view = ModeView::Unified {
                    unified: unified_state,
                    gateways: Some(gateways),
                    handle: handle.unified.clone(),
                    ports,
                };
                (ModeHandle::Multi(handle), view, task)
            } else {
                let (manager, handle, unified_state) = UnifiedManager::new(
                    Arc::clone(&launcher),
                    spawner,
                    prober,
                    Arc::clone(&secrets),
                    Arc::clone(&ports),
                    settings.runtime_dir.clone(),
                    UnifiedTimings::default(),
                    shutdown.clone(),
                );
                let task = tokio::spawn(manager.run());
                let view = ModeView::Unified {
                    unified: unified_state,
                    gateways: None,
                    handle: handle.clone(),
                    ports,
                };
                (ModeHandle::Unified(handle), view, task)
            }
        }
    };

    let api_state = ApiState {
        mode: settings.mode,
        settings: Arc::clone(&settings),
        secrets: Arc::clone(&secrets),
        reload_tx: reload_tx.clone(),
        catalog: Arc::clone(&catalog_view),
        view,
    };
    let api_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let router = api::router(api_state);
        if let Err(err) = axum::serve(api_listener, router)
            .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
            .await
        {
            error!(error = %err, "management API exited with error");
        }
    });

    mode_handle.apply(initial).await;

    // Poll-based watcher; kept alive for the life of the daemon.
    let _watcher = match catalog::build_watcher(&settings.config_path, reload_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(%err, "config watcher unavailable; reloads are manual only");
            None
        }
    };

    let reload_settings = Arc::clone(&settings);
    let reload_view = Arc::clone(&catalog_view);
    let reload_handle = mode_handle.clone();
    let reload_shutdown = shutdown.clone();
    let reload_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reload_shutdown.cancelled() => break,
                event = reload_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    // Collapse bursts of events into one reload.
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    while reload_rx.try_recv().is_ok() {}

                    match catalog::load(&reload_settings.config_path) {
                        Ok(catalog) => {
                            if last_digest.as_ref() == Some(&catalog.digest) {
                                continue;
                            }
                            info!(digest = %catalog.digest, "catalog changed, reconciling");
                            last_digest = Some(catalog.digest.clone());
                            *reload_view.write() = catalog.servers.clone();
                            reload_handle.apply(catalog.servers).await;
                        }
                        Err(err) => {
                            // Keep the previous desired set on parse errors.
                            warn!(%err, "catalog reload failed; keeping previous state");
                        }
                    }
                }
            }
        }
    });

    info!(mode = settings.mode.as_str(), "toolgate started");
    runtime::wait_for_shutdown().await;

    shutdown.cancel();
    mode_handle.shutdown().await;
    reload_task.abort();
    let _ = supervisor_task.await;

    Ok(())
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "SERVER")]
    server: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "PROXY")]
    proxy: String,
    #[tabled(rename = "RESTARTS")]
    restarts: String,
    #[tabled(rename = "ERROR")]
    error: String,
}

async fn run_status(settings: Settings) -> anyhow::Result<()> {
    let url = format!(
        "http://127.0.0.1:{}/api/status",
        settings.manager_listen.port()
    );
    let body: serde_json::Value = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("is the daemon running? GET {url} failed"))?
        .json()
        .await?;

    let servers = body["servers"].as_array().cloned().unwrap_or_default();
    if servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    let rows: Vec<StatusRow> = servers
        .iter()
        .map(|s| {
            let healthy = s["healthy"].as_bool().unwrap_or(false);
            let auth = s["authError"].as_bool().unwrap_or(false);
            let status = if healthy {
                "healthy".green().to_string()
            } else if auth {
                "auth required".yellow().to_string()
            } else if s["status"] == "failed" {
                "failed".red().to_string()
            } else if s["status"] == "running" {
                "unhealthy".red().to_string()
            } else {
                "skipped".dimmed().to_string()
            };
            StatusRow {
                server: s["serverId"].as_str().unwrap_or("?").bold().to_string(),
                status,
                port: s["port"]
                    .as_u64()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                proxy: s["proxyTypeUsed"].as_str().unwrap_or("-").to_string(),
                restarts: s["restartCount"].as_u64().unwrap_or(0).to_string(),
                error: s["lastError"]
                    .as_str()
                    .map(|e| e.chars().take(48).collect())
                    .unwrap_or_else(|| "-".to_string()),
            }
        })
        .collect();

    use tabled::settings::Style;
    let table = tabled::Table::new(&rows).with(Style::blank()).to_string();
    println!("{table}");
    println!(
        "{} running, {} healthy, {} failed ({} mode)",
        body["counts"]["running"],
        body["counts"]["healthy"],
        body["counts"]["failed"],
        body["mode"].as_str().unwrap_or("?")
    );
    Ok(())
}

fn run_check(settings: Settings) -> anyhow::Result<()> {
    println!(
        "{} {}",
        "checking".bold(),
        settings.config_path.display()
    );
    let catalog = catalog::load(&settings.config_path)?;
    for spec in &catalog.servers {
        let target = match spec.kind {
            domain::ServerKind::Stdio => spec.command.clone().unwrap_or_default(),
            _ => spec.url.clone().unwrap_or_default(),
        };
        let marker = if spec.needs_proxy {
            "+".green()
        } else {
            "-".dimmed()
        };
        println!(
            "  {} {} ({}) -> {}",
            marker,
            spec.id.bold(),
            spec.kind,
            target.dimmed()
        );
    }
    println!(
        "{}",
        format!("{} servers, digest {}", catalog.servers.len(), catalog.digest).dimmed()
    );
    Ok(())
}
