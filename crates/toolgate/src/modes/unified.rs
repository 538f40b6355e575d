use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{ServerKind, ServerSpec};
use crate::launcher::{BridgeLauncher, UNIFIED_ID};
use crate::ports::PortPool;
use crate::probe::EndpointProber;
use crate::secrets::{write_restricted, SecretStore};
use crate::spawn::{ChildProc, ProcessSpawner};
use crate::supervisor::stop_child;

/// Consecutive crash restarts before the manager gives up.
const MAX_CONSECUTIVE_RESTARTS: u32 = 3;

const UNIFIED_PROBE_ENDPOINTS: [&str; 2] = ["/docs", "/openapi.json"];

#[derive(Debug, Clone)]
pub struct UnifiedTimings {
    pub startup_budget: Duration,
    pub startup_poll: Duration,
    pub backoff_base: Duration,
    /// Single field for both the probe cadence and its timer.
    pub health_interval: Duration,
    pub graceful_stop: Duration,
    pub exit_poll: Duration,
    pub probe_timeout: Duration,
}

impl Default for UnifiedTimings {
    fn default() -> Self {
        Self {
            startup_budget: Duration::from_secs(30),
            startup_poll: Duration::from_secs(1),
            backoff_base: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            graceful_stop: Duration::from_secs(3),
            exit_poll: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl UnifiedTimings {
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            startup_budget: Duration::from_millis(100),
            startup_poll: Duration::from_millis(10),
            backoff_base: Duration::from_millis(10),
            health_interval: Duration::from_millis(25),
            graceful_stop: Duration::from_millis(50),
            exit_poll: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
        }
    }
}

/// Observable state of the one multiplexing bridge child.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedState {
    pub running: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Unix timestamp (seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    pub consecutive_restarts: u32,
    /// Set when the crash budget is exhausted.
    pub gave_up: bool,
    /// Derived by probing `/<id>/docs` for each configured server.
    pub per_server_healthy: HashMap<String, bool>,
}

enum Command {
    Reload {
        desired: Vec<ServerSpec>,
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct UnifiedHandle {
    tx: mpsc::Sender<Command>,
}

impl UnifiedHandle {
    pub async fn reload(&self, desired: Vec<ServerSpec>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Reload { desired, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn restart(&self) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Restart { reply })
            .await
            .map_err(|_| "unified manager unavailable".to_string())?;
        rx.await
            .map_err(|_| "unified manager unavailable".to_string())?
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Supervises exactly one bridge child that reads the full catalog and
/// serves every server under a `/<serverId>` route prefix.
pub struct UnifiedManager {
    state: Arc<RwLock<UnifiedState>>,
    desired: Vec<ServerSpec>,
    launcher: Arc<BridgeLauncher>,
    spawner: Arc<dyn ProcessSpawner>,
    prober: Arc<dyn EndpointProber>,
    secrets: Arc<SecretStore>,
    ports: Arc<Mutex<PortPool>>,
    runtime_dir: PathBuf,
    timings: UnifiedTimings,
    rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    child: Option<Box<dyn ChildProc>>,
}

impl UnifiedManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launcher: Arc<BridgeLauncher>,
        spawner: Arc<dyn ProcessSpawner>,
        prober: Arc<dyn EndpointProber>,
        secrets: Arc<SecretStore>,
        ports: Arc<Mutex<PortPool>>,
        runtime_dir: PathBuf,
        timings: UnifiedTimings,
        shutdown: CancellationToken,
    ) -> (Self, UnifiedHandle, Arc<RwLock<UnifiedState>>) {
        let (tx, rx) = mpsc::channel(16);
        let state = Arc::new(RwLock::new(UnifiedState::default()));
        (
            Self {
                state: Arc::clone(&state),
                desired: Vec::new(),
                launcher,
                spawner,
                prober,
                secrets,
                ports,
                runtime_dir,
                timings,
                rx,
                shutdown,
                child: None,
            },
            UnifiedHandle { tx },
            state,
        )
    }

    pub async fn run(mut self) {
        let mut exit_tick = tokio::time::interval(self.timings.exit_poll);
        let mut health_tick = tokio::time::interval(self.timings.health_interval);
        exit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop_current().await;
                    break;
                }
                _ = exit_tick.tick() => self.check_exit().await,
                _ = health_tick.tick() => self.check_health().await,
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(Command::Reload { desired, reply }) => {
                        self.desired = desired;
                        self.stop_current().await;
                        self.state.write().gave_up = false;
                        let _ = self.start_child().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Restart { reply }) => {
                        self.stop_current().await;
                        {
                            let mut state = self.state.write();
                            state.consecutive_restarts = 0;
                            state.gave_up = false;
                        }
                        let _ = reply.send(self.start_child().await);
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.stop_current().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
        info!("unified manager stopped");
    }

    /// Write the effective catalog (secrets overlaid) and spawn the bridge.
    async fn start_child(&mut self) -> Result<(), String> {
        if self.desired.is_empty() {
            debug!("no servers configured, unified bridge not started");
            return Ok(());
        }

        let config_path = self.write_catalog().map_err(|e| e.to_string())?;
        let Some(port) = self.ports.lock().allocate(UNIFIED_ID) else {
            return Err("no free port for the unified bridge".to_string());
        };
        let plan = self.launcher.unified_plan(port, &config_path);
        let child = match self.spawner.spawn(&plan).await {
            Ok(child) => child,
            Err(err) => {
                self.ports.lock().release(UNIFIED_ID);
                warn!(error = %err, "failed to spawn unified bridge");
                return Err(err.to_string());
            }
        };

        info!(port, pid = child.pid(), "unified bridge spawned");
        {
            let mut state = self.state.write();
            state.running = true;
            state.healthy = false;
            state.port = Some(port);
            state.pid = child.pid();
            state.started_at = Some(time::OffsetDateTime::now_utc().unix_timestamp());
        }
        self.child = Some(child);

        // Startup budget: poll until the bridge answers.
        let deadline = Instant::now() + self.timings.startup_budget;
        while Instant::now() < deadline {
            if self.probe_unified(port).await {
                let mut state = self.state.write();
                state.healthy = true;
                state.consecutive_restarts = 0;
                info!(port, "unified bridge healthy");
                return Ok(());
            }
            tokio::time::sleep(self.timings.startup_poll).await;
        }
        warn!(port, "unified bridge did not become healthy within the startup budget");
        Ok(())
    }

    async fn stop_current(&mut self) {
        if let Some(child) = self.child.take() {
            stop_child(child, self.timings.graceful_stop).await;
        }
        self.ports.lock().release(UNIFIED_ID);
        let mut state = self.state.write();
        state.running = false;
        state.healthy = false;
        state.pid = None;
        state.port = None;
        state.per_server_healthy.clear();
    }

    /// Crash detection with exponential backoff, up to three consecutive
    /// restarts; a healthy probe resets the streak.
    async fn check_exit(&mut self) {
        let exited = self
            .child
            .as_mut()
            .and_then(|child| child.try_wait())
            .is_some();
        if !exited {
            return;
        }
        self.child = None;
        self.ports.lock().release(UNIFIED_ID);

        let restarts = {
            let mut state = self.state.write();
            state.running = false;
            state.healthy = false;
            state.pid = None;
            state.consecutive_restarts += 1;
            state.consecutive_restarts
        };
        if restarts > MAX_CONSECUTIVE_RESTARTS {
            warn!("unified bridge crash budget exhausted, giving up");
            self.state.write().gave_up = true;
            return;
        }

        let backoff = self.timings.backoff_base * 2u32.saturating_pow(restarts - 1);
        warn!(restarts, backoff_ms = backoff.as_millis() as u64, "unified bridge exited, restarting");
        tokio::time::sleep(backoff).await;
        let _ = self.start_child().await;
    }

    async fn check_health(&mut self) {
        let port = {
            let state = self.state.read();
            if !state.running {
                return;
            }
            state.port
        };
        let Some(port) = port else { return };

        let healthy = self.probe_unified(port).await;
        let mut per_server = HashMap::new();
        if healthy {
            for spec in &self.desired {
                let url = format!("http://127.0.0.1:{port}/{}/docs", spec.id);
                let up = matches!(
                    self.prober.get_status(&url, self.timings.probe_timeout).await,
                    Ok(200)
                );
                per_server.insert(spec.id.clone(), up);
            }
        }

        let mut state = self.state.write();
        state.healthy = healthy;
        if healthy {
            state.consecutive_restarts = 0;
        }
        state.per_server_healthy = per_server;
    }

    async fn probe_unified(&self, port: u16) -> bool {
        for endpoint in UNIFIED_PROBE_ENDPOINTS {
            let url = format!("http://127.0.0.1:{port}{endpoint}");
            if let Ok(200) = self.prober.get_status(&url, self.timings.probe_timeout).await {
                return true;
            }
        }
        false
    }

    fn write_catalog(&self) -> anyhow::Result<PathBuf> {
        let dir = self.runtime_dir.join("unified");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("config.json");

        let mut servers = serde_json::Map::new();
        for spec in &self.desired {
            let effective = spec.with_secrets(&self.secrets.load(&spec.id));
            let entry = match effective.kind {
                ServerKind::Stdio => json!({
                    "command": effective.command,
                    "args": effective.args,
                    "env": effective.env,
                    "alwaysAllow": effective.always_allow,
                }),
                ServerKind::Sse => json!({
                    "transport": "sse",
                    "url": effective.url,
                    "headers": effective.headers,
                }),
                ServerKind::StreamableHttp => json!({
                    "transport": "streamable-http",
                    "url": effective.url,
                    "headers": effective.headers,
                }),
            };
            servers.insert(effective.id, entry);
        }
        let doc = json!({ "mcpServers": servers });
        // Decrypted secrets land in this file; keep it operator-only.
        write_restricted(&path, &serde_json::to_vec_pretty(&doc)?)?;
        Ok(path)
    }
}
