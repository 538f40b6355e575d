use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportToggles;
use crate::domain::{ServerSpec, Transport};
use crate::launcher::BridgeLauncher;
use crate::ports::PortPool;
use crate::probe::EndpointProber;
use crate::secrets::SecretStore;
use crate::spawn::{ChildProc, ProcessSpawner};
use crate::supervisor::stop_child;

use super::unified::{UnifiedHandle, UnifiedManager, UnifiedState, UnifiedTimings};

const MAX_GATEWAY_RESTARTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct GatewayTimings {
    pub warmup: Duration,
    pub restart_delay: Duration,
    pub graceful_stop: Duration,
    pub exit_poll: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for GatewayTimings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(8),
            restart_delay: Duration::from_secs(5),
            graceful_stop: Duration::from_secs(3),
            exit_poll: Duration::from_secs(1),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl GatewayTimings {
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            warmup: Duration::from_millis(5),
            restart_delay: Duration::from_millis(10),
            graceful_stop: Duration::from_millis(50),
            exit_poll: Duration::from_millis(10),
            probe_interval: Duration::from_millis(25),
            probe_timeout: Duration::from_millis(50),
        }
    }
}

struct GatewayEntry {
    spec: ServerSpec,
    transport: Transport,
    port: u16,
    pid: Option<u32>,
    healthy: bool,
    restart_count: u32,
    started_mono: Instant,
    gave_up: bool,
    child: Option<Box<dyn ChildProc>>,
}

/// Observable row for one auxiliary gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub server_id: String,
    pub transport: Transport,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub healthy: bool,
    pub restart_count: u32,
    pub gave_up: bool,
}

enum Command {
    Reload {
        desired: Vec<ServerSpec>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct MultiHandle {
    tx: mpsc::Sender<Command>,
    pub unified: UnifiedHandle,
}

impl MultiHandle {
    pub async fn reload(&self, desired: Vec<ServerSpec>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Reload { desired, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        self.unified.shutdown().await;
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Multi-transport mode: owns the unified manager (composition, not
/// inheritance) and additionally fans out one supergateway child per
/// server per enabled transport, each supervised like an individual-mode
/// child: pool port, warmup, liveness probe, bounded restarts.
pub struct MultiTransportManager {
    unified: Option<UnifiedManager>,
    gateways: HashMap<(String, Transport), GatewayEntry>,
    status: Arc<RwLock<Vec<GatewayStatus>>>,
    launcher: Arc<BridgeLauncher>,
    spawner: Arc<dyn ProcessSpawner>,
    prober: Arc<dyn EndpointProber>,
    ports: Arc<Mutex<PortPool>>,
    toggles: TransportToggles,
    timings: GatewayTimings,
    rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl MultiTransportManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launcher: Arc<BridgeLauncher>,
        spawner: Arc<dyn ProcessSpawner>,
        prober: Arc<dyn EndpointProber>,
        secrets: Arc<SecretStore>,
        ports: Arc<Mutex<PortPool>>,
        runtime_dir: std::path::PathBuf,
        toggles: TransportToggles,
        timings: GatewayTimings,
        unified_timings: UnifiedTimings,
        shutdown: CancellationToken,
    ) -> (
        Self,
        MultiHandle,
        Arc<RwLock<UnifiedState>>,
        Arc<RwLock<Vec<GatewayStatus>>>,
    ) {
        let (unified, unified_handle, unified_state) = UnifiedManager::new(
            Arc::clone(&launcher),
            Arc::clone(&spawner),
            Arc::clone(&prober),
            secrets,
            Arc::clone(&ports),
            runtime_dir,
            unified_timings,
            shutdown.clone(),
        );
        let (tx, rx) = mpsc::channel(16);
        let status = Arc::new(RwLock::new(Vec::new()));
        (
            Self {
                unified: Some(unified),
                gateways: HashMap::new(),
                status: Arc::clone(&status),
                launcher,
                spawner,
                prober,
                ports,
                toggles,
                timings,
                rx,
                shutdown,
            },
            MultiHandle {
                tx,
                unified: unified_handle,
            },
            unified_state,
            status,
        )
    }

    pub async fn run(mut self) {
        if let Some(unified) = self.unified.take() {
            tokio::spawn(unified.run());
        }
        let mut exit_tick = tokio::time::interval(self.timings.exit_poll);
        let mut probe_tick = tokio::time::interval(self.timings.probe_interval);
        exit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop_all().await;
                    break;
                }
                _ = exit_tick.tick() => self.check_exits().await,
                _ = probe_tick.tick() => self.probe_all().await,
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(Command::Reload { desired, reply }) => {
                        self.sync_gateways(desired).await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.stop_all().await;
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
        info!("multi-transport manager stopped");
    }

    fn enabled_transports(&self) -> Vec<Transport> {
        Transport::ALL
            .into_iter()
            .filter(|t| match t {
                Transport::Sse => self.toggles.sse,
                Transport::Websocket => self.toggles.websocket,
                Transport::Streamable => self.toggles.streamable,
            })
            .collect()
    }

    /// Diff wanted gateways against running ones, like the supervisor's
    /// desired-vs-live reconcile.
    async fn sync_gateways(&mut self, desired: Vec<ServerSpec>) {
        let transports = self.enabled_transports();
        let mut wanted: HashMap<(String, Transport), ServerSpec> = HashMap::new();
        for spec in desired {
            // Only stdio servers can be wrapped by a gateway; remote servers
            // already stream.
            if !spec.needs_proxy || spec.command.is_none() {
                continue;
            }
            for transport in &transports {
                wanted.insert((spec.id.clone(), *transport), spec.clone());
            }
        }

        let current: HashSet<(String, Transport)> = self.gateways.keys().cloned().collect();
        for key in current {
            if !wanted.contains_key(&key) {
                self.stop_gateway(&key).await;
            }
        }

        let keys: Vec<(String, Transport)> = wanted.keys().cloned().collect();
        for key in keys {
            if !self.gateways.contains_key(&key) {
                let spec = wanted.get(&key).cloned().unwrap();
                self.start_gateway(spec, key.1).await;
            }
        }
        self.publish_status();
    }

    async fn start_gateway(&mut self, spec: ServerSpec, transport: Transport) {
        let key = (spec.id.clone(), transport);
        let pool_id = gateway_pool_id(&key);
        let Some(port) = self.ports.lock().allocate(&pool_id) else {
            warn!(server_id = %spec.id, %transport, "no free port for gateway");
            return;
        };
        let plan = match self.launcher.gateway_plan(&spec, port, transport) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(server_id = %spec.id, %transport, error = %err, "gateway plan rejected");
                self.ports.lock().release(&pool_id);
                return;
            }
        };
        match self.spawner.spawn(&plan).await {
            Ok(child) => {
                info!(server_id = %spec.id, %transport, port, "gateway spawned");
                self.gateways.insert(
                    key,
                    GatewayEntry {
                        spec,
                        transport,
                        port,
                        pid: child.pid(),
                        healthy: false,
                        restart_count: 0,
                        started_mono: Instant::now(),
                        gave_up: false,
                        child: Some(child),
                    },
                );
            }
            Err(err) => {
                warn!(server_id = %spec.id, %transport, error = %err, "gateway spawn failed");
                self.ports.lock().release(&pool_id);
            }
        }
    }

    async fn stop_gateway(&mut self, key: &(String, Transport)) {
        if let Some(mut entry) = self.gateways.remove(key) {
            info!(server_id = %key.0, transport = %key.1, "stopping gateway");
            if let Some(child) = entry.child.take() {
                stop_child(child, self.timings.graceful_stop).await;
            }
            self.ports.lock().release(&gateway_pool_id(key));
        }
    }

    async fn check_exits(&mut self) {
        let exited: Vec<(String, Transport)> = self
            .gateways
            .iter_mut()
            .filter_map(|(key, entry)| {
                entry
                    .child
                    .as_mut()
                    .and_then(|child| child.try_wait())
                    .map(|_| key.clone())
            })
            .collect();

        for key in exited {
            let Some(mut entry) = self.gateways.remove(&key) else {
                continue;
            };
            entry.child = None;
            if entry.restart_count >= MAX_GATEWAY_RESTARTS {
                warn!(server_id = %key.0, transport = %key.1, "gateway restart budget exhausted");
                self.ports.lock().release(&gateway_pool_id(&key));
                entry.gave_up = true;
                entry.healthy = false;
                entry.pid = None;
                self.gateways.insert(key, entry);
                continue;
            }

            tokio::time::sleep(self.timings.restart_delay).await;
            let pool_id = gateway_pool_id(&key);
            let port = entry.port;
            let plan = match self.launcher.gateway_plan(&entry.spec, port, entry.transport) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(server_id = %key.0, error = %err, "gateway replan failed");
                    self.ports.lock().release(&pool_id);
                    continue;
                }
            };
            match self.spawner.spawn(&plan).await {
                Ok(child) => {
                    debug!(server_id = %key.0, transport = %key.1, "gateway restarted");
                    entry.pid = child.pid();
                    entry.child = Some(child);
                    entry.healthy = false;
                    entry.restart_count += 1;
                    entry.started_mono = Instant::now();
                    self.gateways.insert(key, entry);
                }
                Err(err) => {
                    warn!(server_id = %key.0, error = %err, "gateway respawn failed");
                    self.ports.lock().release(&pool_id);
                }
            }
        }
        self.publish_status();
    }

    async fn probe_all(&mut self) {
        let targets: Vec<((String, Transport), u16)> = self
            .gateways
            .iter()
            .filter(|(_, e)| {
                e.child.is_some() && e.started_mono.elapsed() >= self.timings.warmup
            })
            .map(|(key, e)| (key.clone(), e.port))
            .collect();

        for (key, port) in targets {
            let alive = gateway_alive(
                self.prober.as_ref(),
                port,
                key.1,
                self.timings.probe_timeout,
            )
            .await;
            if let Some(entry) = self.gateways.get_mut(&key) {
                entry.healthy = alive;
            }
        }
        self.publish_status();
    }

    async fn stop_all(&mut self) {
        let keys: Vec<(String, Transport)> = self.gateways.keys().cloned().collect();
        for key in keys {
            self.stop_gateway(&key).await;
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let mut rows: Vec<GatewayStatus> = self
            .gateways
            .values()
            .map(|e| GatewayStatus {
                server_id: e.spec.id.clone(),
                transport: e.transport,
                port: e.port,
                pid: e.pid,
                healthy: e.healthy,
                restart_count: e.restart_count,
                gave_up: e.gave_up,
            })
            .collect();
        rows.sort_by(|a, b| {
            (a.server_id.as_str(), a.transport.as_str())
                .cmp(&(b.server_id.as_str(), b.transport.as_str()))
        });
        *self.status.write() = rows;
    }
}

fn gateway_pool_id(key: &(String, Transport)) -> String {
    format!("gw-{}-{}", key.0, key.1)
}

/// Transport-specific liveness: any HTTP status below 500 counts; websocket
/// gateways are additionally alive on a bare TCP connect or a 400.
async fn gateway_alive(
    prober: &dyn EndpointProber,
    port: u16,
    transport: Transport,
    timeout: Duration,
) -> bool {
    let endpoints: &[&str] = match transport {
        Transport::Sse => &["/", "/message", "/events", "/health"],
        Transport::Streamable => &["/", "/health"],
        Transport::Websocket => &["/", "/ws"],
    };

    if transport == Transport::Websocket {
        if prober.tcp_connect(port, timeout).await {
            return true;
        }
        for endpoint in endpoints {
            let url = format!("http://127.0.0.1:{port}{endpoint}");
            if let Ok(400) = prober.get_status(&url, timeout).await {
                return true;
            }
        }
        return false;
    }

    for endpoint in endpoints {
        let url = format!("http://127.0.0.1:{port}{endpoint}");
        if let Ok(status) = prober.get_status(&url, timeout).await {
            if status < 500 {
                return true;
            }
        }
    }
    false
}
