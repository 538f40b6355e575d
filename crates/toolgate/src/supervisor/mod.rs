use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{self, ErrorBoard};
use crate::domain::{ErrorType, ProxyType, ServerKind, ServerSpec, ServerState};
use crate::launcher::{self, BridgeLauncher};
use crate::ports::PortPool;
use crate::probe::HealthProber;
use crate::secrets::SecretStore;
use crate::spawn::{ChildProc, ExitOutcome, ProcessSpawner};

/// Restart budget per server before the supervisor gives up.
pub const MAX_RESTARTS: u32 = 3;
/// Start cycles allowed per server inside one damper window.
pub const MAX_START_ATTEMPTS: u32 = 3;
/// An empty desired set is refused while more than this many servers live.
pub const MASS_SHUTDOWN_GUARD: usize = 2;

const CMD_CAPACITY: usize = 64;

/// Every wait the supervisor performs, as data so tests can shrink them.
#[derive(Debug, Clone)]
pub struct SupervisorTimings {
    pub warmup_stdio: Duration,
    pub warmup_remote: Duration,
    pub stop_spacing: Duration,
    pub mass_stop_settle: Duration,
    pub restart_delay: Duration,
    pub graceful_stop: Duration,
    pub damper_window: Duration,
    /// Pause between stopping a failed proxy type and spawning the next.
    pub fallback_pause: Duration,
    pub exit_poll: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            warmup_stdio: Duration::from_secs(8),
            warmup_remote: Duration::from_secs(15),
            stop_spacing: Duration::from_secs(2),
            mass_stop_settle: Duration::from_secs(5),
            restart_delay: Duration::from_secs(5),
            graceful_stop: Duration::from_secs(3),
            damper_window: Duration::from_secs(30 * 60),
            fallback_pause: Duration::from_secs(10),
            exit_poll: Duration::from_secs(1),
        }
    }
}

impl SupervisorTimings {
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            warmup_stdio: Duration::from_millis(10),
            warmup_remote: Duration::from_millis(10),
            stop_spacing: Duration::from_millis(5),
            mass_stop_settle: Duration::from_millis(10),
            restart_delay: Duration::from_millis(10),
            graceful_stop: Duration::from_millis(50),
            damper_window: Duration::from_secs(2),
            fallback_pause: Duration::from_millis(5),
            exit_poll: Duration::from_millis(10),
        }
    }
}

/// Fallback bookkeeping per server id. Survives stops; reset only when the
/// damper window has elapsed since the last attempt.
#[derive(Debug, Default)]
pub struct FallbackState {
    pub attempted: HashSet<ProxyType>,
    pub total_attempts: u32,
    pub last_attempt_at: Option<Instant>,
}

/// Runtime state for one running bridge child.
pub struct ProxyProcess {
    pub server_id: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub pid: Option<u32>,
    /// Unix timestamp (seconds).
    pub started_at: i64,
    pub started_mono: Instant,
    pub warmup: Duration,
    pub restart_count: u32,
    pub fallback_used: bool,
    pub auth_error: bool,
    pub healthy: bool,
    pub state: ServerState,
    /// The effective spec this child was launched with (secrets overlaid).
    pub spec: ServerSpec,
    pub workdir: Option<PathBuf>,
    pub(crate) child: Option<Box<dyn ChildProc>>,
}

impl ProxyProcess {
    pub fn uptime_secs(&self) -> u64 {
        self.started_mono.elapsed().as_secs()
    }

    /// Health state is ignored until the warmup window has passed.
    pub fn warmed_up(&self) -> bool {
        self.started_mono.elapsed() >= self.warmup
    }
}

/// Snapshot row handed to the health monitor and the management API.
#[derive(Debug, Clone)]
pub struct LiveProcess {
    pub server_id: String,
    pub port: u16,
    pub kind: ServerKind,
    pub ready_for_probe: bool,
}

/// State shared between the supervisor (sole writer of registry, fallback
/// and ports) and its readers (management API, health monitor).
pub struct Shared {
    pub registry: RwLock<HashMap<String, ProxyProcess>>,
    pub failed: RwLock<HashSet<String>>,
    /// Last applied desired set (pre-overlay).
    pub desired: RwLock<Vec<ServerSpec>>,
    pub ports: Mutex<PortPool>,
    pub fallback: Mutex<HashMap<String, FallbackState>>,
}

impl Shared {
    pub fn new(ports: PortPool) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashSet::new()),
            desired: RwLock::new(Vec::new()),
            ports: Mutex::new(ports),
            fallback: Mutex::new(HashMap::new()),
        })
    }

    pub fn live_snapshot(&self) -> Vec<LiveProcess> {
        self.registry
            .read()
            .values()
            .map(|p| LiveProcess {
                server_id: p.server_id.clone(),
                port: p.port,
                kind: p.spec.kind,
                ready_for_probe: p.warmed_up() && p.state != ServerState::Stopping,
            })
            .collect()
    }
}

/// One observed probe, fed back from the health monitor.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub server_id: String,
    pub healthy: bool,
    pub auth_error: bool,
    pub error: Option<String>,
}

enum Command {
    Reconcile {
        desired: Vec<ServerSpec>,
        reply: oneshot::Sender<()>,
    },
    Start {
        id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Stop {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Restart {
        id: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    HealthReport(HealthReport),
    RequestRestart {
        id: String,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    pub async fn reconcile(&self, desired: Vec<ServerSpec>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Reconcile { desired, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn start(&self, id: &str) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| "supervisor unavailable".to_string())?;
        rx.await.map_err(|_| "supervisor unavailable".to_string())?
    }

    pub async fn stop(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Stop {
                id: id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn restart(&self, id: &str) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Restart {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| "supervisor unavailable".to_string())?;
        rx.await.map_err(|_| "supervisor unavailable".to_string())?
    }

    /// Bounded, lossy feed from the health monitor; a dropped report is
    /// replaced by the next probe cycle anyway.
    pub fn try_health_report(&self, report: HealthReport) {
        if self.tx.try_send(Command::HealthReport(report)).is_err() {
            warn!("supervisor queue full, dropping health report");
        }
    }

    pub fn try_request_restart(&self, id: &str) {
        if self
            .tx
            .try_send(Command::RequestRestart { id: id.to_string() })
            .is_err()
        {
            warn!(server_id = %id, "supervisor queue full, dropping restart request");
        }
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// The single-writer reconciler. All registry, fallback-state and port-pool
/// mutations happen on this actor; child-exit handling and reconciliation
/// are serialized here by construction. Waits (warmups, graceful stops,
/// restart delays) never hold a lock.
pub struct Supervisor {
    shared: Arc<Shared>,
    launcher: BridgeLauncher,
    spawner: Arc<dyn ProcessSpawner>,
    prober: Arc<dyn HealthProber>,
    board: Arc<ErrorBoard>,
    secrets: Arc<SecretStore>,
    timings: SupervisorTimings,
    default_proxy_type: ProxyType,
    rx: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl Supervisor {
    pub fn new(
        shared: Arc<Shared>,
        launcher: BridgeLauncher,
        spawner: Arc<dyn ProcessSpawner>,
        prober: Arc<dyn HealthProber>,
        board: Arc<ErrorBoard>,
        secrets: Arc<SecretStore>,
        timings: SupervisorTimings,
        default_proxy_type: ProxyType,
        shutdown: CancellationToken,
    ) -> (Self, SupervisorHandle) {
        let (tx, rx) = mpsc::channel(CMD_CAPACITY);
        (
            Self {
                shared,
                launcher,
                spawner,
                prober,
                board,
                secrets,
                timings,
                default_proxy_type,
                rx,
                shutdown,
            },
            SupervisorHandle { tx },
        )
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.timings.exit_poll);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.shutdown_all().await;
                    break;
                }
                _ = tick.tick() => self.poll_children().await,
                cmd = self.rx.recv() => match cmd {
                    None => break,
                    Some(cmd) => {
                        if self.handle(cmd).await {
                            break;
                        }
                    }
                }
            }
        }
        info!("supervisor stopped");
    }

    /// Returns true when the actor should exit.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Reconcile { desired, reply } => {
                self.reconcile(desired).await;
                let _ = reply.send(());
            }
            Command::Start { id, reply } => {
                let _ = reply.send(self.operator_start(&id).await);
            }
            Command::Stop { id, reply } => {
                let _ = reply.send(self.stop_server(&id).await);
            }
            Command::Restart { id, reply } => {
                let _ = reply.send(self.operator_restart(&id).await);
            }
            Command::HealthReport(report) => self.apply_health_report(report),
            Command::RequestRestart { id } => self.remediation_restart(&id).await,
            Command::Shutdown { reply } => {
                self.shutdown_all().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// One pass over (desired, live): stops first, then starts, with the
    /// drain spacing bridges need to let their ports leave TIME_WAIT.
    async fn reconcile(&mut self, desired: Vec<ServerSpec>) {
        let live_count = self.shared.registry.read().len();
        if desired.is_empty() && live_count > MASS_SHUTDOWN_GUARD {
            warn!(
                live = live_count,
                "reload produced an empty desired set; refusing mass shutdown"
            );
            return;
        }

        *self.shared.desired.write() = desired.clone();

        let wanted: HashSet<&str> = desired
            .iter()
            .filter(|s| s.needs_proxy)
            .map(|s| s.id.as_str())
            .collect();
        let removals: Vec<String> = {
            let reg = self.shared.registry.read();
            reg.keys()
                .filter(|id| !wanted.contains(id.as_str()))
                .cloned()
                .collect()
        };

        let removal_count = removals.len();
        for (index, id) in removals.iter().enumerate() {
            info!(server_id = %id, "stopping server removed from catalog");
            self.stop_server(id).await;
            if index + 1 < removal_count {
                tokio::time::sleep(self.timings.stop_spacing).await;
            }
        }
        if removal_count > 3 {
            tokio::time::sleep(self.timings.mass_stop_settle).await;
        }

        for spec in desired {
            if !spec.needs_proxy {
                debug!(server_id = %spec.id, "entry does not need a proxy, skipping");
                continue;
            }
            let secrets = self.secrets.load(&spec.id);
            let effective = spec.with_secrets(&secrets);
            let current = {
                let reg = self.shared.registry.read();
                reg.get(&spec.id).map(|e| e.spec.clone())
            };
            match current {
                None => {
                    let _ = self.start_cycle(effective, 0).await;
                }
                Some(running) if running != effective => {
                    info!(server_id = %spec.id, "effective spec changed, replacing");
                    self.stop_server(&spec.id).await;
                    let _ = self.start_cycle(effective, 0).await;
                }
                Some(_) => {}
            }
        }
    }

    async fn operator_start(&mut self, id: &str) -> Result<(), String> {
        if self.shared.registry.read().contains_key(id) {
            return Ok(());
        }
        let spec = {
            let desired = self.shared.desired.read();
            desired.iter().find(|s| s.id == id).cloned()
        };
        match spec {
            None => Err(format!("unknown server: {id}")),
            Some(s) if !s.needs_proxy => Err(format!("server {id} does not need a proxy")),
            Some(s) => {
                let secrets = self.secrets.load(id);
                self.start_cycle(s.with_secrets(&secrets), 0).await
            }
        }
    }

    /// Operator restart: resets the restart counter; the damper still applies.
    async fn operator_restart(&mut self, id: &str) -> Result<(), String> {
        let running_spec = {
            let reg = self.shared.registry.read();
            reg.get(id).map(|e| e.spec.clone())
        };
        let effective = match running_spec {
            Some(spec) => spec,
            None => {
                let desired = self.shared.desired.read();
                let Some(spec) = desired.iter().find(|s| s.id == id).cloned() else {
                    return Err(format!("unknown server: {id}"));
                };
                drop(desired);
                let secrets = self.secrets.load(id);
                spec.with_secrets(&secrets)
            }
        };
        self.stop_server(id).await;
        self.start_cycle(effective, 0).await
    }

    /// The start procedure: damper, port, proxy-type try-order, spawn,
    /// warmup, first probe, fallback.
    async fn start_cycle(&mut self, spec: ServerSpec, restart_count: u32) -> Result<(), String> {
        let id = spec.id.clone();

        {
            let mut fallback = self.shared.fallback.lock();
            let state = fallback.entry(id.clone()).or_default();
            if let Some(last) = state.last_attempt_at {
                if last.elapsed() >= self.timings.damper_window {
                    *state = FallbackState::default();
                }
            }
            if state.total_attempts >= MAX_START_ATTEMPTS {
                drop(fallback);
                warn!(server_id = %id, "crash-loop damper active, refusing start");
                self.board.record(
                    &id,
                    format!("start refused: {MAX_START_ATTEMPTS} attempts in the damper window"),
                    ErrorType::Runtime,
                );
                self.shared.failed.write().insert(id.clone());
                return Err(format!("crash-loop damper active for {id}"));
            }
            state.total_attempts += 1;
            state.last_attempt_at = Some(Instant::now());
        }

        let Some(mut port) = self.shared.ports.lock().allocate(&id) else {
            self.board
                .record(&id, "no free port in configured range", ErrorType::Resource);
            self.shared.failed.write().insert(id.clone());
            return Err(format!("no free port for {id}"));
        };

        let try_order: Vec<ProxyType> = match spec.proxy_type_hint {
            Some(hint) => vec![hint],
            None => [self.default_proxy_type, self.default_proxy_type.other()]
                .into_iter()
                .filter(|t| launcher::supports(*t, spec.kind))
                .collect(),
        };
        if try_order.is_empty() {
            self.shared.ports.lock().release(&id);
            self.board
                .record(&id, "no proxy type can serve this server", ErrorType::Config);
            self.shared.failed.write().insert(id.clone());
            return Err(format!("no usable proxy type for {id}"));
        }

        let last_index = try_order.len() - 1;
        for (index, proxy_type) in try_order.iter().copied().enumerate() {
            let is_last = index == last_index;
            {
                let mut fallback = self.shared.fallback.lock();
                let state = fallback.entry(id.clone()).or_default();
                state.attempted.insert(proxy_type);
                state.last_attempt_at = Some(Instant::now());
            }

            let plan = match self.launcher.plan(&spec, port, proxy_type) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(server_id = %id, %proxy_type, error = %err, "launch plan rejected");
                    self.board.record(&id, err.to_string(), ErrorType::Config);
                    if is_last {
                        self.shared.ports.lock().release(&id);
                        self.shared.failed.write().insert(id.clone());
                        return Err(err.to_string());
                    }
                    continue;
                }
            };

            let child = match self.spawner.spawn(&plan).await {
                Ok(child) => child,
                Err(err) => {
                    let message = err.to_string();
                    warn!(server_id = %id, %proxy_type, error = %message, "spawn failed");
                    let error_type = classify::classify_message(&message);
                    self.board.record(&id, message.clone(), error_type);
                    if let Some(dir) = &plan.workdir {
                        let _ = std::fs::remove_dir_all(dir);
                    }
                    if is_last {
                        self.shared.ports.lock().release(&id);
                        self.shared.failed.write().insert(id.clone());
                        return Err(message);
                    }
                    continue;
                }
            };

            let warmup = if spec.kind.is_remote() {
                self.timings.warmup_remote
            } else {
                self.timings.warmup_stdio
            };
            info!(
                server_id = %id,
                port,
                %proxy_type,
                pid = child.pid(),
                "bridge spawned, warming up"
            );
            {
                let mut reg = self.shared.registry.write();
                reg.insert(
                    id.clone(),
                    ProxyProcess {
                        server_id: id.clone(),
                        port,
                        proxy_type,
                        pid: child.pid(),
                        started_at: time::OffsetDateTime::now_utc().unix_timestamp(),
                        started_mono: Instant::now(),
                        warmup,
                        restart_count,
                        fallback_used: index > 0,
                        auth_error: false,
                        healthy: false,
                        state: ServerState::Starting,
                        spec: spec.clone(),
                        workdir: plan.workdir.clone(),
                        child: Some(child),
                    },
                );
            }
            self.shared.failed.write().remove(&id);

            tokio::time::sleep(warmup).await;

            let probe = self.prober.probe(&id, port, spec.kind).await;

            if probe.healthy {
                self.board.clear(&id);
                let mut reg = self.shared.registry.write();
                if let Some(entry) = reg.get_mut(&id) {
                    entry.state = ServerState::Healthy;
                    entry.healthy = true;
                    entry.auth_error = false;
                }
                info!(server_id = %id, port, %proxy_type, "server healthy");
                return Ok(());
            }

            if probe.auth_error {
                self.board
                    .record(&id, "authentication required (HTTP 401)", ErrorType::Auth);
                let mut reg = self.shared.registry.write();
                if let Some(entry) = reg.get_mut(&id) {
                    entry.state = ServerState::AuthRequired;
                    entry.auth_error = true;
                    entry.healthy = false;
                }
                warn!(server_id = %id, "server requires credentials; leaving it running");
                return Ok(());
            }

            self.board.record(
                &id,
                probe
                    .error
                    .clone()
                    .unwrap_or_else(|| "health probe failed".to_string()),
                ErrorType::Health,
            );

            if is_last {
                let mut reg = self.shared.registry.write();
                if let Some(entry) = reg.get_mut(&id) {
                    entry.state = ServerState::Unhealthy;
                    entry.healthy = false;
                }
                warn!(server_id = %id, %proxy_type, "first probe failed on final proxy type; monitor takes over");
                return Ok(());
            }

            warn!(server_id = %id, %proxy_type, "first probe failed, falling back to next proxy type");
            let taken = {
                let mut reg = self.shared.registry.write();
                reg.remove(&id)
            };
            if let Some(mut entry) = taken {
                if let Some(child) = entry.child.take() {
                    stop_child(child, self.timings.graceful_stop).await;
                }
                if let Some(dir) = &entry.workdir {
                    let _ = std::fs::remove_dir_all(dir);
                }
            }
            self.shared.ports.lock().release(&id);
            tokio::time::sleep(self.timings.fallback_pause).await;
            port = match self.shared.ports.lock().allocate(&id) {
                Some(p) => p,
                None => {
                    self.board
                        .record(&id, "no free port in configured range", ErrorType::Resource);
                    self.shared.failed.write().insert(id.clone());
                    return Err(format!("no free port for {id}"));
                }
            };
        }

        self.shared.ports.lock().release(&id);
        self.shared.failed.write().insert(id.clone());
        Err(format!("no proxy type worked for {id}"))
    }

    /// SIGTERM, graceful wait, SIGKILL; registry removal, port release,
    /// workdir cleanup. Fallback state is left intact.
    async fn stop_server(&self, id: &str) -> bool {
        let taken = {
            let mut reg = self.shared.registry.write();
            match reg.get_mut(id) {
                Some(entry) => {
                    entry.state = ServerState::Stopping;
                    Some((entry.child.take(), entry.workdir.clone()))
                }
                None => None,
            }
        };
        let Some((child, workdir)) = taken else {
            return false;
        };
        if let Some(child) = child {
            stop_child(child, self.timings.graceful_stop).await;
        }
        self.shared.registry.write().remove(id);
        self.shared.ports.lock().release(id);
        if let Some(dir) = workdir {
            let _ = std::fs::remove_dir_all(&dir);
        }
        info!(server_id = %id, "server stopped");
        true
    }

    /// Exit-poll tick: detect children that died on their own.
    async fn poll_children(&mut self) {
        let exits: Vec<(String, ExitOutcome)> = {
            let mut reg = self.shared.registry.write();
            reg.iter_mut()
                .filter(|(_, entry)| entry.state != ServerState::Stopping)
                .filter_map(|(id, entry)| {
                    entry
                        .child
                        .as_mut()
                        .and_then(|child| child.try_wait())
                        .map(|outcome| (id.clone(), outcome))
                })
                .collect()
        };
        for (id, outcome) in exits {
            self.handle_exit(id, outcome).await;
        }
    }

    async fn handle_exit(&mut self, id: String, outcome: ExitOutcome) {
        let entry = {
            let mut reg = self.shared.registry.write();
            reg.remove(&id)
        };
        let Some(entry) = entry else { return };
        self.shared.ports.lock().release(&id);
        if let Some(dir) = &entry.workdir {
            let _ = std::fs::remove_dir_all(dir);
        }

        if outcome.expected() {
            info!(server_id = %id, "bridge exited cleanly");
        } else {
            warn!(
                server_id = %id,
                code = ?outcome.code,
                signal = ?outcome.signal,
                "bridge exited unexpectedly"
            );
            // The stderr classifier may already hold a more specific
            // diagnosis; the board arbitrates.
            if let Some(code) = outcome.code {
                self.board.record_exit(&id, code);
            } else if let Some(signal) = outcome.signal {
                let error_type = if signal == libc::SIGKILL {
                    ErrorType::Resource
                } else {
                    ErrorType::Runtime
                };
                self.board
                    .record(&id, format!("process killed by signal {signal}"), error_type);
            }
        }

        let still_desired = {
            let desired = self.shared.desired.read();
            desired.iter().any(|s| s.id == id && s.needs_proxy)
        };
        if !still_desired {
            return;
        }

        if entry.restart_count >= MAX_RESTARTS {
            warn!(server_id = %id, "restart budget exhausted");
            self.shared.failed.write().insert(id);
            return;
        }

        tokio::time::sleep(self.timings.restart_delay).await;
        let _ = self
            .start_cycle(entry.spec.clone(), entry.restart_count + 1)
            .await;
    }

    fn apply_health_report(&mut self, report: HealthReport) {
        let cleared = {
            let mut reg = self.shared.registry.write();
            let Some(entry) = reg.get_mut(&report.server_id) else {
                return;
            };
            if matches!(entry.state, ServerState::Starting | ServerState::Stopping) {
                return;
            }
            if report.healthy {
                entry.healthy = true;
                entry.auth_error = false;
                entry.state = ServerState::Healthy;
                true
            } else {
                entry.healthy = false;
                if report.auth_error {
                    entry.auth_error = true;
                    entry.state = ServerState::AuthRequired;
                } else {
                    entry.state = ServerState::Unhealthy;
                }
                false
            }
        };
        if cleared {
            self.board.clear(&report.server_id);
        } else if report.auth_error {
            self.board.record(
                &report.server_id,
                "authentication required (HTTP 401)",
                ErrorType::Auth,
            );
        } else if let Some(message) = report.error {
            self.board
                .record(&report.server_id, message, ErrorType::Health);
        }
    }

    /// Monitor-requested restart; counted against the same caps.
    async fn remediation_restart(&mut self, id: &str) {
        let info = {
            let reg = self.shared.registry.read();
            reg.get(id)
                .map(|e| (e.restart_count, e.auth_error, e.spec.clone()))
        };
        let Some((restart_count, auth_error, spec)) = info else {
            return;
        };
        if auth_error {
            debug!(server_id = %id, "skipping remediation for auth-required server");
            return;
        }
        if restart_count >= MAX_RESTARTS {
            warn!(server_id = %id, "remediation budget exhausted, marking failed");
            self.stop_server(id).await;
            self.shared.failed.write().insert(id.to_string());
            return;
        }
        info!(server_id = %id, restart_count, "health monitor requested restart");
        self.stop_server(id).await;
        tokio::time::sleep(self.timings.restart_delay).await;
        let _ = self.start_cycle(spec, restart_count + 1).await;
    }

    /// Full shutdown: stop everything in parallel with the graceful window.
    async fn shutdown_all(&mut self) {
        let children: Vec<(String, Option<Box<dyn ChildProc>>, Option<PathBuf>)> = {
            let mut reg = self.shared.registry.write();
            reg.drain()
                .map(|(id, mut entry)| (id, entry.child.take(), entry.workdir.clone()))
                .collect()
        };
        if children.is_empty() {
            return;
        }
        info!(count = children.len(), "stopping all bridges");
        let grace = self.timings.graceful_stop;
        let mut set = tokio::task::JoinSet::new();
        for (id, child, workdir) in children {
            set.spawn(async move {
                if let Some(child) = child {
                    stop_child(child, grace).await;
                }
                if let Some(dir) = workdir {
                    let _ = std::fs::remove_dir_all(&dir);
                }
                debug!(server_id = %id, "stopped");
            });
        }
        while set.join_next().await.is_some() {}
        let ids: Vec<String> = self
            .shared
            .ports
            .lock()
            .entries()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            self.shared.ports.lock().release(&id);
        }
    }
}

/// SIGTERM, wait for the grace period, then SIGKILL.
pub(crate) async fn stop_child(mut child: Box<dyn ChildProc>, grace: Duration) {
    child.signal_term();
    let deadline = Instant::now() + grace;
    loop {
        if child.try_wait().is_some() {
            return;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    child.kill();
    for _ in 0..20 {
        if child.try_wait().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    warn!("child did not exit after SIGKILL");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::FakeProber;
    use crate::probe::ProbeResult;
    use crate::spawn::fake::{FakeBehavior, FakeSpawner};

    struct Harness {
        shared: Arc<Shared>,
        handle: SupervisorHandle,
        spawner: Arc<FakeSpawner>,
        prober: Arc<FakeProber>,
        board: Arc<ErrorBoard>,
        shutdown: CancellationToken,
        _tmp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with(SupervisorTimings::fast(), 4000, 4005)
    }

    fn harness_with(timings: SupervisorTimings, port_start: u16, port_end: u16) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let shared = Shared::new(PortPool::with_cooldown(
            port_start,
            port_end,
            Duration::from_millis(30),
        ));
        let spawner = FakeSpawner::new();
        let prober = FakeProber::new();
        let board = Arc::new(ErrorBoard::new());
        let secrets = Arc::new(SecretStore::memory_only());
        let shutdown = CancellationToken::new();
        let launcher = BridgeLauncher::new(tmp.path().to_path_buf());
        let (supervisor, handle) = Supervisor::new(
            Arc::clone(&shared),
            launcher,
            spawner.clone() as Arc<dyn ProcessSpawner>,
            prober.clone() as Arc<dyn HealthProber>,
            Arc::clone(&board),
            secrets,
            timings,
            ProxyType::Mcpo,
            shutdown.clone(),
        );
        tokio::spawn(supervisor.run());
        Harness {
            shared,
            handle,
            spawner,
            prober,
            board,
            shutdown,
            _tmp: tmp,
        }
    }

    fn memory_spec() -> ServerSpec {
        ServerSpec::stdio(
            "memory",
            "npx",
            vec!["-y".into(), "@modelcontextprotocol/server-memory".into()],
        )
    }

    fn entry_view(
        shared: &Shared,
        id: &str,
    ) -> Option<(u16, ProxyType, bool, bool, bool, ServerState, u32)> {
        let reg = shared.registry.read();
        reg.get(id).map(|e| {
            (
                e.port,
                e.proxy_type,
                e.healthy,
                e.auth_error,
                e.fallback_used,
                e.state,
                e.restart_count,
            )
        })
    }

    #[tokio::test]
    async fn happy_start_allocates_first_port() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;

        let (port, proxy_type, healthy, auth, fallback, state, _) =
            entry_view(&h.shared, "memory").unwrap();
        assert_eq!(port, 4000);
        assert_eq!(proxy_type, ProxyType::Mcpo);
        assert!(healthy);
        assert!(!auth);
        assert!(!fallback);
        assert_eq!(state, ServerState::Healthy);
        assert_eq!(h.spawner.spawn_count("memory"), 1);
        assert!(h.board.get("memory").is_none());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn fallback_to_mcp_bridge_on_first_probe_failure() {
        let h = harness();
        h.prober.script("memory", ProbeResult::failed(Some(500)));
        h.prober.script("memory", ProbeResult::ok());

        h.handle.reconcile(vec![memory_spec()]).await;

        let (port, proxy_type, healthy, _, fallback, state, _) =
            entry_view(&h.shared, "memory").unwrap();
        assert_eq!(proxy_type, ProxyType::McpBridge);
        assert!(fallback);
        assert!(healthy);
        assert_eq!(state, ServerState::Healthy);
        assert_eq!(port, 4000, "same port reclaimed after drain");

        let plans = h.spawner.spawned.lock();
        assert_eq!(plans.len(), 2);
        assert!(plans[0].args.contains(&"mcpo".to_string()));
        assert_eq!(plans[1].args, vec!["mcp-bridge"]);
        let workdir = plans[1].workdir.clone().unwrap();
        assert!(workdir.join("config.json").exists());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn auth_required_stops_fallback_iteration() {
        let h = harness();
        h.prober.script("api", ProbeResult::auth_required());
        let spec = ServerSpec::remote("api", ServerKind::Sse, "https://x/sse");
        h.handle.reconcile(vec![spec]).await;

        let (_, proxy_type, healthy, auth, fallback, state, _) =
            entry_view(&h.shared, "api").unwrap();
        assert_eq!(proxy_type, ProxyType::Mcpo);
        assert!(!healthy);
        assert!(auth);
        assert!(!fallback);
        assert_eq!(state, ServerState::AuthRequired);
        assert_eq!(h.spawner.spawn_count("api"), 1);
        assert_eq!(h.board.get("api").unwrap().error_type, ErrorType::Auth);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn proxy_type_hint_disables_fallback() {
        let h = harness();
        h.prober.set_default(ProbeResult::failed(Some(500)));
        let mut spec = memory_spec();
        spec.proxy_type_hint = Some(ProxyType::Mcpo);
        h.handle.reconcile(vec![spec]).await;

        let (_, proxy_type, healthy, _, fallback, state, _) =
            entry_view(&h.shared, "memory").unwrap();
        assert_eq!(proxy_type, ProxyType::Mcpo);
        assert!(!healthy);
        assert!(!fallback);
        assert_eq!(state, ServerState::Unhealthy);
        assert_eq!(h.spawner.spawn_count("memory"), 1, "no alternate attempted");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn remote_kind_never_tries_mcp_bridge() {
        let h = harness();
        h.prober.set_default(ProbeResult::failed(Some(500)));
        let spec = ServerSpec::remote("api", ServerKind::StreamableHttp, "https://x/mcp");
        h.handle.reconcile(vec![spec]).await;

        assert_eq!(h.spawner.spawn_count("api"), 1);
        let (_, proxy_type, _, _, _, state, _) = entry_view(&h.shared, "api").unwrap();
        assert_eq!(proxy_type, ProxyType::Mcpo);
        assert_eq!(state, ServerState::Unhealthy);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn non_whitelisted_command_fails_before_spawn() {
        let h = harness();
        let spec = ServerSpec::stdio("shady", "bash", vec!["-c".into(), "true".into()]);
        h.handle.reconcile(vec![spec]).await;

        assert_eq!(h.spawner.spawn_count("shady"), 0);
        assert!(h.shared.registry.read().get("shady").is_none());
        assert!(h.shared.failed.read().contains("shady"));
        assert_eq!(h.board.get("shady").unwrap().error_type, ErrorType::Config);
        // The failed port was released.
        assert_eq!(h.shared.ports.lock().entries().len(), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn needs_proxy_false_is_skipped() {
        let h = harness();
        let mut spec = memory_spec();
        spec.needs_proxy = false;
        h.handle.reconcile(vec![spec]).await;
        assert_eq!(h.spawner.spawn_count("memory"), 0);
        assert!(h.shared.registry.read().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn hot_reload_removes_only_dropped_server() {
        let h = harness();
        let specs = vec![
            ServerSpec::stdio("a", "npx", vec![]),
            ServerSpec::stdio("b", "npx", vec![]),
            ServerSpec::stdio("c", "npx", vec![]),
        ];
        h.handle.reconcile(specs.clone()).await;
        assert_eq!(h.shared.registry.read().len(), 3);
        let port_a = entry_view(&h.shared, "a").unwrap().0;

        h.handle
            .reconcile(vec![specs[0].clone(), specs[2].clone()])
            .await;

        let reg_len = h.shared.registry.read().len();
        assert_eq!(reg_len, 2);
        assert!(h.shared.registry.read().get("b").is_none());
        assert_eq!(entry_view(&h.shared, "a").unwrap().0, port_a);
        // Unchanged servers were not respawned.
        assert_eq!(h.spawner.spawn_count("a"), 1);
        assert_eq!(h.spawner.spawn_count("c"), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn changed_spec_triggers_replace() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;
        assert_eq!(h.spawner.spawn_count("memory"), 1);

        let mut changed = memory_spec();
        changed.args.push("--verbose".into());
        h.handle.reconcile(vec![changed]).await;
        assert_eq!(h.spawner.spawn_count("memory"), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_desired_with_many_live_is_refused() {
        let h = harness();
        let specs: Vec<ServerSpec> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| ServerSpec::stdio(*id, "npx", vec![]))
            .collect();
        h.handle.reconcile(specs).await;
        assert_eq!(h.shared.registry.read().len(), 5);

        h.handle.reconcile(Vec::new()).await;
        assert_eq!(h.shared.registry.read().len(), 5, "mass shutdown refused");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn empty_desired_with_few_live_proceeds() {
        let h = harness();
        h.handle
            .reconcile(vec![
                ServerSpec::stdio("a", "npx", vec![]),
                ServerSpec::stdio("b", "npx", vec![]),
            ])
            .await;
        assert_eq!(h.shared.registry.read().len(), 2);

        h.handle.reconcile(Vec::new()).await;
        assert!(h.shared.registry.read().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn crash_loop_hits_damper_and_fourth_start_is_refused() {
        let h = harness();
        h.prober.set_default(ProbeResult::failed(None));
        // Every spawn dies almost immediately with exit 1, on both types.
        for _ in 0..16 {
            h.spawner
                .script("crashy", FakeBehavior::exits(1, Duration::from_millis(1)));
        }
        let spec = ServerSpec::stdio("crashy", "npx", vec![]);
        h.handle.reconcile(vec![spec]).await;

        // Let exit polling, restarts and the damper play out.
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(h.shared.failed.read().contains("crashy"));
        assert!(h.shared.registry.read().get("crashy").is_none());
        let record = h.board.get("crashy").unwrap();
        assert_eq!(record.error_type, ErrorType::Runtime);

        let attempts = {
            let fb = h.shared.fallback.lock();
            fb.get("crashy").unwrap().total_attempts
        };
        assert_eq!(attempts, MAX_START_ATTEMPTS);

        // Operator start inside the window is refused by the damper.
        let err = h.handle.start("crashy").await.unwrap_err();
        assert!(err.contains("damper"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn damper_window_expiry_allows_start_again() {
        let mut timings = SupervisorTimings::fast();
        timings.damper_window = Duration::from_millis(100);
        let h = harness_with(timings, 4000, 4005);
        // Seed the desired set without starting anything.
        {
            *h.shared.desired.write() = vec![ServerSpec::stdio("crashy", "npx", vec![])];
        }
        // Damper tripped moments ago: start refused.
        {
            let mut fb = h.shared.fallback.lock();
            fb.insert(
                "crashy".to_string(),
                FallbackState {
                    attempted: HashSet::new(),
                    total_attempts: MAX_START_ATTEMPTS,
                    last_attempt_at: Some(Instant::now()),
                },
            );
        }
        let err = h.handle.start("crashy").await.unwrap_err();
        assert!(err.contains("damper"));

        // After the window, the state resets and a start is accepted.
        tokio::time::sleep(Duration::from_millis(130)).await;
        h.handle.start("crashy").await.unwrap();
        assert!(entry_view(&h.shared, "crashy").unwrap().2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn operator_stop_and_idempotent_start() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;

        // Idempotent: starting a running server is a no-op.
        h.handle.start("memory").await.unwrap();
        assert_eq!(h.spawner.spawn_count("memory"), 1);

        assert!(h.handle.stop("memory").await);
        assert!(h.shared.registry.read().is_empty());
        assert!(!h.handle.stop("memory").await);

        h.handle.start("memory").await.unwrap();
        assert_eq!(h.spawner.spawn_count("memory"), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn operator_start_unknown_server_errors() {
        let h = harness();
        let err = h.handle.start("ghost").await.unwrap_err();
        assert!(err.contains("unknown server"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn operator_restart_resets_counter() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;
        {
            let mut reg = h.shared.registry.write();
            reg.get_mut("memory").unwrap().restart_count = 2;
        }
        h.handle.restart("memory").await.unwrap();
        let (_, _, healthy, _, _, _, restart_count) = entry_view(&h.shared, "memory").unwrap();
        assert!(healthy);
        assert_eq!(restart_count, 0);
        assert_eq!(h.spawner.spawn_count("memory"), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn unexpected_exit_restarts_with_bumped_counter() {
        let h = harness();
        // First child dies after 40ms, replacement stays up.
        h.spawner
            .script("memory", FakeBehavior::exits(1, Duration::from_millis(40)));
        h.spawner.script("memory", FakeBehavior::stays_alive());
        h.handle.reconcile(vec![memory_spec()]).await;
        assert!(entry_view(&h.shared, "memory").unwrap().2);

        tokio::time::sleep(Duration::from_millis(250)).await;

        let (_, _, healthy, _, _, _, restart_count) = entry_view(&h.shared, "memory").unwrap();
        assert!(healthy);
        assert_eq!(restart_count, 1);
        assert_eq!(h.spawner.spawn_count("memory"), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn removed_server_is_not_restarted_after_exit() {
        let h = harness();
        h.spawner
            .script("memory", FakeBehavior::exits(1, Duration::from_millis(40)));
        h.handle.reconcile(vec![memory_spec()]).await;
        // Drop it from the desired set before the child dies.
        {
            h.shared.desired.write().clear();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.shared.registry.read().is_empty());
        assert_eq!(h.spawner.spawn_count("memory"), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn port_exhaustion_marks_failed() {
        let h = harness_with(SupervisorTimings::fast(), 4000, 4000);
        h.handle
            .reconcile(vec![
                ServerSpec::stdio("a", "npx", vec![]),
                ServerSpec::stdio("b", "npx", vec![]),
            ])
            .await;
        assert!(entry_view(&h.shared, "a").is_some());
        assert!(h.shared.failed.read().contains("b"));
        assert_eq!(h.board.get("b").unwrap().error_type, ErrorType::Resource);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn health_report_transitions_states() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;

        h.handle.try_health_report(HealthReport {
            server_id: "memory".into(),
            healthy: false,
            auth_error: false,
            error: Some("probe timed out".into()),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, _, healthy, _, _, state, _) = entry_view(&h.shared, "memory").unwrap();
        assert!(!healthy);
        assert_eq!(state, ServerState::Unhealthy);
        assert_eq!(h.board.get("memory").unwrap().error_type, ErrorType::Health);

        h.handle.try_health_report(HealthReport {
            server_id: "memory".into(),
            healthy: true,
            auth_error: false,
            error: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, _, healthy, _, _, state, _) = entry_view(&h.shared, "memory").unwrap();
        assert!(healthy);
        assert_eq!(state, ServerState::Healthy);
        assert!(h.board.get("memory").is_none(), "healthy probe clears error");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn remediation_restart_counts_against_caps() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;
        h.handle.try_request_restart("memory");
        tokio::time::sleep(Duration::from_millis(150)).await;
        let (_, _, _, _, _, _, restart_count) = entry_view(&h.shared, "memory").unwrap();
        assert_eq!(restart_count, 1);
        assert_eq!(h.spawner.spawn_count("memory"), 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn remediation_exhausted_budget_marks_failed() {
        let h = harness();
        h.handle.reconcile(vec![memory_spec()]).await;
        {
            let mut reg = h.shared.registry.write();
            reg.get_mut("memory").unwrap().restart_count = MAX_RESTARTS;
        }
        h.handle.try_request_restart("memory");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.shared.registry.read().is_empty());
        assert!(h.shared.failed.read().contains("memory"));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn registry_ports_match_pool_invariant() {
        let h = harness();
        h.handle
            .reconcile(vec![
                ServerSpec::stdio("a", "npx", vec![]),
                ServerSpec::stdio("b", "npx", vec![]),
                ServerSpec::stdio("c", "npx", vec![]),
            ])
            .await;
        let registry_ports: HashSet<u16> = h
            .shared
            .registry
            .read()
            .values()
            .map(|p| p.port)
            .collect();
        let pool_ports: HashSet<u16> = h
            .shared
            .ports
            .lock()
            .entries()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(registry_ports, pool_ports);
        assert_eq!(registry_ports.len(), 3);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let h = harness();
        h.handle
            .reconcile(vec![
                ServerSpec::stdio("a", "npx", vec![]),
                ServerSpec::stdio("b", "npx", vec![]),
            ])
            .await;
        h.handle.shutdown().await;
        assert!(h.shared.registry.read().is_empty());
    }
}
