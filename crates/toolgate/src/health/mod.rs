use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::{HealthProber, ProbeResult};
use crate::supervisor::{HealthReport, Shared, SupervisorHandle};

pub const HISTORY_CAPACITY: usize = 100;
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

const ALERT_CONSECUTIVE_FAILURES: usize = 3;
const ALERT_FAILURE_RATE: f64 = 0.8;
const ALERT_SLOW_RESPONSE_MS: u64 = 10_000;
const REMEDIATE_CONSECUTIVE_FAILURES: usize = 5;
const REMEDIATE_FAILURE_RATE: f64 = 0.9;
/// Window for the recent failure rate.
const RECENT_WINDOW: usize = 10;

/// One probe observation, kept in a bounded per-server ring buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Unix timestamp (seconds).
    pub at: i64,
    pub healthy: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub endpoint: String,
    pub auth_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ProbeResult> for HealthRecord {
    fn from(result: &ProbeResult) -> Self {
        Self {
            at: time::OffsetDateTime::now_utc().unix_timestamp(),
            healthy: result.healthy,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            endpoint: result.endpoint.clone(),
            auth_error: result.auth_error,
            error: result.error.clone(),
        }
    }
}

/// Metrics derived from one server's ring buffer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub samples: usize,
    /// Percentage of healthy probes across the whole buffer.
    pub uptime_percent: f64,
    /// Failure rate over the last ten probes.
    pub recent_failure_rate: f64,
    /// Failed probes at the tail of the buffer.
    pub consecutive_failures: usize,
    /// Average response time over healthy probes, milliseconds.
    pub avg_response_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub kind: &'static str,
    pub severity: AlertSeverity,
    pub detail: String,
}

/// Per-server probe history. The monitor writes, the management API reads;
/// the fixed capacity is the concurrency bound.
#[derive(Default)]
pub struct HealthHistory {
    inner: RwLock<HashMap<String, VecDeque<HealthRecord>>>,
}

impl HealthHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, server_id: &str, record: HealthRecord) {
        let mut inner = self.inner.write();
        let buffer = inner.entry(server_id.to_string()).or_default();
        if buffer.len() == HISTORY_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(record);
    }

    pub fn records(&self, server_id: &str) -> Vec<HealthRecord> {
        self.inner
            .read()
            .get(server_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, server_id: &str) -> Option<HealthRecord> {
        self.inner
            .read()
            .get(server_id)
            .and_then(|buffer| buffer.back().cloned())
    }

    pub fn metrics(&self, server_id: &str) -> Option<HealthMetrics> {
        let inner = self.inner.read();
        let buffer = inner.get(server_id)?;
        if buffer.is_empty() {
            return None;
        }

        let samples = buffer.len();
        let healthy_count = buffer.iter().filter(|r| r.healthy).count();
        let uptime_percent = healthy_count as f64 / samples as f64 * 100.0;

        let recent: Vec<&HealthRecord> = buffer.iter().rev().take(RECENT_WINDOW).collect();
        let recent_failures = recent.iter().filter(|r| !r.healthy).count();
        let recent_failure_rate = recent_failures as f64 / recent.len() as f64;

        let consecutive_failures = buffer.iter().rev().take_while(|r| !r.healthy).count();

        let avg_response_ms = if healthy_count == 0 {
            0.0
        } else {
            buffer
                .iter()
                .filter(|r| r.healthy)
                .map(|r| r.response_time_ms as f64)
                .sum::<f64>()
                / healthy_count as f64
        };

        Some(HealthMetrics {
            samples,
            uptime_percent,
            recent_failure_rate,
            consecutive_failures,
            avg_response_ms,
        })
    }

    pub fn remove(&self, server_id: &str) {
        self.inner.write().remove(server_id);
    }
}

/// Threshold alerts derived from metrics plus the latest record.
pub fn evaluate_alerts(metrics: &HealthMetrics, latest: &HealthRecord) -> Vec<HealthAlert> {
    let mut alerts = Vec::new();
    if metrics.consecutive_failures >= ALERT_CONSECUTIVE_FAILURES {
        alerts.push(HealthAlert {
            kind: "consecutive_failures",
            severity: AlertSeverity::High,
            detail: format!("{} consecutive failed probes", metrics.consecutive_failures),
        });
    }
    if metrics.samples >= RECENT_WINDOW && metrics.recent_failure_rate >= ALERT_FAILURE_RATE {
        alerts.push(HealthAlert {
            kind: "high_failure_rate",
            severity: AlertSeverity::Medium,
            detail: format!(
                "{:.0}% of recent probes failed",
                metrics.recent_failure_rate * 100.0
            ),
        });
    }
    if latest.healthy && latest.response_time_ms > ALERT_SLOW_RESPONSE_MS {
        alerts.push(HealthAlert {
            kind: "slow_response",
            severity: AlertSeverity::Low,
            detail: format!("latest probe took {} ms", latest.response_time_ms),
        });
    }
    alerts
}

/// Whether the monitor should ask the supervisor for a restart. Auth errors
/// are never remediated (credentials will not appear by restarting), and
/// slow responses alone never trigger one.
pub fn should_remediate(metrics: &HealthMetrics, latest: &HealthRecord) -> bool {
    if latest.auth_error {
        return false;
    }
    // The rate criterion needs a full window; a couple of early failures
    // must not read as a 100% failure rate.
    metrics.consecutive_failures >= REMEDIATE_CONSECUTIVE_FAILURES
        || (metrics.samples >= RECENT_WINDOW
            && metrics.recent_failure_rate >= REMEDIATE_FAILURE_RATE)
}

/// Periodic monitor. Probes all live, warmed-up processes concurrently and
/// feeds observations back to the supervisor; it never spawns or kills.
pub struct HealthMonitor {
    shared: Arc<Shared>,
    prober: Arc<dyn HealthProber>,
    history: Arc<HealthHistory>,
    supervisor: SupervisorHandle,
    interval: Duration,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        shared: Arc<Shared>,
        prober: Arc<dyn HealthProber>,
        history: Arc<HealthHistory>,
        supervisor: SupervisorHandle,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            prober,
            history,
            supervisor,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.sweep().await,
            }
        }
        debug!("health monitor stopped");
    }

    async fn sweep(&self) {
        let snapshot = self.shared.live_snapshot();
        let mut set = tokio::task::JoinSet::new();
        for process in snapshot {
            if !process.ready_for_probe {
                // Probes inside the warmup window must not drive restarts.
                continue;
            }
            let prober = Arc::clone(&self.prober);
            set.spawn(async move {
                let result = prober
                    .probe(&process.server_id, process.port, process.kind)
                    .await;
                (process.server_id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((server_id, result)) = joined else {
                continue;
            };
            let record = HealthRecord::from(&result);
            self.history.append(&server_id, record.clone());

            self.supervisor.try_health_report(HealthReport {
                server_id: server_id.clone(),
                healthy: result.healthy,
                auth_error: result.auth_error,
                error: result.error.clone(),
            });

            let Some(metrics) = self.history.metrics(&server_id) else {
                continue;
            };
            for alert in evaluate_alerts(&metrics, &record) {
                warn!(
                    server_id = %server_id,
                    kind = alert.kind,
                    severity = ?alert.severity,
                    "{}",
                    alert.detail
                );
            }
            if should_remediate(&metrics, &record) {
                self.supervisor.try_request_restart(&server_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(healthy: bool) -> HealthRecord {
        HealthRecord {
            at: 0,
            healthy,
            response_time_ms: 10,
            status_code: Some(if healthy { 200 } else { 500 }),
            endpoint: "/openapi.json".to_string(),
            auth_error: false,
            error: None,
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let history = HealthHistory::new();
        for i in 0..(HISTORY_CAPACITY + 20) {
            let mut r = record(true);
            r.at = i as i64;
            history.append("s", r);
        }
        let records = history.records("s");
        assert_eq!(records.len(), HISTORY_CAPACITY);
        assert_eq!(records[0].at, 20);
        assert_eq!(records.last().unwrap().at, (HISTORY_CAPACITY + 19) as i64);
    }

    #[test]
    fn metrics_computation() {
        let history = HealthHistory::new();
        // 6 healthy at 100ms, then 4 failures.
        for _ in 0..6 {
            let mut r = record(true);
            r.response_time_ms = 100;
            history.append("s", r);
        }
        for _ in 0..4 {
            history.append("s", record(false));
        }
        let m = history.metrics("s").unwrap();
        assert_eq!(m.samples, 10);
        assert!((m.uptime_percent - 60.0).abs() < f64::EPSILON);
        assert!((m.recent_failure_rate - 0.4).abs() < f64::EPSILON);
        assert_eq!(m.consecutive_failures, 4);
        assert!((m.avg_response_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metrics_empty_history_is_none() {
        let history = HealthHistory::new();
        assert!(history.metrics("missing").is_none());
    }

    #[test]
    fn consecutive_failures_reset_by_success() {
        let history = HealthHistory::new();
        history.append("s", record(false));
        history.append("s", record(false));
        history.append("s", record(true));
        history.append("s", record(false));
        let m = history.metrics("s").unwrap();
        assert_eq!(m.consecutive_failures, 1);
    }

    #[test]
    fn alert_consecutive_failures_high() {
        let history = HealthHistory::new();
        for _ in 0..3 {
            history.append("s", record(false));
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        let alerts = evaluate_alerts(&m, &latest);
        assert!(alerts
            .iter()
            .any(|a| a.kind == "consecutive_failures" && a.severity == AlertSeverity::High));
        // Only three samples: not enough history for the rate alert.
        assert!(!alerts.iter().any(|a| a.kind == "high_failure_rate"));
    }

    #[test]
    fn alert_high_failure_rate_needs_full_window() {
        let history = HealthHistory::new();
        history.append("s", record(true));
        history.append("s", record(true));
        for _ in 0..8 {
            history.append("s", record(false));
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        let alerts = evaluate_alerts(&m, &latest);
        assert!(alerts
            .iter()
            .any(|a| a.kind == "high_failure_rate" && a.severity == AlertSeverity::Medium));
    }

    #[test]
    fn alert_slow_response_low() {
        let history = HealthHistory::new();
        let mut r = record(true);
        r.response_time_ms = 12_000;
        history.append("s", r);
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        let alerts = evaluate_alerts(&m, &latest);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, "slow_response");
        assert_eq!(alerts[0].severity, AlertSeverity::Low);
    }

    #[test]
    fn no_alerts_when_healthy_and_fast() {
        let history = HealthHistory::new();
        for _ in 0..10 {
            history.append("s", record(true));
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        assert!(evaluate_alerts(&m, &latest).is_empty());
    }

    #[test]
    fn remediation_thresholds() {
        let history = HealthHistory::new();
        for _ in 0..4 {
            history.append("s", record(false));
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        // 4 consecutive failures and too little history for the rate rule.
        assert!(!should_remediate(&m, &latest));

        let history = HealthHistory::new();
        for _ in 0..6 {
            history.append("s", record(true));
        }
        for _ in 0..5 {
            history.append("s", record(false));
        }
        let m = history.metrics("s").unwrap();
        assert_eq!(m.consecutive_failures, 5);
        assert!(should_remediate(&m, &history.latest("s").unwrap()));
    }

    #[test]
    fn auth_errors_are_never_remediated() {
        let history = HealthHistory::new();
        for _ in 0..8 {
            let mut r = record(false);
            r.auth_error = true;
            r.status_code = Some(401);
            history.append("s", r);
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        assert!(!should_remediate(&m, &latest));
    }

    #[test]
    fn slow_responses_alone_are_not_remediated() {
        let history = HealthHistory::new();
        for _ in 0..10 {
            let mut r = record(true);
            r.response_time_ms = 20_000;
            history.append("s", r);
        }
        let m = history.metrics("s").unwrap();
        let latest = history.latest("s").unwrap();
        assert!(!should_remediate(&m, &latest));
    }

    mod monitor_loop {
        use super::*;
        use crate::classify::ErrorBoard;
        use crate::domain::{ProxyType, ServerSpec};
        use crate::launcher::BridgeLauncher;
        use crate::ports::PortPool;
        use crate::probe::fake::FakeProber;
        use crate::probe::ProbeResult;
        use crate::secrets::SecretStore;
        use crate::spawn::fake::FakeSpawner;
        use crate::spawn::ProcessSpawner;
        use crate::supervisor::{Supervisor, SupervisorTimings};

        #[tokio::test]
        async fn failing_probes_drive_restart_through_supervisor() {
            let tmp = tempfile::tempdir().unwrap();
            let shared = Shared::new(PortPool::with_cooldown(
                4000,
                4005,
                Duration::from_millis(20),
            ));
            let spawner = FakeSpawner::new();
            let prober = FakeProber::new();
            let board = Arc::new(ErrorBoard::new());
            let secrets = Arc::new(SecretStore::memory_only());
            let shutdown = CancellationToken::new();
            let (supervisor, handle) = Supervisor::new(
                Arc::clone(&shared),
                BridgeLauncher::new(tmp.path().to_path_buf()),
                spawner.clone() as Arc<dyn ProcessSpawner>,
                prober.clone() as Arc<dyn HealthProber>,
                board,
                secrets,
                SupervisorTimings::fast(),
                ProxyType::Mcpo,
                shutdown.clone(),
            );
            tokio::spawn(supervisor.run());

            // One healthy start, then nothing but failures.
            prober.script("memory", ProbeResult::ok());
            prober.set_default(ProbeResult::failed(Some(503)));
            handle
                .reconcile(vec![ServerSpec::stdio("memory", "npx", vec![])])
                .await;
            assert_eq!(spawner.spawn_count("memory"), 1);

            let history = HealthHistory::new();
            let monitor = HealthMonitor::new(
                Arc::clone(&shared),
                prober.clone() as Arc<dyn HealthProber>,
                Arc::clone(&history),
                handle.clone(),
                Duration::from_millis(15),
                shutdown.clone(),
            );
            tokio::spawn(monitor.run());

            // Five failed sweeps trip the remediation threshold.
            tokio::time::sleep(Duration::from_millis(400)).await;

            assert!(spawner.spawn_count("memory") >= 2, "restart was requested");
            assert!(history.records("memory").len() >= 5);
            shutdown.cancel();
        }
    }
}
