use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::domain::ServerKind;

/// Endpoints tried in order; the first 200 wins.
pub const PROBE_ENDPOINTS: [&str; 3] = ["/openapi.json", "/docs", "/"];

pub const STDIO_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const REMOTE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub auth_error: bool,
    pub response_time_ms: u64,
    /// Endpoint that answered 200, or the last one tried.
    pub endpoint: String,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn ok() -> Self {
        Self {
            healthy: true,
            status_code: Some(200),
            auth_error: false,
            response_time_ms: 5,
            endpoint: "/openapi.json".to_string(),
            error: None,
        }
    }

    pub fn failed(status_code: Option<u16>) -> Self {
        Self {
            healthy: false,
            status_code,
            auth_error: false,
            response_time_ms: 5,
            endpoint: "/".to_string(),
            error: Some("probe failed".to_string()),
        }
    }

    pub fn auth_required() -> Self {
        Self {
            healthy: false,
            status_code: Some(401),
            auth_error: true,
            response_time_ms: 5,
            endpoint: "/openapi.json".to_string(),
            error: Some("unauthorized".to_string()),
        }
    }
}

/// Seam between supervision and the network; tests script results per server.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, server_id: &str, port: u16, kind: ServerKind) -> ProbeResult;
}

/// Lower-level probe seam used by the unified and multi-transport managers,
/// which have their own endpoint ladders and liveness rules.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// HTTP GET; `Ok(status)` on any response, `Err` on transport failure.
    async fn get_status(&self, url: &str, timeout: Duration) -> Result<u16, String>;

    /// Bare TCP connect check (websocket gateways count this as alive).
    async fn tcp_connect(&self, port: u16, timeout: Duration) -> bool;
}

pub struct HttpEndpointProber {
    client: reqwest::Client,
}

impl Default for HttpEndpointProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpEndpointProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

#[async_trait]
impl EndpointProber for HttpEndpointProber {
    async fn get_status(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn tcp_connect(&self, port: u16, timeout: Duration) -> bool {
        let addr = format!("127.0.0.1:{port}");
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

/// Real prober: walks the endpoint ladder over loopback HTTP with
/// kind-dependent per-request timeouts.
pub struct HttpProber {
    client: reqwest::Client,
    stdio_timeout: Duration,
    remote_timeout: Duration,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client");
        Self {
            client,
            stdio_timeout: STDIO_PROBE_TIMEOUT,
            remote_timeout: REMOTE_PROBE_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeouts(stdio: Duration, remote: Duration) -> Self {
        let mut prober = Self::new();
        prober.stdio_timeout = stdio;
        prober.remote_timeout = remote;
        prober
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, _server_id: &str, port: u16, kind: ServerKind) -> ProbeResult {
        let timeout = if kind.is_remote() {
            self.remote_timeout
        } else {
            self.stdio_timeout
        };

        let started = Instant::now();
        let mut auth_error = false;
        let mut last_status: Option<u16> = None;
        let mut last_error: Option<String> = None;
        let mut last_endpoint = PROBE_ENDPOINTS[0].to_string();

        for endpoint in PROBE_ENDPOINTS {
            last_endpoint = endpoint.to_string();
            let url = format!("http://127.0.0.1:{port}{endpoint}");
            let attempt = Instant::now();
            match self.client.get(&url).timeout(timeout).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    last_status = Some(status);
                    if status == 200 {
                        return ProbeResult {
                            healthy: true,
                            status_code: Some(200),
                            auth_error: false,
                            response_time_ms: attempt.elapsed().as_millis() as u64,
                            endpoint: endpoint.to_string(),
                            error: None,
                        };
                    }
                    if status == 401 {
                        auth_error = true;
                    }
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                }
            }
        }

        ProbeResult {
            healthy: false,
            status_code: last_status,
            auth_error,
            response_time_ms: started.elapsed().as_millis() as u64,
            endpoint: last_endpoint,
            error: last_error.or_else(|| last_status.map(|s| format!("status {s}"))),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Scripted prober: per-server queues of results, falling back to a
    /// default once the queue drains.
    pub struct FakeProber {
        scripts: Mutex<HashMap<String, Vec<ProbeResult>>>,
        default: Mutex<ProbeResult>,
        pub probes: Mutex<Vec<String>>,
    }

    impl FakeProber {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(HashMap::new()),
                default: Mutex::new(ProbeResult::ok()),
                probes: Mutex::new(Vec::new()),
            })
        }

        pub fn script(&self, server_id: &str, result: ProbeResult) {
            self.scripts
                .lock()
                .entry(server_id.to_string())
                .or_default()
                .push(result);
        }

        pub fn set_default(&self, result: ProbeResult) {
            *self.default.lock() = result;
        }

        pub fn probe_count(&self, server_id: &str) -> usize {
            self.probes
                .lock()
                .iter()
                .filter(|id| id.as_str() == server_id)
                .count()
        }
    }

    #[async_trait]
    impl HealthProber for FakeProber {
        async fn probe(&self, server_id: &str, _port: u16, _kind: ServerKind) -> ProbeResult {
            self.probes.lock().push(server_id.to_string());
            let mut scripts = self.scripts.lock();
            if let Some(queue) = scripts.get_mut(server_id) {
                if !queue.is_empty() {
                    return queue.remove(0);
                }
            }
            self.default.lock().clone()
        }
    }

    /// Scripted endpoint prober: exact-URL statuses with a default, plus a
    /// switch for TCP connectivity.
    pub struct FakeEndpointProber {
        pub statuses: Mutex<HashMap<String, u16>>,
        pub default_status: Mutex<Result<u16, String>>,
        pub tcp_alive: Mutex<bool>,
    }

    impl FakeEndpointProber {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(HashMap::new()),
                default_status: Mutex::new(Ok(200)),
                tcp_alive: Mutex::new(true),
            })
        }

        pub fn set(&self, url: &str, status: u16) {
            self.statuses.lock().insert(url.to_string(), status);
        }

        pub fn set_default(&self, result: Result<u16, String>) {
            *self.default_status.lock() = result;
        }
    }

    #[async_trait]
    impl EndpointProber for FakeEndpointProber {
        async fn get_status(&self, url: &str, _timeout: Duration) -> Result<u16, String> {
            if let Some(status) = self.statuses.lock().get(url) {
                return Ok(*status);
            }
            self.default_status.lock().clone()
        }

        async fn tcp_connect(&self, _port: u16, _timeout: Duration) -> bool {
            *self.tcp_alive.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_reports_failure() {
        let prober =
            HttpProber::with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
        // Port 1 on loopback refuses connections.
        let result = prober.probe("x", 1, ServerKind::Stdio).await;
        assert!(!result.healthy);
        assert!(result.status_code.is_none());
        assert!(!result.auth_error);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn live_http_server_answers_first_endpoint() {
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/openapi.json", get(|| async { "{}" }))
            .route("/docs", get(|| async { "docs" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let prober = HttpProber::new();
        let result = prober.probe("x", port, ServerKind::Stdio).await;
        assert!(result.healthy);
        assert_eq!(result.endpoint, "/openapi.json");
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn unauthorized_sets_auth_flag() {
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/openapi.json",
                get(|| async { StatusCode::UNAUTHORIZED }),
            )
            .route("/docs", get(|| async { StatusCode::UNAUTHORIZED }))
            .route("/", get(|| async { StatusCode::UNAUTHORIZED }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let prober = HttpProber::new();
        let result = prober.probe("x", port, ServerKind::Sse).await;
        assert!(!result.healthy);
        assert!(result.auth_error);
        assert_eq!(result.status_code, Some(401));
    }

    #[tokio::test]
    async fn later_endpoint_can_win() {
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/openapi.json", get(|| async { StatusCode::NOT_FOUND }))
            .route("/docs", get(|| async { "docs" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let prober = HttpProber::new();
        let result = prober.probe("x", port, ServerKind::Stdio).await;
        assert!(result.healthy);
        assert_eq!(result.endpoint, "/docs");
    }
}
