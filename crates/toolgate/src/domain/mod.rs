use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport kind of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl ServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        }
    }

    /// Remote kinds proxy an upstream URL instead of spawning the tool itself.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Sse | Self::StreamableHttp)
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which bridge implementation translates MCP into an OpenAPI surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyType {
    Mcpo,
    McpBridge,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mcpo => "mcpo",
            Self::McpBridge => "mcp-bridge",
        }
    }

    /// The alternative tried when this type fails during startup.
    pub fn other(&self) -> Self {
        match self {
            Self::Mcpo => Self::McpBridge,
            Self::McpBridge => Self::Mcpo,
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mcpo" => Ok(Self::Mcpo),
            "mcp-bridge" => Ok(Self::McpBridge),
            other => Err(format!("invalid proxy type: {other}, must be mcpo/mcp-bridge")),
        }
    }
}

/// Auxiliary gateway transport in multi-transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Sse,
    Websocket,
    Streamable,
}

impl Transport {
    pub const ALL: [Transport; 3] = [Self::Sse, Self::Websocket, Self::Streamable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Websocket => "websocket",
            Self::Streamable => "streamable",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-server lifecycle state as driven by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Down,
    Starting,
    Healthy,
    Unhealthy,
    AuthRequired,
    Stopping,
    Failed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::AuthRequired => "auth_required",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Taxonomy for recorded server errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Auth,
    Connection,
    Resource,
    Dependency,
    Config,
    Runtime,
    Health,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Connection => "connection",
            Self::Resource => "resource",
            Self::Dependency => "dependency",
            Self::Config => "config",
            Self::Runtime => "runtime",
            Self::Health => "health",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a record of this type may be replaced by a record of `new`.
    ///
    /// `health`, `runtime` and `unknown` lose to anything; `auth` only to
    /// another `auth`; the remaining types lose to anything except the
    /// low-specificity three.
    pub fn overwritable_by(&self, new: ErrorType) -> bool {
        match self {
            Self::Health | Self::Runtime | Self::Unknown => true,
            Self::Auth => new == Self::Auth,
            Self::Connection | Self::Resource | Self::Dependency | Self::Config => {
                !matches!(new, Self::Health | Self::Runtime | Self::Unknown)
            }
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest recorded error for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub error_type: ErrorType,
    /// Unix timestamp (seconds).
    pub at: i64,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            message: message.into(),
            error_type,
            at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// Declarative, immutable description of one managed server.
///
/// Produced by the catalog loader, frozen for a reconcile cycle, replaced
/// wholesale on reload. `env` holds the merged launch environment for stdio
/// servers; the supervisor overlays decrypted secrets on top before handing
/// the spec to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub id: String,
    pub kind: ServerKind,

    // stdio
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub proxy_type_hint: Option<ProxyType>,

    // remote
    pub url: Option<String>,
    pub headers: HashMap<String, String>,

    pub needs_proxy: bool,
    /// Opaque passthrough forwarded to bridge config.
    pub always_allow: Vec<String>,
}

impl ServerSpec {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: ServerKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            cwd: None,
            env_file: None,
            proxy_type_hint: None,
            url: None,
            headers: HashMap::new(),
            needs_proxy: true,
            always_allow: Vec::new(),
        }
    }

    pub fn remote(id: impl Into<String>, kind: ServerKind, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            env_file: None,
            proxy_type_hint: None,
            url: Some(url.into()),
            headers: HashMap::new(),
            needs_proxy: true,
            always_allow: Vec::new(),
        }
    }

    /// The spec with decrypted secrets overlaid onto `env` (secrets win).
    pub fn with_secrets(&self, secrets: &HashMap<String, String>) -> Self {
        let mut spec = self.clone();
        for (k, v) in secrets {
            spec.env.insert(k.clone(), v.clone());
        }
        spec
    }
}

/// Coarse status bucket reported for each configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Failed,
    Skipped,
}

/// One row of the management `status` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub server_id: String,
    pub configured: bool,
    pub needs_proxy: bool,
    pub healthy: bool,
    pub auth_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_type_used: Option<ProxyType>,
    pub fallback_used: bool,
    /// Unix timestamp (seconds); absent when not running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub status: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

/// One healthy entry of the `openapi-endpoints` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenapiEndpoint {
    pub server_id: String,
    pub base_url: String,
    pub openapi_url: String,
    pub docs_url: String,
    pub proxy_type: ProxyType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serde_uses_kebab_case() {
        let kind: ServerKind = serde_json::from_str("\"streamable-http\"").unwrap();
        assert_eq!(kind, ServerKind::StreamableHttp);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"streamable-http\"");
    }

    #[test]
    fn proxy_type_round_trips_via_from_str() {
        assert_eq!("mcpo".parse::<ProxyType>().unwrap(), ProxyType::Mcpo);
        assert_eq!(
            "mcp-bridge".parse::<ProxyType>().unwrap(),
            ProxyType::McpBridge
        );
        assert!("supergateway".parse::<ProxyType>().is_err());
    }

    #[test]
    fn proxy_type_other_flips() {
        assert_eq!(ProxyType::Mcpo.other(), ProxyType::McpBridge);
        assert_eq!(ProxyType::McpBridge.other(), ProxyType::Mcpo);
    }

    #[test]
    fn remote_kinds() {
        assert!(ServerKind::Sse.is_remote());
        assert!(ServerKind::StreamableHttp.is_remote());
        assert!(!ServerKind::Stdio.is_remote());
    }

    #[test]
    fn auth_record_only_overwritable_by_auth() {
        assert!(ErrorType::Auth.overwritable_by(ErrorType::Auth));
        assert!(!ErrorType::Auth.overwritable_by(ErrorType::Config));
        assert!(!ErrorType::Auth.overwritable_by(ErrorType::Runtime));
    }

    #[test]
    fn low_specificity_records_always_overwritable() {
        for prev in [ErrorType::Health, ErrorType::Runtime, ErrorType::Unknown] {
            assert!(prev.overwritable_by(ErrorType::Auth));
            assert!(prev.overwritable_by(ErrorType::Runtime));
            assert!(prev.overwritable_by(ErrorType::Connection));
        }
    }

    #[test]
    fn specific_records_resist_runtime_and_health() {
        assert!(!ErrorType::Connection.overwritable_by(ErrorType::Runtime));
        assert!(!ErrorType::Dependency.overwritable_by(ErrorType::Health));
        assert!(ErrorType::Config.overwritable_by(ErrorType::Connection));
        assert!(ErrorType::Resource.overwritable_by(ErrorType::Auth));
    }

    #[test]
    fn with_secrets_overlays_and_wins() {
        let mut spec = ServerSpec::stdio("memory", "npx", vec!["-y".into()]);
        spec.env.insert("A".into(), "from-spec".into());
        let secrets = HashMap::from([
            ("A".to_string(), "from-secret".to_string()),
            ("B".to_string(), "extra".to_string()),
        ]);
        let effective = spec.with_secrets(&secrets);
        assert_eq!(effective.env["A"], "from-secret");
        assert_eq!(effective.env["B"], "extra");
        // Original untouched
        assert_eq!(spec.env["A"], "from-spec");
    }
}
