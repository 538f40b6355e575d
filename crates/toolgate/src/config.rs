use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;

use crate::domain::ProxyType;

fn xdg_config_home() -> PathBuf {
    env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
}

fn xdg_state_home() -> PathBuf {
    env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/state")
        })
}

fn xdg_runtime_dir() -> PathBuf {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("TMPDIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/tmp")
}

/// Supervision strategy selected at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// One bridge child per server (default).
    Individual,
    /// One multiplexing bridge child serving route-per-server.
    Unified,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Unified => "unified",
        }
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(Self::Individual),
            "unified" => Ok(Self::Unified),
            other => Err(format!("invalid mode: {other}, must be individual/unified")),
        }
    }
}

/// Auxiliary gateway transports enabled for multi-transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportToggles {
    pub sse: bool,
    pub websocket: bool,
    pub streamable: bool,
}

impl TransportToggles {
    pub fn any(&self) -> bool {
        self.sse || self.websocket || self.streamable
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: ProxyMode,
    pub default_proxy_type: ProxyType,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub config_path: PathBuf,
    pub manager_listen: SocketAddr,
    /// Preferred directory for persisted secret bundles and the master key.
    pub state_dir: PathBuf,
    /// Scratch space: bridge workdirs, tool caches, the unified catalog file.
    pub runtime_dir: PathBuf,
    pub transports: TransportToggles,
}

impl Default for Settings {
    fn default() -> Self {
        const DEFAULT_MANAGER_PORT: u16 = 8600;
        Self {
            mode: ProxyMode::Individual,
            default_proxy_type: ProxyType::Mcpo,
            port_range_start: 4200,
            port_range_end: 4299,
            config_path: xdg_config_home().join("toolgate/servers.json"),
            manager_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_MANAGER_PORT)),
            state_dir: xdg_state_home().join("toolgate"),
            runtime_dir: xdg_runtime_dir().join("toolgate"),
            transports: TransportToggles::default(),
        }
    }
}

impl Settings {
    /// Layering: defaults, then the TOML config file, then environment
    /// variables. Validation rejects a bad port range as boot-fatal.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        let file = ConfigFile::load();
        if let Some(ref v) = file.mode {
            cfg.mode = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid mode in config.toml")?;
        }
        if let Some(ref v) = file.proxy_type {
            cfg.default_proxy_type = v
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid proxy_type in config.toml")?;
        }
        if let Some(v) = file.port_range_start {
            cfg.port_range_start = v;
        }
        if let Some(v) = file.port_range_end {
            cfg.port_range_end = v;
        }
        if let Some(ref v) = file.config_path {
            cfg.config_path = expand_tilde(v);
        }
        if let Some(v) = file.manager_port {
            cfg.manager_listen.set_port(v);
        }
        if let Some(ref v) = file.state_dir {
            cfg.state_dir = expand_tilde(v);
        }
        if let Some(ref v) = file.runtime_dir {
            cfg.runtime_dir = expand_tilde(v);
        }
        if let Some(v) = file.enable_sse {
            cfg.transports.sse = v;
        }
        if let Some(v) = file.enable_ws {
            cfg.transports.websocket = v;
        }
        if let Some(v) = file.enable_streamable {
            cfg.transports.streamable = v;
        }

        if let Ok(raw) = env::var("MCP_PROXY_MODE") {
            cfg.mode = raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("invalid MCP_PROXY_MODE: {raw}"))?;
        }
        if let Ok(raw) = env::var("MCP_PROXY_TYPE") {
            cfg.default_proxy_type = raw
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("invalid MCP_PROXY_TYPE: {raw}"))?;
        }
        if let Ok(raw) = env::var("PORT_RANGE_START") {
            cfg.port_range_start = raw
                .parse()
                .with_context(|| format!("invalid PORT_RANGE_START: {raw}"))?;
        }
        if let Ok(raw) = env::var("PORT_RANGE_END") {
            cfg.port_range_end = raw
                .parse()
                .with_context(|| format!("invalid PORT_RANGE_END: {raw}"))?;
        }
        if let Ok(path) = env::var("CLAUDE_CONFIG_PATH") {
            cfg.config_path = PathBuf::from(path);
        }
        if let Ok(raw) = env::var("MANAGER_PORT") {
            let port: u16 = raw
                .parse()
                .with_context(|| format!("invalid MANAGER_PORT: {raw}"))?;
            cfg.manager_listen.set_port(port);
        }
        if let Ok(path) = env::var("TOOLGATE_STATE_DIR") {
            cfg.state_dir = PathBuf::from(path);
        }
        if let Ok(path) = env::var("TOOLGATE_RUNTIME_DIR") {
            cfg.runtime_dir = PathBuf::from(path);
        }
        if let Ok(raw) = env::var("MCP_ENABLE_SSE") {
            cfg.transports.sse =
                parse_bool(&raw).with_context(|| format!("invalid MCP_ENABLE_SSE: {raw}"))?;
        }
        if let Ok(raw) = env::var("MCP_ENABLE_WS") {
            cfg.transports.websocket =
                parse_bool(&raw).with_context(|| format!("invalid MCP_ENABLE_WS: {raw}"))?;
        }
        if let Ok(raw) = env::var("MCP_ENABLE_STREAMABLE") {
            cfg.transports.streamable = parse_bool(&raw)
                .with_context(|| format!("invalid MCP_ENABLE_STREAMABLE: {raw}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range_start < 1024 {
            anyhow::bail!(
                "port range start {} below 1024 (privileged range)",
                self.port_range_start
            );
        }
        if self.port_range_start >= self.port_range_end {
            anyhow::bail!(
                "port range start {} must be below end {}",
                self.port_range_start,
                self.port_range_end
            );
        }
        Ok(())
    }

    /// Directory holding `<serverId>.env.json` secret bundles.
    pub fn env_dir(&self) -> PathBuf {
        self.state_dir.join("env")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.state_dir.join("secret.key")
    }
}

fn parse_bool(input: &str) -> anyhow::Result<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("expected boolean"),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    mode: Option<String>,
    proxy_type: Option<String>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
    config_path: Option<String>,
    manager_port: Option<u16>,
    state_dir: Option<String>,
    runtime_dir: Option<String>,
    enable_sse: Option<bool>,
    enable_ws: Option<bool>,
    enable_streamable: Option<bool>,
}

impl ConfigFile {
    fn load() -> Self {
        let path = xdg_config_home().join("toolgate/config.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                Self::default()
            }
        }
    }
}
