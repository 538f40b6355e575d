use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::domain::{ProxyType, ServerKind, ServerSpec, Transport};

/// Server id the unified bridge child is tracked under in the port pool.
pub const UNIFIED_ID: &str = "unified";

/// Commands a stdio spec may name, matched on basename.
const COMMAND_WHITELIST: [&str; 9] = [
    "uvx", "python", "python3", "node", "npm", "npx", "uv", "pip", "pip3",
];

/// Shell metacharacters that must not appear in user-supplied arguments.
const FORBIDDEN_CHARS: [char; 12] = [
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '\\',
];

const MAX_ARG_LEN: usize = 1000;
const MAX_ARGS: usize = 50;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error("unsafe argument at index {index}: {reason}")]
    UnsafeArgument { index: usize, reason: String },
    #[error("too many arguments: {0} (max {MAX_ARGS})")]
    TooManyArguments(usize),
    #[error("{proxy_type} cannot serve {kind} servers")]
    Unsupported {
        proxy_type: ProxyType,
        kind: ServerKind,
    },
    #[error("spec for {0} has no launchable target")]
    IncompleteSpec(String),
    #[error("failed preparing bridge workdir: {0}")]
    Workdir(#[from] std::io::Error),
    #[error("failed serializing bridge config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything the supervisor needs to spawn one bridge child. Opaque to the
/// launcher's callers beyond these fields.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub server_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Generated directory (mcp-bridge config); deleted when the child stops.
    pub workdir: Option<PathBuf>,
    pub port: u16,
}

pub fn is_whitelisted_command(command: &str) -> bool {
    let basename = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);
    COMMAND_WHITELIST.contains(&basename)
}

/// Whether a proxy type can serve a server kind. mcp-bridge only speaks
/// stdio; mcpo handles everything.
pub fn supports(proxy_type: ProxyType, kind: ServerKind) -> bool {
    match proxy_type {
        ProxyType::Mcpo => true,
        ProxyType::McpBridge => kind == ServerKind::Stdio,
    }
}

/// Maps `(ServerSpec, port, proxy type)` to a launch plan.
///
/// The environment entering each child is composed explicitly at plan time:
/// captured base environment, then the spec's env (secrets already overlaid
/// by the supervisor), then bridge-required variables, later keys winning.
pub struct BridgeLauncher {
    base_env: HashMap<String, String>,
    runtime_dir: PathBuf,
}

impl BridgeLauncher {
    pub fn new(runtime_dir: PathBuf) -> Self {
        const PASSTHROUGH: [&str; 7] = ["PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TMPDIR"];
        let base_env = PASSTHROUGH
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
            .collect();
        Self {
            base_env,
            runtime_dir,
        }
    }

    #[cfg(test)]
    pub fn with_base_env(runtime_dir: PathBuf, base_env: HashMap<String, String>) -> Self {
        Self {
            base_env,
            runtime_dir,
        }
    }

    pub fn plan(
        &self,
        spec: &ServerSpec,
        port: u16,
        proxy_type: ProxyType,
    ) -> Result<LaunchPlan, LaunchError> {
        if !supports(proxy_type, spec.kind) {
            return Err(LaunchError::Unsupported {
                proxy_type,
                kind: spec.kind,
            });
        }

        match spec.kind {
            ServerKind::Stdio => {
                let command = spec
                    .command
                    .as_deref()
                    .ok_or_else(|| LaunchError::IncompleteSpec(spec.id.clone()))?;
                if !is_whitelisted_command(command) {
                    return Err(LaunchError::CommandNotAllowed(command.to_string()));
                }
                validate_args(&spec.args)?;
                match proxy_type {
                    ProxyType::Mcpo => Ok(self.mcpo_stdio_plan(spec, command, port)),
                    ProxyType::McpBridge => self.mcp_bridge_plan(spec, command, port),
                }
            }
            ServerKind::Sse | ServerKind::StreamableHttp => {
                let url = spec
                    .url
                    .as_deref()
                    .ok_or_else(|| LaunchError::IncompleteSpec(spec.id.clone()))?;
                Ok(self.mcpo_remote_plan(spec, url, port))
            }
        }
    }

    fn compose_env(&self, spec: &ServerSpec) -> HashMap<String, String> {
        let mut env = self.base_env.clone();
        env.extend(spec.env.clone());
        env.insert(
            "UV_CACHE_DIR".to_string(),
            self.runtime_dir.join("uv-cache").display().to_string(),
        );
        env.insert(
            "npm_config_cache".to_string(),
            self.runtime_dir.join("npm-cache").display().to_string(),
        );
        if spec.kind.is_remote() {
            // Long-lived event streams need generous client timeouts.
            env.insert("UV_HTTP_TIMEOUT".to_string(), "300".to_string());
            env.insert("HTTPX_CONNECT_TIMEOUT".to_string(), "30".to_string());
            env.insert("HTTPX_READ_TIMEOUT".to_string(), "300".to_string());
        }
        env
    }

    fn mcpo_stdio_plan(&self, spec: &ServerSpec, command: &str, port: u16) -> LaunchPlan {
        let mut args = vec![
            "mcpo".to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--".to_string(),
            command.to_string(),
        ];
        args.extend(spec.args.iter().cloned());
        LaunchPlan {
            server_id: spec.id.clone(),
            command: "uvx".to_string(),
            args,
            env: self.compose_env(spec),
            cwd: spec.cwd.clone(),
            workdir: None,
            port,
        }
    }

    fn mcpo_remote_plan(&self, spec: &ServerSpec, url: &str, port: u16) -> LaunchPlan {
        let server_type = match spec.kind {
            ServerKind::Sse => "sse",
            _ => "streamable-http",
        };
        let mut args = vec![
            "mcpo".to_string(),
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            port.to_string(),
            "--server-type".to_string(),
            server_type.to_string(),
        ];
        if !spec.headers.is_empty() {
            args.push("--header".to_string());
            args.push(json!(spec.headers).to_string());
        }
        args.push("--".to_string());
        args.push(url.to_string());
        LaunchPlan {
            server_id: spec.id.clone(),
            command: "uvx".to_string(),
            args,
            env: self.compose_env(spec),
            cwd: None,
            workdir: None,
            port,
        }
    }

    /// mcp-bridge reads everything from a generated config file in its
    /// working directory; the directory is unique per attempt and removed
    /// on stop.
    fn mcp_bridge_plan(
        &self,
        spec: &ServerSpec,
        command: &str,
        port: u16,
    ) -> Result<LaunchPlan, LaunchError> {
        let workdir = self
            .runtime_dir
            .join("bridges")
            .join(format!("{}-{}", spec.id, uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&workdir)?;

        let mut servers = serde_json::Map::new();
        servers.insert(
            spec.id.clone(),
            json!({
                "command": command,
                "args": spec.args,
                "env": spec.env,
                "alwaysAllow": spec.always_allow,
            }),
        );
        let config = json!({
            "inference_server": {
                "base_url": "http://localhost:11434/v1",
                "api_key": "unused"
            },
            "mcp_servers": servers,
            "network": {
                "host": "0.0.0.0",
                "port": port
            },
            "logging": {
                "log_level": "INFO"
            }
        });
        let config_path = workdir.join("config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;
        debug!(server_id = %spec.id, path = %config_path.display(), "wrote mcp-bridge config");

        Ok(LaunchPlan {
            server_id: spec.id.clone(),
            command: "uvx".to_string(),
            args: vec!["mcp-bridge".to_string()],
            env: self.compose_env(spec),
            cwd: Some(workdir.clone()),
            workdir: Some(workdir),
            port,
        })
    }
}

impl BridgeLauncher {
    /// Plan for the single multiplexing bridge in unified mode; the catalog
    /// file is generated by the unified manager beforehand.
    pub fn unified_plan(&self, port: u16, config_path: &Path) -> LaunchPlan {
        LaunchPlan {
            server_id: UNIFIED_ID.to_string(),
            command: "uvx".to_string(),
            args: vec![
                "mcpo".to_string(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--config".to_string(),
                config_path.display().to_string(),
            ],
            env: self.shared_env(),
            cwd: None,
            workdir: None,
            port,
        }
    }

    /// Plan for one per-server-per-transport supergateway child
    /// (multi-transport mode). Only stdio specs can be wrapped.
    pub fn gateway_plan(
        &self,
        spec: &ServerSpec,
        port: u16,
        transport: Transport,
    ) -> Result<LaunchPlan, LaunchError> {
        let command = spec
            .command
            .as_deref()
            .ok_or_else(|| LaunchError::IncompleteSpec(spec.id.clone()))?;
        if !is_whitelisted_command(command) {
            return Err(LaunchError::CommandNotAllowed(command.to_string()));
        }
        validate_args(&spec.args)?;

        let mut stdio_cmd = command.to_string();
        for arg in &spec.args {
            stdio_cmd.push(' ');
            stdio_cmd.push_str(arg);
        }

        let mut args = vec![
            "-y".to_string(),
            "supergateway".to_string(),
            "--stdio".to_string(),
            stdio_cmd,
            "--port".to_string(),
            port.to_string(),
        ];
        match transport {
            Transport::Sse => {
                args.push("--ssePath".to_string());
                args.push("/sse".to_string());
                args.push("--messagePath".to_string());
                args.push("/message".to_string());
            }
            Transport::Websocket => {
                args.push("--outputTransport".to_string());
                args.push("ws".to_string());
            }
            Transport::Streamable => {
                args.push("--outputTransport".to_string());
                args.push("streamableHttp".to_string());
            }
        }

        let mut env = self.shared_env();
        env.extend(spec.env.clone());
        Ok(LaunchPlan {
            server_id: format!("{}-{}", spec.id, transport),
            command: "npx".to_string(),
            args,
            env,
            cwd: spec.cwd.clone(),
            workdir: None,
            port,
        })
    }

    /// Base environment plus the pinned cache directories, for children that
    /// have no single server spec behind them.
    fn shared_env(&self) -> HashMap<String, String> {
        let mut env = self.base_env.clone();
        env.insert(
            "UV_CACHE_DIR".to_string(),
            self.runtime_dir.join("uv-cache").display().to_string(),
        );
        env.insert(
            "npm_config_cache".to_string(),
            self.runtime_dir.join("npm-cache").display().to_string(),
        );
        env
    }
}

fn validate_args(args: &[String]) -> Result<(), LaunchError> {
    if args.len() > MAX_ARGS {
        return Err(LaunchError::TooManyArguments(args.len()));
    }
    for (index, arg) in args.iter().enumerate() {
        if arg.len() > MAX_ARG_LEN {
            return Err(LaunchError::UnsafeArgument {
                index,
                reason: format!("length {} exceeds {MAX_ARG_LEN}", arg.len()),
            });
        }
        if arg.contains('\0') {
            return Err(LaunchError::UnsafeArgument {
                index,
                reason: "contains NUL byte".to_string(),
            });
        }
        if arg.starts_with("../") {
            return Err(LaunchError::UnsafeArgument {
                index,
                reason: "begins with ../".to_string(),
            });
        }
        if let Some(bad) = arg.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(LaunchError::UnsafeArgument {
                index,
                reason: format!("contains forbidden character {bad:?}"),
            });
        }
    }
    Ok(())
}
