use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{PollWatcher, RecursiveMode, Watcher};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::{ProxyType, ServerKind, ServerSpec};
use crate::launcher;

/// File poll interval. Polling (not inotify) is deliberate: the catalog may
/// live on a mount that does not deliver filesystem events.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid catalog JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Identifies one on-disk catalog revision; used to short-circuit reloads
/// when nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDigest {
    pub mtime_unix: i64,
    pub sha256: String,
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.sha256[..12.min(self.sha256.len())], self.mtime_unix)
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    /// Deterministic: sorted by server id.
    pub servers: Vec<ServerSpec>,
    pub digest: ConfigDigest,
}

/// Load and parse the catalog document.
///
/// Entries that match no transport rule are skipped with a warning, never an
/// error. Duplicate ids are a parse error (the previous desired set stays in
/// effect at the caller).
pub fn load(path: &Path) -> Result<Catalog, CatalogError> {
    let raw = std::fs::read(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mtime_unix = std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let digest = ConfigDigest {
        mtime_unix,
        sha256: hex(&Sha256::digest(&raw)),
    };

    let doc: ConfigDoc = serde_json::from_slice(&raw)?;
    let mut servers = Vec::new();
    for (id, spec) in doc.mcp_servers {
        match build_spec(&id, spec) {
            Some(server) => servers.push(server),
            None => warn!(server_id = %id, "skipping catalog entry with no usable transport"),
        }
    }
    servers.sort_by(|a, b| a.id.cmp(&b.id));

    for spec in &servers {
        lint_spec(spec);
    }

    info!(servers = servers.len(), digest = %digest, "catalog loaded");
    Ok(Catalog { servers, digest })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Kind inference per the catalog contract: explicit remote transports win,
/// then a bare `command` means stdio, anything else is unusable.
fn build_spec(id: &str, raw: RawSpec) -> Option<ServerSpec> {
    let has_url = raw.url.as_deref().is_some_and(|u| !u.is_empty());
    match raw.transport.as_deref() {
        Some("sse") if has_url => {
            let mut spec = ServerSpec::remote(id, ServerKind::Sse, raw.url.unwrap());
            spec.headers = raw.headers;
            spec.env = raw.env;
            spec.always_allow = raw.always_allow;
            // SSE is always proxied for OpenAPI compatibility.
            spec.needs_proxy = true;
            Some(spec)
        }
        Some("streamable-http") if has_url => {
            let mut spec = ServerSpec::remote(id, ServerKind::StreamableHttp, raw.url.unwrap());
            spec.headers = raw.headers;
            spec.env = raw.env;
            spec.always_allow = raw.always_allow;
            spec.needs_proxy = true;
            Some(spec)
        }
        _ => {
            let command = raw.command?;
            let mut spec = ServerSpec::stdio(id, command, raw.args);
            spec.env_file = raw.env_file.map(PathBuf::from);
            spec.env = merge_env_file(id, spec.env_file.as_deref(), raw.env);
            spec.cwd = raw.cwd.map(PathBuf::from);
            spec.needs_proxy = raw.needs_proxy.unwrap_or(true);
            spec.always_allow = raw.always_allow;
            spec.proxy_type_hint = match raw.proxy_type.as_deref() {
                None => None,
                Some(value) => match value.parse::<ProxyType>() {
                    Ok(pt) => Some(pt),
                    Err(err) => {
                        warn!(server_id = %id, %err, "ignoring invalid proxyType");
                        None
                    }
                },
            };
            Some(spec)
        }
    }
}

/// `KEY=VALUE` lines from the spec's env file, with the spec's inline `env`
/// winning on conflicts.
fn merge_env_file(
    id: &str,
    env_file: Option<&Path>,
    inline: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = HashMap::new();
    if let Some(path) = env_file {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        merged.insert(key.trim().to_string(), value.trim().to_string());
                    }
                }
            }
            Err(err) => {
                warn!(server_id = %id, path = %path.display(), %err, "cannot read envFile");
            }
        }
    }
    merged.extend(inline);
    merged
}

/// Informational-only validation: warn, never reject.
fn lint_spec(spec: &ServerSpec) {
    if !spec
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        warn!(server_id = %spec.id, "server id contains unusual characters");
    }
    if let Some(command) = &spec.command {
        if !launcher::is_whitelisted_command(command) {
            warn!(
                server_id = %spec.id,
                %command,
                "command is not on the launch whitelist; start will be refused"
            );
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDoc {
    #[serde(rename = "mcpServers", default, deserialize_with = "ordered_unique_map")]
    mcp_servers: Vec<(String, RawSpec)>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSpec {
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    env_file: Option<String>,
    cwd: Option<String>,
    transport: Option<String>,
    url: Option<String>,
    headers: HashMap<String, String>,
    needs_proxy: Option<bool>,
    proxy_type: Option<String>,
    always_allow: Vec<String>,
}

/// Deserializes the `mcpServers` map preserving entry order and rejecting
/// duplicate ids (a plain `HashMap` would silently keep the last one).
fn ordered_unique_map<'de, D>(deserializer: D) -> Result<Vec<(String, RawSpec)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct MapVisitor;

    impl<'de> Visitor<'de> for MapVisitor {
        type Value = Vec<(String, RawSpec)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of server id to spec")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries: Vec<(String, RawSpec)> = Vec::new();
            while let Some((key, value)) = access.next_entry::<String, RawSpec>()? {
                if entries.iter().any(|(existing, _)| *existing == key) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate server id: {key}"
                    )));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(MapVisitor)
}

/// Poll-based watcher on the catalog's parent directory; any event in the
/// directory nudges the reload loop, which uses the digest to drop no-ops.
pub fn build_watcher(
    config_path: &Path,
    tx: mpsc::UnboundedSender<()>,
) -> anyhow::Result<PollWatcher> {
    let watch_root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let notify_config = notify::Config::default()
        .with_poll_interval(POLL_INTERVAL)
        .with_compare_contents(true);
    let mut watcher = PollWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                    let _ = tx.send(());
                }
            }
        },
        notify_config,
    )?;
    watcher.watch(&watch_root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
