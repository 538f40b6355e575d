mod crypto;

pub use crypto::{write_restricted, EncryptedBlob, SecretCipher};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Settings;

const BUNDLE_VERSION: u32 = 1;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Persisted per-server secret document (`<env-dir>/<serverId>.env.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretBundle {
    pub server_id: String,
    /// Unix timestamp (seconds).
    pub last_updated: i64,
    pub variables: HashMap<String, EncryptedBlob>,
    pub metadata: BundleMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub key_count: usize,
    pub version: u32,
}

impl SecretBundle {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            last_updated: time::OffsetDateTime::now_utc().unix_timestamp(),
            variables: HashMap::new(),
            metadata: BundleMetadata {
                key_count: 0,
                version: BUNDLE_VERSION,
            },
        }
    }

    fn touch(&mut self) {
        self.last_updated = time::OffsetDateTime::now_utc().unix_timestamp();
        self.metadata.key_count = self.variables.len();
        self.metadata.version = BUNDLE_VERSION;
    }
}

/// Masked view of one stored key; never carries plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSummaryEntry {
    pub name: String,
    pub masked: String,
    pub inferred_type: String,
    pub required: bool,
}

/// Where bundles live. Tried in order at open: the persistent state
/// directory, a tmpfs fallback, then memory only.
enum Storage {
    Dir(PathBuf),
    Memory(Mutex<HashMap<String, SecretBundle>>),
}

pub struct SecretStore {
    cipher: SecretCipher,
    storage: Storage,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

struct CacheEntry {
    at: Instant,
    values: HashMap<String, String>,
}

impl SecretStore {
    /// Open against the configured state dir, falling back per §storage.
    pub fn open(settings: &Settings) -> Self {
        let env_dir = settings.env_dir();
        if let Ok(dir) = prepare_dir(&env_dir) {
            match SecretCipher::load_or_generate(&settings.master_key_path()) {
                Ok(cipher) => return Self::with_dir(cipher, dir),
                Err(err) => {
                    warn!(error = %err, "cannot persist master key, falling back");
                }
            }
        } else {
            warn!(dir = %env_dir.display(), "secret dir not writable, trying tmpfs fallback");
        }

        let tmp_dir = std::env::temp_dir().join("toolgate-env");
        if let Ok(dir) = prepare_dir(&tmp_dir) {
            warn!(
                dir = %dir.display(),
                "storing secrets in ephemeral tmpfs; they will not survive a reboot"
            );
            let key_path = dir.join("secret.key");
            if let Ok(cipher) = SecretCipher::load_or_generate(&key_path) {
                return Self::with_dir(cipher, dir);
            }
        }

        warn!("no writable secret storage available; secrets are memory-only and lost on restart");
        Self::memory_only()
    }

    pub fn with_dir(cipher: SecretCipher, dir: PathBuf) -> Self {
        Self {
            cipher,
            storage: Storage::Dir(dir),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    pub fn memory_only() -> Self {
        Self {
            cipher: SecretCipher::ephemeral(),
            storage: Storage::Memory(Mutex::new(HashMap::new())),
            cache: Mutex::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Decrypted variables for one server. Per-key decryption failures are
    /// logged and skipped; remaining keys are still returned.
    pub fn load(&self, server_id: &str) -> HashMap<String, String> {
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(server_id) {
                if entry.at.elapsed() < self.cache_ttl {
                    return entry.values.clone();
                }
            }
        }

        let Some(bundle) = self.read_bundle(server_id) else {
            return HashMap::new();
        };

        let mut values = HashMap::new();
        for (name, blob) in &bundle.variables {
            match self.cipher.decrypt(blob) {
                Ok(plain) => {
                    values.insert(name.clone(), plain);
                }
                Err(err) => {
                    warn!(server_id, key = %name, error = %err, "skipping undecryptable secret");
                }
            }
        }

        self.cache.lock().insert(
            server_id.to_string(),
            CacheEntry {
                at: Instant::now(),
                values: values.clone(),
            },
        );
        values
    }

    /// Replace the whole bundle for `server_id` with `vars`.
    pub fn save(&self, server_id: &str, vars: &HashMap<String, String>) -> anyhow::Result<()> {
        let mut bundle = SecretBundle::new(server_id);
        for (name, value) in vars {
            bundle
                .variables
                .insert(name.clone(), self.cipher.encrypt(value)?);
        }
        bundle.touch();
        self.write_bundle(&bundle)?;
        self.invalidate(server_id);
        Ok(())
    }

    /// Insert or replace a single key without re-encrypting the others.
    pub fn set(&self, server_id: &str, key: &str, value: &str) -> anyhow::Result<()> {
        let mut bundle = self
            .read_bundle(server_id)
            .unwrap_or_else(|| SecretBundle::new(server_id));
        bundle
            .variables
            .insert(key.to_string(), self.cipher.encrypt(value)?);
        bundle.touch();
        self.write_bundle(&bundle)?;
        self.invalidate(server_id);
        Ok(())
    }

    /// Remove a single key. Returns whether the key existed.
    pub fn unset(&self, server_id: &str, key: &str) -> anyhow::Result<bool> {
        let Some(mut bundle) = self.read_bundle(server_id) else {
            return Ok(false);
        };
        let existed = bundle.variables.remove(key).is_some();
        if existed {
            bundle.touch();
            self.write_bundle(&bundle)?;
            self.invalidate(server_id);
        }
        Ok(existed)
    }

    pub fn delete(&self, server_id: &str) -> anyhow::Result<()> {
        match &self.storage {
            Storage::Dir(dir) => {
                let path = bundle_path(dir, server_id);
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed removing {}", path.display()))?;
                }
            }
            Storage::Memory(map) => {
                map.lock().remove(server_id);
            }
        }
        self.invalidate(server_id);
        Ok(())
    }

    /// Masked key listing; identical across storage modes, never plaintext.
    pub fn summary(&self, server_id: &str) -> Vec<SecretSummaryEntry> {
        let Some(bundle) = self.read_bundle(server_id) else {
            return Vec::new();
        };
        let mut entries: Vec<SecretSummaryEntry> = bundle
            .variables
            .keys()
            .map(|name| SecretSummaryEntry {
                name: name.clone(),
                masked: "********".to_string(),
                inferred_type: infer_type(name).to_string(),
                required: is_required(name),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    fn invalidate(&self, server_id: &str) {
        self.cache.lock().remove(server_id);
    }

    fn read_bundle(&self, server_id: &str) -> Option<SecretBundle> {
        match &self.storage {
            Storage::Dir(dir) => {
                let path = bundle_path(dir, server_id);
                let raw = fs::read(&path).ok()?;
                match serde_json::from_slice(&raw) {
                    Ok(bundle) => Some(bundle),
                    Err(err) => {
                        warn!(server_id, error = %err, "unreadable secret bundle");
                        None
                    }
                }
            }
            Storage::Memory(map) => map.lock().get(server_id).cloned(),
        }
    }

    /// Writes go through a 0600 temp file renamed atomically into place so
    /// readers never observe a partial bundle.
    fn write_bundle(&self, bundle: &SecretBundle) -> anyhow::Result<()> {
        match &self.storage {
            Storage::Dir(dir) => {
                let path = bundle_path(dir, &bundle.server_id);
                let tmp = path.with_extension("json.tmp");
                let raw = serde_json::to_vec_pretty(bundle)?;
                crypto::write_restricted(&tmp, &raw)
                    .with_context(|| format!("failed writing {}", tmp.display()))?;
                fs::rename(&tmp, &path).with_context(|| {
                    format!("failed renaming {} into place", tmp.display())
                })?;
                debug!(server_id = %bundle.server_id, keys = bundle.metadata.key_count, "saved secret bundle");
                Ok(())
            }
            Storage::Memory(map) => {
                map.lock()
                    .insert(bundle.server_id.clone(), bundle.clone());
                Ok(())
            }
        }
    }
}

fn bundle_path(dir: &Path, server_id: &str) -> PathBuf {
    dir.join(format!("{server_id}.env.json"))
}

/// Create the directory at mode 0700 and verify it is writable.
fn prepare_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to chmod {}", dir.display()))?;
    let probe = dir.join(".write-probe");
    fs::write(&probe, b"ok").with_context(|| format!("{} not writable", dir.display()))?;
    let _ = fs::remove_file(&probe);
    Ok(dir.to_path_buf())
}

fn infer_type(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.contains("api_key") || lower.contains("apikey") {
        "api_key"
    } else if lower.contains("token") {
        "token"
    } else if lower.contains("password") || lower.contains("passwd") {
        "password"
    } else if lower.contains("secret") {
        "secret"
    } else if lower.contains("url") || lower.contains("uri") || lower.contains("endpoint") {
        "url"
    } else {
        "string"
    }
}

fn is_required(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.ends_with("_API_KEY")
        || upper.ends_with("_TOKEN")
        || upper.ends_with("_SECRET")
        || upper.ends_with("_PASSWORD")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SecretStore) {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = prepare_dir(&dir.path().join("env")).unwrap();
        let cipher = SecretCipher::load_or_generate(&dir.path().join("secret.key")).unwrap();
        (dir, SecretStore::with_dir(cipher, env_dir))
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn save_load_round_trip() {
        let (_tmp, store) = store();
        let v = vars(&[("GITHUB_TOKEN", "ghp_abc"), ("MODE", "fast")]);
        store.save("gh", &v).unwrap();
        assert_eq!(store.load("gh"), v);
    }

    #[test]
    fn load_missing_bundle_is_empty() {
        let (_tmp, store) = store();
        assert!(store.load("nope").is_empty());
    }

    #[test]
    fn bundle_file_is_restricted() {
        use std::os::unix::fs::PermissionsExt;
        let (tmp, store) = store();
        store.save("gh", &vars(&[("A", "1")])).unwrap();
        let path = tmp.path().join("env/gh.env.json");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = fs::metadata(tmp.path().join("env"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn stale_temp_file_does_not_shadow_bundle() {
        // Simulates a crash after the temp write but before the rename:
        // the persisted bundle equals the last fully-completed save.
        let (tmp, store) = store();
        store.save("gh", &vars(&[("A", "committed")])).unwrap();
        fs::write(tmp.path().join("env/gh.env.json.tmp"), b"{garbage").unwrap();
        let loaded = store.load("gh");
        assert_eq!(loaded["A"], "committed");
    }

    #[test]
    fn corrupt_key_is_skipped_not_fatal() {
        let (tmp, store) = store();
        store
            .save("gh", &vars(&[("GOOD", "ok"), ("BAD", "broken")]))
            .unwrap();

        // Tamper with one ciphertext on disk.
        let path = tmp.path().join("env/gh.env.json");
        let mut bundle: SecretBundle =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        bundle.variables.get_mut("BAD").unwrap().ciphertext = "AAAA".to_string();
        fs::write(&path, serde_json::to_vec(&bundle).unwrap()).unwrap();

        let loaded = store.load("gh");
        assert_eq!(loaded.get("GOOD").map(String::as_str), Some("ok"));
        assert!(!loaded.contains_key("BAD"));
    }

    #[test]
    fn set_unset_delete() {
        let (_tmp, store) = store();
        store.set("s", "BRAVE_API_KEY", "k1").unwrap();
        store.set("s", "REGION", "eu").unwrap();
        assert_eq!(store.load("s").len(), 2);

        assert!(store.unset("s", "REGION").unwrap());
        assert!(!store.unset("s", "REGION").unwrap());
        assert_eq!(store.load("s").len(), 1);

        store.delete("s").unwrap();
        assert!(store.load("s").is_empty());
        assert!(store.summary("s").is_empty());
    }

    #[test]
    fn set_preserves_other_keys() {
        let (_tmp, store) = store();
        store.save("s", &vars(&[("A", "1"), ("B", "2")])).unwrap();
        store.set("s", "A", "updated").unwrap();
        let loaded = store.load("s");
        assert_eq!(loaded["A"], "updated");
        assert_eq!(loaded["B"], "2");
    }

    #[test]
    fn cache_returns_stale_until_invalidated() {
        let (_tmp, store) = store();
        let store = store.with_cache_ttl(Duration::from_secs(300));
        store.save("s", &vars(&[("A", "1")])).unwrap();
        assert_eq!(store.load("s")["A"], "1");
        // Save invalidates, so the new value is visible immediately.
        store.save("s", &vars(&[("A", "2")])).unwrap();
        assert_eq!(store.load("s")["A"], "2");
    }

    #[test]
    fn summary_masks_and_classifies() {
        let (_tmp, store) = store();
        store
            .save(
                "s",
                &vars(&[
                    ("BRAVE_API_KEY", "secret-value"),
                    ("DB_PASSWORD", "pw"),
                    ("BASE_URL", "http://x"),
                    ("REGION", "eu"),
                ]),
            )
            .unwrap();
        let summary = store.summary("s");
        assert_eq!(summary.len(), 4);
        for entry in &summary {
            assert_eq!(entry.masked, "********");
            assert!(!entry.masked.contains("secret-value"));
        }
        let by_name: HashMap<&str, &SecretSummaryEntry> =
            summary.iter().map(|e| (e.name.as_str(), e)).collect();
        assert_eq!(by_name["BRAVE_API_KEY"].inferred_type, "api_key");
        assert!(by_name["BRAVE_API_KEY"].required);
        assert_eq!(by_name["DB_PASSWORD"].inferred_type, "password");
        assert!(by_name["DB_PASSWORD"].required);
        assert_eq!(by_name["BASE_URL"].inferred_type, "url");
        assert!(!by_name["BASE_URL"].required);
        assert_eq!(by_name["REGION"].inferred_type, "string");
        assert!(!by_name["REGION"].required);
    }

    #[test]
    fn memory_mode_behaves_like_dir_mode() {
        let store = SecretStore::memory_only();
        let v = vars(&[("NOTION_TOKEN", "tok")]);
        store.save("n", &v).unwrap();
        assert_eq!(store.load("n"), v);
        let summary = store.summary("n");
        assert_eq!(summary[0].inferred_type, "token");
        store.delete("n").unwrap();
        assert!(store.load("n").is_empty());
    }
}
