use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{ErrorRecord, ErrorType};

/// One captured child output line on its way to the classifier.
#[derive(Debug, Clone)]
pub struct ChildLine {
    pub server_id: String,
    pub stream: &'static str,
    pub line: String,
}

/// Consumes the child-output channel and records classified errors.
/// Reader tasks feed this; nothing here ever touches the supervisor state.
pub async fn run_classifier(
    mut rx: mpsc::Receiver<ChildLine>,
    board: Arc<ErrorBoard>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => {
                let Some(entry) = next else { break };
                debug!(
                    server_id = %entry.server_id,
                    stream = entry.stream,
                    "{}",
                    entry.line
                );
                board.observe_line(&entry.server_id, &entry.line);
            }
        }
    }
}

const MAX_MESSAGE_LEN: usize = 500;

/// Startup/progress chatter that must never be treated as an error.
fn is_informational(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("INFO:")
        || trimmed.starts_with("INFO ")
        || trimmed.contains("Uvicorn running on")
        || trimmed.contains("Application startup complete")
        || trimmed.starts_with("Installed ")
        || trimmed.starts_with("Resolved ")
        || trimmed.starts_with("Prepared ")
        || trimmed.starts_with("Audited ")
        || trimmed.starts_with("Downloading ")
}

fn extraction_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"ERROR:\s*(.+)",
            r"Error:\s*(.+)",
            r"Exception:\s*(.+)",
            r"(Missing required.+)",
            r"(?i)([^\r\n]*\bAPI key\b[^\r\n]*)",
            r"(Please enter your .+)",
            r"(Child exited:.*)",
            r"(Failed to .+)",
            r"(Unable to .+)",
            r"(Cannot .+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("regex compile"))
        .collect()
    })
}

fn prefix_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Leading `[tag]` brackets and ISO-ish timestamps emitted by bridges.
    RE.get_or_init(|| {
        Regex::new(r"^(?:\[[^\]]*\]\s*|\d{4}-\d{2}-\d{2}[T ][\d:.,+Zz-]+\s*)+").expect("regex compile")
    })
}

const CRITICAL_KEYWORDS: [&str; 7] = [
    "killed",
    "crashed",
    "terminated",
    "refused",
    "timeout",
    "unauthorized",
    "forbidden",
];

/// Pull the most meaningful error message out of one line or buffered block.
/// Returns `None` for informational output or when nothing error-like fires.
pub fn extract_message(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_informational(l))
        .collect();
    if lines.is_empty() {
        return None;
    }

    for pattern in extraction_patterns() {
        for line in &lines {
            let cleaned = prefix_noise().replace(line, "");
            if let Some(caps) = pattern.captures(&cleaned) {
                if let Some(m) = caps.get(1) {
                    return Some(truncate(m.as_str().trim()));
                }
            }
        }
    }

    for line in &lines {
        let lower = line.to_ascii_lowercase();
        if CRITICAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return Some(truncate(line));
        }
    }

    None
}

/// Keyword families, evaluated in order; first family with a hit wins.
pub fn classify_message(message: &str) -> ErrorType {
    let lower = message.to_ascii_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|kw| lower.contains(kw));

    if hit(&["api key", "token", "password", "unauthorized", "forbidden", "401", "403"]) {
        ErrorType::Auth
    } else if hit(&["connection", "network", "refused", "timeout", "socket", "mcperror"]) {
        ErrorType::Connection
    } else if hit(&["memory", "killed", "137", "sigkill", "oom"]) {
        ErrorType::Resource
    } else if hit(&["package", "install", "module", "import"]) {
        ErrorType::Dependency
    } else if hit(&["missing", "required", "invalid"]) {
        ErrorType::Config
    } else {
        ErrorType::Runtime
    }
}

/// Extraction + classification in one step.
pub fn classify_block(block: &str) -> Option<(String, ErrorType)> {
    let message = extract_message(block)?;
    let error_type = classify_message(&message);
    Some((message, error_type))
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_MESSAGE_LEN {
        return s.to_string();
    }
    let mut end = MAX_MESSAGE_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Latest-error-per-server board. Both the stderr classifier and the
/// exit-code recorder write through [`ErrorBoard::record`], so the override
/// policy is applied atomically under one lock regardless of which path
/// observed the failure first.
#[derive(Default)]
pub struct ErrorBoard {
    inner: Mutex<HashMap<String, ErrorRecord>>,
}

impl ErrorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, honoring the specificity override policy.
    /// Returns whether the record was applied.
    pub fn record(&self, server_id: &str, message: impl Into<String>, error_type: ErrorType) -> bool {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.get(server_id) {
            if !existing.error_type.overwritable_by(error_type) {
                debug!(
                    server_id,
                    existing = %existing.error_type,
                    incoming = %error_type,
                    "keeping more specific error record"
                );
                return false;
            }
        }
        inner.insert(server_id.to_string(), ErrorRecord::new(message, error_type));
        true
    }

    /// Classify one child output line and record it if it is an error.
    pub fn observe_line(&self, server_id: &str, line: &str) {
        if let Some((message, error_type)) = classify_block(line) {
            self.record(server_id, message, error_type);
        }
    }

    /// Record an unexpected exit by code, per the exit-code taxonomy.
    pub fn record_exit(&self, server_id: &str, code: i32) {
        let (error_type, message) = match code {
            137 => (ErrorType::Resource, format!("process killed (exit {code}, likely OOM)")),
            126 => (ErrorType::Config, format!("command found but not executable (exit {code})")),
            127 => (ErrorType::Dependency, format!("command not found (exit {code})")),
            _ => (ErrorType::Runtime, format!("process exited with code {code}")),
        };
        self.record(server_id, message, error_type);
    }

    pub fn get(&self, server_id: &str) -> Option<ErrorRecord> {
        self.inner.lock().get(server_id).cloned()
    }

    pub fn clear(&self, server_id: &str) {
        self.inner.lock().remove(server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn informational_lines_are_ignored() {
        assert!(extract_message("INFO: Started server process [12]").is_none());
        assert!(extract_message("INFO:     Uvicorn running on http://0.0.0.0:4000").is_none());
        assert!(extract_message("Installed 12 packages in 340ms").is_none());
        assert!(extract_message("Downloading cpython-3.12.1 (32.1MiB)").is_none());
    }

    #[test]
    fn error_prefix_wins_over_later_patterns() {
        let block = "Failed to reticulate\nERROR: connection refused by upstream";
        let msg = extract_message(block).unwrap();
        assert_eq!(msg, "connection refused by upstream");
    }

    #[test]
    fn strips_log_prefix_noise() {
        let msg = extract_message("2024-05-01T10:00:00.123Z ERROR: boom").unwrap();
        assert_eq!(msg, "boom");
        let msg = extract_message("[mcpo] Error: no api key provided").unwrap();
        assert_eq!(msg, "no api key provided");
    }

    #[test]
    fn keyword_scan_is_the_fallback() {
        let msg = extract_message("upstream said: request timeout after 30s").unwrap();
        assert!(msg.contains("timeout"));
        assert!(extract_message("all quiet on this line").is_none());
    }

    #[test]
    fn missing_required_extracts() {
        let msg = extract_message("Missing required environment variable BRAVE_API_KEY").unwrap();
        assert!(msg.starts_with("Missing required"));
        assert_eq!(classify_message(&msg), ErrorType::Config);
    }

    #[test]
    fn spelled_out_api_key_is_auth() {
        let msg = extract_message("Error: no Brave API key configured").unwrap();
        assert_eq!(classify_message(&msg), ErrorType::Auth);
    }

    #[test]
    fn classification_families_in_order() {
        assert_eq!(classify_message("401 unauthorized"), ErrorType::Auth);
        assert_eq!(classify_message("connection refused"), ErrorType::Connection);
        assert_eq!(classify_message("process killed by oom"), ErrorType::Resource);
        assert_eq!(classify_message("no module named foo"), ErrorType::Dependency);
        assert_eq!(classify_message("invalid value for --port"), ErrorType::Config);
        assert_eq!(classify_message("something odd happened"), ErrorType::Runtime);
    }

    #[test]
    fn auth_family_outranks_connection() {
        // "token" appears before "timeout" in family order.
        assert_eq!(
            classify_message("token exchange hit a timeout"),
            ErrorType::Auth
        );
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = format!("ERROR: {}", "x".repeat(2000));
        let msg = extract_message(&long).unwrap();
        assert_eq!(msg.len(), MAX_MESSAGE_LEN);
    }

    #[test]
    fn board_applies_override_policy() {
        let board = ErrorBoard::new();
        assert!(board.record("s", "probe failed", ErrorType::Health));
        // Anything beats health.
        assert!(board.record("s", "connection refused", ErrorType::Connection));
        // Runtime does not clobber connection.
        assert!(!board.record("s", "exited 1", ErrorType::Runtime));
        assert_eq!(board.get("s").unwrap().error_type, ErrorType::Connection);
        // Auth beats connection.
        assert!(board.record("s", "401", ErrorType::Auth));
        // Only auth replaces auth.
        assert!(!board.record("s", "invalid config", ErrorType::Config));
        assert!(board.record("s", "bad token", ErrorType::Auth));
        assert_eq!(board.get("s").unwrap().message, "bad token");
    }

    #[test]
    fn exit_codes_map_to_taxonomy() {
        let board = ErrorBoard::new();
        board.record_exit("a", 137);
        assert_eq!(board.get("a").unwrap().error_type, ErrorType::Resource);
        board.record_exit("b", 126);
        assert_eq!(board.get("b").unwrap().error_type, ErrorType::Config);
        board.record_exit("c", 127);
        assert_eq!(board.get("c").unwrap().error_type, ErrorType::Dependency);
        board.record_exit("d", 3);
        assert_eq!(board.get("d").unwrap().error_type, ErrorType::Runtime);
    }

    #[test]
    fn exit_code_does_not_clobber_stderr_diagnosis() {
        let board = ErrorBoard::new();
        board.observe_line("s", "ERROR: Missing required config key");
        assert_eq!(board.get("s").unwrap().error_type, ErrorType::Config);
        board.record_exit("s", 1);
        // The runtime exit record loses to the specific config diagnosis.
        assert_eq!(board.get("s").unwrap().error_type, ErrorType::Config);
    }

    #[test]
    fn observe_line_end_to_end() {
        let board = ErrorBoard::new();
        board.observe_line("s", "INFO: starting");
        assert!(board.get("s").is_none());
        board.observe_line("s", "Error: Please enter your OpenAI API key");
        let rec = board.get("s").unwrap();
        assert_eq!(rec.error_type, ErrorType::Auth);
        board.clear("s");
        assert!(board.get("s").is_none());
    }
}
