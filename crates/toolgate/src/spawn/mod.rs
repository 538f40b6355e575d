use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

use crate::classify::ChildLine;
use crate::launcher::LaunchPlan;

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// SIGTERM/SIGINT or exit code 0 are expected shutdowns; everything else
    /// is recorded as an error.
    pub fn expected(&self) -> bool {
        if self.code == Some(0) {
            return true;
        }
        matches!(self.signal, Some(s) if s == libc::SIGTERM || s == libc::SIGINT)
    }
}

/// Minimal handle the supervisor holds for one spawned bridge.
pub trait ChildProc: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// `None` while still running.
    fn try_wait(&mut self) -> Option<ExitOutcome>;
    fn signal_term(&mut self);
    fn kill(&mut self);
}

/// Seam between the supervisor and the operating system; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, plan: &LaunchPlan) -> anyhow::Result<Box<dyn ChildProc>>;
}

/// Real spawner: `tokio::process` children in their own process group, with
/// two long-lived reader tasks feeding the classifier channel.
pub struct TokioSpawner {
    line_tx: mpsc::Sender<ChildLine>,
}

impl TokioSpawner {
    pub fn new(line_tx: mpsc::Sender<ChildLine>) -> Self {
        Self { line_tx }
    }
}

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, plan: &LaunchPlan) -> anyhow::Result<Box<dyn ChildProc>> {
        let mut cmd = Command::new(&plan.command);
        cmd.args(&plan.args);
        // The environment entering the child is exactly the plan's map,
        // captured as a value at plan time.
        cmd.env_clear();
        cmd.envs(&plan.env);
        if let Some(cwd) = &plan.cwd {
            cmd.current_dir(cwd);
        }
        // New process group (PGID = child PID) so stop can signal the whole
        // tree, including grandchildren spawned by package runners.
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(plan.server_id.clone(), "stdout", stdout, self.line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(plan.server_id.clone(), "stderr", stderr, self.line_tx.clone());
        }

        let pgid = child.id().map(|pid| pid as i32);
        Ok(Box::new(TokioChild { child, pgid }))
    }
}

fn spawn_reader<R>(
    server_id: String,
    stream: &'static str,
    reader: R,
    tx: mpsc::Sender<ChildLine>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let entry = ChildLine {
                server_id: server_id.clone(),
                stream,
                line,
            };
            if tx.send(entry).await.is_err() {
                break;
            }
        }
    });
}

struct TokioChild {
    child: tokio::process::Child,
    pgid: Option<i32>,
}

impl TokioChild {
    fn signal_group(&mut self, sig: i32) {
        let Some(pgid) = self.pgid else {
            return;
        };
        let ret = unsafe { libc::kill(-pgid, sig) };
        if ret != 0 {
            // Group may already be gone; fall back to a direct kill.
            if let Err(err) = self.child.start_kill() {
                warn!(pgid, error = %err, "direct kill after group signal failure failed");
            }
        }
    }
}

impl ChildProc for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Option<ExitOutcome> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                use std::os::unix::process::ExitStatusExt;
                Some(ExitOutcome {
                    code: status.code(),
                    signal: status.signal(),
                })
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to poll child status");
                None
            }
        }
    }

    fn signal_term(&mut self) {
        self.signal_group(libc::SIGTERM);
    }

    fn kill(&mut self) {
        self.signal_group(libc::SIGKILL);
    }
}
