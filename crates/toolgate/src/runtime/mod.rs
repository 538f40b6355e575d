use std::fs;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn ensure_runtime_paths(settings: &Settings) -> anyhow::Result<()> {
    fs::create_dir_all(&settings.runtime_dir).with_context(|| {
        format!(
            "failed to create runtime dir: {}",
            settings.runtime_dir.display()
        )
    })?;
    fs::create_dir_all(settings.runtime_dir.join("bridges"))
        .context("failed to create bridge workdir root")?;
    // The state dir may be unwritable; the secret store falls back on its
    // own, so this one is best-effort.
    if let Err(err) = fs::create_dir_all(&settings.state_dir) {
        tracing::warn!(
            dir = %settings.state_dir.display(),
            %err,
            "state dir not writable"
        );
    }
    Ok(())
}

pub async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
        _ = sigint.recv() => { tracing::info!("received SIGINT, shutting down"); }
    }
}
