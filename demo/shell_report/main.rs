//! # Shell Report
//!
//! **Actor**: Operator collecting a quick snapshot from a running pod
//!
//! Demonstrates:
//! - Loading the session config from `~/.podsh/config.toml` (or `PODSH_CONFIG`)
//! - Opening one exec session and reusing it for several commands
//! - Separated stdout/stderr per command
//! - Closing the session even when a command fails

use std::path::PathBuf;

use anyhow::{Context, Result};
use podsh_client::{Session, SessionConfig, WebSocketUpgrader};
use tracing::info;

const COMMANDS: &[&str] = &["echo hello from $(hostname)", "ls /"];

fn sep(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {title}");
    println!("{}\n", "=".repeat(60));
}

fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("PODSH_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    SessionConfig::default_location().context("cannot determine home directory for config")
}

async fn report(session: &Session) -> Result<()> {
    for command in COMMANDS {
        sep(command);
        let out = session
            .run(command)
            .await
            .with_context(|| format!("command failed: {command}"))?;
        println!("STDOUT:\n{}", out.stdout_lossy());
        println!("STDERR:\n{}", out.stderr_lossy());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var_os("PODSH_VERBOSE").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter("shell_report=debug,podsh_client=debug,podsh_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("shell_report=info,podsh_client=warn")
            .with_target(false)
            .init();
    }

    let path = config_path()?;
    let config = SessionConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    info!(
        "connecting to {}/{} via {}",
        config.target.namespace, config.target.pod, config.api_server
    );
    let session = Session::open(&WebSocketUpgrader::new(), &config)
        .await
        .context("failed to open exec session")?;

    let result = report(&session).await;
    session.close().await.context("failed to close session")?;

    if let Some(status) = session.exit_status() {
        info!("remote shell exited: {status}");
    }
    result
}
