//! podsh-client: a persistent shell inside a cluster workload.
//!
//! Opens one exec WebSocket to a pod, keeps the shell running, and turns the
//! multiplexed stdout/stderr byte streams back into per-command results.
//!
//! # Quick Start
//!
//! ```no_run
//! use podsh_client::{Session, SessionConfig, WebSocketUpgrader};
//!
//! # async fn example() -> podsh_core::PodshResult<()> {
//! let config = SessionConfig::for_pod("default", "sys-report-daily");
//! let session = Session::open(&WebSocketUpgrader::new(), &config).await?;
//!
//! let out = session.run("echo hello from $(hostname)").await?;
//! println!("{}", out.stdout_lossy());
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod command;
pub mod config;
mod reader;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use command::CommandOutput;
pub use config::{ExecTarget, SessionConfig};
pub use session::{Session, SessionState};
pub use transport::{Upgrader, WebSocketUpgrader};

// Re-export podsh-core types for convenience.
pub use podsh_core::{ExitStatus, PodshError, PodshResult};
