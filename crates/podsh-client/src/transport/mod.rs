//! Protocol upgrade for podsh.
//!
//! An [`Upgrader`] turns a [`SessionConfig`] into an upgraded exec
//! connection. The WebSocket implementation talks to a cluster API server;
//! tests plug in the in-memory transport from `podsh_core`.

pub mod websocket;

pub use websocket::WebSocketUpgrader;

use podsh_core::error::PodshResult;
use podsh_core::transport::{BoxFuture, ExecChannel};

use crate::config::SessionConfig;

/// Establishes the exec connection a session runs on.
pub trait Upgrader: Send + Sync {
    /// Perform the exec upgrade for `config.target`.
    ///
    /// Resolves only once the remote side has confirmed the upgrade.
    fn upgrade<'a>(&'a self, config: &'a SessionConfig) -> BoxFuture<'a, PodshResult<ExecChannel>>;
}
