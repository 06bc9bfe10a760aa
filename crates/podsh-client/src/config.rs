//! Session configuration, optionally loaded from `~/.podsh/config.toml`.
//!
//! Everything a session needs is carried in one [`SessionConfig`] value that
//! the caller passes to [`Session::open`](crate::Session::open).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use podsh_core::error::{PodshError, PodshResult};

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Workload the shell runs in.
    #[serde(default)]
    pub target: ExecTarget,

    /// Base URL of the cluster API server.
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Bearer token sent with the upgrade request.
    #[serde(default)]
    pub token: Option<String>,

    /// Default per-command timeout in milliseconds (none = wait forever).
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,

    /// How often a waiting command re-checks the session even without
    /// new output.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on the protocol upgrade.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: ExecTarget::default(),
            api_server: default_api_server(),
            token: None,
            command_timeout_ms: None,
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// The pod, container and shell an exec connection is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecTarget {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub pod: String,

    /// Container name; the pod's default container when unset.
    #[serde(default)]
    pub container: Option<String>,

    /// Shell command line started at upgrade time.
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,
}

impl Default for ExecTarget {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            pod: String::new(),
            container: None,
            shell: default_shell(),
        }
    }
}

impl ExecTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            ..Default::default()
        }
    }
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_shell() -> Vec<String> {
    vec!["/bin/sh".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl SessionConfig {
    /// Build a config for the given pod with all other settings defaulted.
    pub fn for_pod(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            target: ExecTarget::new(namespace, pod),
            ..Default::default()
        }
    }

    /// Default config file location: `~/.podsh/config.toml`.
    pub fn default_location() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".podsh").join("config.toml"))
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> PodshResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content).map_err(|e| {
            PodshError::Config(format!("failed to parse config at {}: {e}", path.display()))
        })?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Check the settings a session cannot start without.
    pub fn validate(&self) -> PodshResult<()> {
        if self.target.pod.is_empty() {
            return Err(PodshError::Config("no pod configured".into()));
        }
        if self.target.namespace.is_empty() {
            return Err(PodshError::Config("empty namespace".into()));
        }
        if self.target.shell.is_empty() {
            return Err(PodshError::Config("empty shell command".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(PodshError::Config("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
