//! Exec shell session.
//!
//! A `Session` owns one upgraded exec connection to a shell process: the
//! background stream reader on the receive half, and the command correlator
//! on the send half.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use podsh_core::error::{PodshError, PodshResult};
use podsh_core::status::ExitStatus;
use podsh_core::transport::ExecChannel;

use crate::command::{CommandOutput, Correlator};
use crate::config::SessionConfig;
use crate::reader::{self, SessionShared};
use crate::transport::Upgrader;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The protocol upgrade is in progress.
    Opening,
    /// The shell is attached and accepting commands.
    Ready,
    /// Closed by the caller, or the remote shell exited.
    Closed,
    /// The connection broke.
    Failed,
}

/// An interactive shell inside a pod, driven one command at a time.
pub struct Session {
    shared: Arc<SessionShared>,
    correlator: Correlator,
    reader_handle: JoinHandle<()>,
    default_timeout: Option<Duration>,
}

impl Session {
    /// Upgrade a connection to the configured target and attach to its shell.
    pub async fn open(upgrader: &dyn Upgrader, config: &SessionConfig) -> PodshResult<Self> {
        config.validate()?;
        let target = &config.target;
        info!(
            namespace = %target.namespace,
            pod = %target.pod,
            shell = ?target.shell,
            "opening exec session"
        );

        let shared = Arc::new(SessionShared::new());
        let upgraded = time::timeout(config.connect_timeout(), upgrader.upgrade(config)).await;
        let channel = match upgraded {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(upgrade_failed(&shared, e)),
            Err(_) => {
                return Err(upgrade_failed(
                    &shared,
                    PodshError::ProtocolUpgradeFailed(format!(
                        "timed out after {:?}",
                        config.connect_timeout()
                    )),
                ))
            }
        };

        Ok(Self::attach(shared, channel, config))
    }

    /// Attach to an already-upgraded exec connection.
    ///
    /// Must be called from within a tokio runtime: the stream reader is
    /// spawned immediately.
    pub fn from_channel(channel: ExecChannel, config: &SessionConfig) -> Self {
        Self::attach(Arc::new(SessionShared::new()), channel, config)
    }

    fn attach(shared: Arc<SessionShared>, channel: ExecChannel, config: &SessionConfig) -> Self {
        let ExecChannel { sink, source } = channel;

        shared.lock().state = SessionState::Ready;
        let reader_handle = reader::spawn(source, shared.clone());
        let correlator = Correlator::new(sink, shared.clone(), config.poll_interval());
        debug!("exec session ready");

        Self {
            shared,
            correlator,
            reader_handle,
            default_timeout: config.command_timeout(),
        }
    }

    /// Open a session, hand it to `f`, and close it afterwards whatever
    /// `f` returned.
    pub async fn scoped<F, Fut, T>(
        upgrader: &dyn Upgrader,
        config: &SessionConfig,
        f: F,
    ) -> PodshResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = PodshResult<T>>,
    {
        let session = Arc::new(Self::open(upgrader, config).await?);
        let result = f(session.clone()).await;
        let closed = session.close().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Run `command` in the shell with the configured default timeout.
    pub async fn run(&self, command: &str) -> PodshResult<CommandOutput> {
        self.correlator.run(command, self.default_timeout).await
    }

    /// Run `command` with an explicit timeout (`None` waits indefinitely).
    pub async fn run_with_timeout(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> PodshResult<CommandOutput> {
        self.correlator.run(command, timeout).await
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Terminal status reported by the remote side, once the shell has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.lock().status.clone()
    }

    /// Number of inbound frames skipped as malformed.
    pub fn malformed_frames(&self) -> u64 {
        self.shared.lock().malformed_frames
    }

    /// Close the connection and stop the stream reader. Idempotent.
    pub async fn close(&self) -> PodshResult<()> {
        let was_open = self.shared.lock().finish(SessionState::Closed, "closed by caller");
        self.shared.wake();
        if was_open {
            info!("closing exec session");
        }

        let result = self.correlator.close().await;
        self.reader_handle.abort();
        match result {
            // A connection that already broke may refuse a close frame.
            Err(e) if was_open => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn upgrade_failed(shared: &SessionShared, e: PodshError) -> PodshError {
    let e = match e {
        PodshError::ProtocolUpgradeFailed(_) => e,
        other => PodshError::ProtocolUpgradeFailed(other.to_string()),
    };
    shared.lock().finish(SessionState::Failed, e.to_string());
    e
}
