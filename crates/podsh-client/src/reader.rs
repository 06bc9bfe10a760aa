//! Background stream reader.
//!
//! Owns the receive half of the exec connection for the whole session,
//! decodes each inbound frame and routes its payload into the shared session
//! state. Waiting commands are woken after every change.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use podsh_core::channel::{self, Channel};
use podsh_core::status::ExitStatus;
use podsh_core::transport::FrameSource;

use crate::buffer::OutputBuffers;
use crate::command::{Marker, MarkerScan};
use crate::session::SessionState;

/// Session state shared between the reader task and the command correlator.
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub state: SessionState,
    pub buffers: OutputBuffers,
    /// Terminal status from the status channel, set at most once.
    pub status: Option<ExitStatus>,
    /// Why the session left `Ready`, if it has.
    pub close_reason: Option<String>,
    pub malformed_frames: u64,
    /// Markers of commands that timed out or were cancelled, oldest first.
    pub stale_markers: Vec<MarkerScan>,
}

/// Abandoned markers remembered at once. Older ones are forgotten first.
const MAX_STALE_MARKERS: usize = 8;

impl SessionInner {
    /// Reason a waiting command can no longer complete, if any.
    pub fn closed_reason(&self) -> Option<String> {
        match self.state {
            SessionState::Closed | SessionState::Failed => Some(
                self.close_reason
                    .clone()
                    .unwrap_or_else(|| format!("session is {:?}", self.state)),
            ),
            SessionState::Opening | SessionState::Ready => self
                .status
                .as_ref()
                .map(|s| format!("remote shell exited ({s})")),
        }
    }

    /// Leave `Opening`/`Ready`. The first terminal state wins.
    pub fn finish(&mut self, state: SessionState, reason: impl Into<String>) -> bool {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return false;
        }
        self.state = state;
        self.close_reason = Some(reason.into());
        self.stale_markers.clear();
        true
    }

    /// Remember the marker of a command nobody waits for any more.
    pub fn abandon(&mut self, marker: Marker) {
        if matches!(self.state, SessionState::Closed | SessionState::Failed) {
            return;
        }
        if self.stale_markers.len() >= MAX_STALE_MARKERS {
            let forgotten = self.stale_markers.remove(0);
            warn!(
                marker = %forgotten.marker().as_str(),
                "forgetting abandoned command whose marker never arrived"
            );
        }
        self.stale_markers.push(MarkerScan::new(marker));
    }
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    inner: Mutex<SessionInner>,
    notify: Notify,
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Opening,
                buffers: OutputBuffers::new(),
                status: None,
                close_reason: None,
                malformed_frames: 0,
                stale_markers: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Lock the session state. Never held across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Decode one inbound frame and apply it.
    pub fn route(&self, frame: &[u8]) {
        let (channel, payload) = match channel::decode(frame) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping {}", e);
                self.lock().malformed_frames += 1;
                return;
            }
        };

        match channel {
            Channel::Stdout | Channel::Stderr => {
                let mut inner = self.lock();
                if inner.status.is_some() {
                    debug!("{} data after terminal status ({} bytes)", channel, payload.len());
                }
                inner.buffers.append(channel, payload);
            }
            Channel::Status => {
                let status = ExitStatus::from_payload(payload);
                let mut inner = self.lock();
                if inner.status.is_some() {
                    warn!("ignoring repeated status message: {}", status);
                    return;
                }
                debug!("remote shell finished: {}", status);
                inner.status = Some(status);
            }
            Channel::Stdin | Channel::Resize => {
                debug!("ignoring inbound frame on {} channel", channel);
                return;
            }
        }

        self.wake();
    }

    /// The connection ended, cleanly (`error == None`) or not.
    pub fn disconnected(&self, error: Option<String>) {
        {
            let mut inner = self.lock();
            let (state, reason) = match (error, &inner.status) {
                (None, Some(status)) => (
                    SessionState::Closed,
                    format!("remote shell exited ({status})"),
                ),
                (None, None) => (
                    SessionState::Failed,
                    "connection closed by remote".to_string(),
                ),
                (Some(e), _) => (SessionState::Failed, e),
            };
            if inner.finish(state, reason) {
                debug!("session moved to {:?}", inner.state);
            }
        }
        self.wake();
    }
}

/// Spawn the reader task for an upgraded connection.
pub(crate) fn spawn(source: Box<dyn FrameSource>, shared: Arc<SessionShared>) -> JoinHandle<()> {
    tokio::spawn(read_loop(source, shared))
}

async fn read_loop(mut source: Box<dyn FrameSource>, shared: Arc<SessionShared>) {
    loop {
        match source.recv().await {
            Ok(Some(frame)) => shared.route(&frame),
            Ok(None) => {
                debug!("exec connection closed");
                shared.disconnected(None);
                break;
            }
            Err(e) => {
                error!("exec connection read error: {}", e);
                shared.disconnected(Some(e.to_string()));
                break;
            }
        }
    }

    debug!("stream reader ended");
}
