//! In-memory exec connection.
//!
//! [`pair`] returns an [`ExecChannel`] for the session side and a
//! [`RemoteEnd`] that plays the server: it sees every frame the session sends
//! and can push frames, transport errors, or a disconnect back.

use tokio::sync::mpsc;

use super::{BoxFuture, ExecChannel, FrameSink, FrameSource};
use crate::channel::{self, Channel};
use crate::error::{PodshError, PodshResult};

/// Create a connected in-memory exec channel.
pub fn pair() -> (ExecChannel, RemoteEnd) {
    let (to_remote_tx, to_remote_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (to_local_tx, to_local_rx) = mpsc::unbounded_channel::<PodshResult<Vec<u8>>>();

    let channel = ExecChannel::new(
        MemorySink {
            tx: Some(to_remote_tx),
        },
        MemorySource { rx: to_local_rx },
    );
    let remote = RemoteEnd {
        rx: to_remote_rx,
        tx: Some(to_local_tx),
    };
    (channel, remote)
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, PodshResult<()>> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| PodshError::Transport("connection closed".into()))?;
            tx.send(frame)
                .map_err(|_| PodshError::Transport("remote end dropped".into()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, PodshResult<()>> {
        Box::pin(async move {
            self.tx = None;
            Ok(())
        })
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<PodshResult<Vec<u8>>>,
}

impl FrameSource for MemorySource {
    fn recv(&mut self) -> BoxFuture<'_, PodshResult<Option<Vec<u8>>>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }
}

/// The server side of an in-memory exec connection.
pub struct RemoteEnd {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: Option<mpsc::UnboundedSender<PodshResult<Vec<u8>>>>,
}

impl RemoteEnd {
    /// Wait for the next frame sent by the session.
    ///
    /// Returns `None` once the session has closed or dropped its sink.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Take a frame the session has already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Push a raw frame to the session. Returns `false` if it is gone.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Encode and push a payload on the given channel.
    pub fn send(&self, channel: Channel, payload: &[u8]) -> bool {
        self.send_frame(channel::encode(channel, payload))
    }

    /// Deliver a transport-level read error to the session.
    pub fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(PodshError::Transport(reason.to_string())));
        }
    }

    /// Close the connection from the remote side.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}
