//! Abstract transport traits for podsh.
//!
//! An upgraded exec connection is handed to the session engine already split
//! into its send half ([`FrameSink`]) and receive half ([`FrameSource`]) so the
//! stream reader task can own the receive side outright.

pub mod memory;

use std::future::Future;
use std::pin::Pin;

use crate::error::PodshResult;

/// Boxed `Send` future, so the traits stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outbound half of an exec connection. Each call sends one whole message.
pub trait FrameSink: Send {
    /// Send one encoded frame.
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, PodshResult<()>>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&mut self) -> BoxFuture<'_, PodshResult<()>>;
}

/// Inbound half of an exec connection.
pub trait FrameSource: Send {
    /// Receive the next whole message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection cleanly.
    fn recv(&mut self) -> BoxFuture<'_, PodshResult<Option<Vec<u8>>>>;
}

/// An upgraded exec connection, split into its two halves.
pub struct ExecChannel {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl ExecChannel {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}
