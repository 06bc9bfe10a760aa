//! podsh-core: Shared protocol library for podsh.
//!
//! Provides the exec channel codec, status-channel parsing, the error type,
//! and the abstract transport traits the session engine runs on.

pub mod channel;
pub mod error;
pub mod status;
pub mod transport;

// Re-export commonly used items at crate root.
pub use channel::{decode, encode, Channel};
pub use error::{PodshError, PodshResult};
pub use status::ExitStatus;
pub use transport::{BoxFuture, ExecChannel, FrameSink, FrameSource};
