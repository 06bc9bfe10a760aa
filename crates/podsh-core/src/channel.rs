//! Channel framing for the exec subprotocol.
//!
//! Wire format: `[1-byte channel id][payload]`
//!
//! Channel ids:
//! - `0` — stdin
//! - `1` — stdout
//! - `2` — stderr
//! - `3` — error/status
//! - `4` — terminal resize

use std::fmt;

use crate::error::{PodshError, PodshResult};

/// A logical sub-stream multiplexed onto the exec connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Status = 3,
    Resize = 4,
}

impl From<Channel> for u8 {
    fn from(c: Channel) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for Channel {
    type Error = PodshError;
    fn try_from(v: u8) -> PodshResult<Self> {
        match v {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::Status),
            4 => Ok(Self::Resize),
            other => Err(PodshError::MalformedFrame(format!(
                "unknown channel id {other}"
            ))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Status => "status",
            Self::Resize => "resize",
        };
        f.write_str(name)
    }
}

/// Build a wire frame: `[channel][payload]`.
pub fn encode(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(channel.into());
    frame.extend_from_slice(payload);
    frame
}

/// Split a wire frame into its channel and payload.
///
/// Fails with [`PodshError::MalformedFrame`] when the channel byte is missing
/// or does not name a known channel.
pub fn decode(frame: &[u8]) -> PodshResult<(Channel, &[u8])> {
    let (&id, payload) = frame
        .split_first()
        .ok_or_else(|| PodshError::MalformedFrame("empty frame".into()))?;
    let channel = Channel::try_from(id)?;
    Ok((channel, payload))
}
