//! Per-channel accumulation buffers for shell output.
//!
//! The stream reader only ever appends; the command correlator only ever
//! consumes a prefix. Nothing else mutates the bytes.
//!
//! Positions handed out by [`OutputBuffers::stdout_offset`] and
//! [`OutputBuffers::stderr_at`] are absolute stream offsets, so they stay
//! valid after a prefix has been consumed.

use std::collections::VecDeque;

use podsh_core::Channel;

/// Accumulated stdout and stderr not yet claimed by a command.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Stream offset of `stdout[0]`.
    stdout_base: usize,
    /// Stream offset of `stderr[0]`.
    stderr_base: usize,
    /// `(stdout end, stderr end)` after stdout appends, one entry per run of
    /// stdout frames with no stderr in between.
    watermarks: VecDeque<(usize, usize)>,
}

impl OutputBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to the buffer for `channel`.
    ///
    /// Returns `false` for channels that carry no shell output.
    pub fn append(&mut self, channel: Channel, data: &[u8]) -> bool {
        match channel {
            Channel::Stdout => {
                self.stdout.extend_from_slice(data);
                let mark = (self.stdout_end(), self.stderr_end());
                match self.watermarks.back_mut() {
                    Some(last) if last.1 == mark.1 => last.0 = mark.0,
                    _ => self.watermarks.push_back(mark),
                }
            }
            Channel::Stderr => self.stderr.extend_from_slice(data),
            _ => return false,
        }
        true
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Stream offset of the first buffered stdout byte.
    pub fn stdout_offset(&self) -> usize {
        self.stdout_base
    }

    fn stdout_end(&self) -> usize {
        self.stdout_base + self.stdout.len()
    }

    fn stderr_end(&self) -> usize {
        self.stderr_base + self.stderr.len()
    }

    /// How far stderr had got when stdout reached stream offset `pos`.
    pub fn stderr_at(&self, pos: usize) -> usize {
        self.watermarks
            .iter()
            .find(|(out_end, _)| *out_end >= pos)
            .map_or_else(|| self.stderr_end(), |(_, err_end)| *err_end)
    }

    /// Remove and return the first `n` bytes of stdout.
    pub fn consume_stdout(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.stdout.len());
        self.stdout_base += n;
        while matches!(self.watermarks.front(), Some((end, _)) if *end <= self.stdout_base) {
            self.watermarks.pop_front();
        }
        self.stdout.drain(..n).collect()
    }

    /// Remove and return everything buffered on stderr.
    pub fn take_stderr(&mut self) -> Vec<u8> {
        self.stderr_base += self.stderr.len();
        std::mem::take(&mut self.stderr)
    }

    /// Remove and return stderr up to stream offset `end`.
    pub fn take_stderr_until(&mut self, end: usize) -> Vec<u8> {
        let n = end.saturating_sub(self.stderr_base).min(self.stderr.len());
        self.stderr_base += n;
        self.stderr.drain(..n).collect()
    }

    /// Total buffered bytes across both channels.
    pub fn len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}
