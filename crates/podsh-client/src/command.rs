//! Command correlation over the persistent shell.
//!
//! The exec stream has no request/response framing, so every command is
//! followed by `echo <marker>`. Once the shell prints the marker on stdout,
//! everything before it belongs to the command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

use podsh_core::channel::{self, Channel};
use podsh_core::error::{PodshError, PodshResult};
use podsh_core::transport::FrameSink;

use crate::buffer::OutputBuffers;
use crate::reader::SessionShared;
use crate::session::SessionState;

const MARKER_PREFIX: &str = "__PODSH_DONE_";
const MARKER_SUFFIX: &str = "__";

/// A completion marker unique to one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    /// Generate a fresh marker from 16 random bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("{MARKER_PREFIX}{}{MARKER_SUFFIX}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Build the stdin payload: the command, then the marker echo.
pub fn compose(command: &str, marker: &Marker) -> Vec<u8> {
    format!("{}\necho {}\n", command.trim_end(), marker.as_str()).into_bytes()
}

/// Where a marker sits in a stdout buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerMatch {
    /// End of the command's own output.
    pub output_end: usize,
    /// End of the marker line, newline included.
    pub line_end: usize,
}

/// Find the first occurrence of `marker` terminated by a newline.
///
/// Bytes before the marker on the same line are command output that lacked a
/// trailing newline (e.g. `printf x`), so they stay in the command's slice.
pub fn find_marker(buf: &[u8], marker: &Marker) -> Option<MarkerMatch> {
    find_marker_from(buf, marker, 0)
}

/// Like [`find_marker`], ignoring matches that start before `from`.
///
/// Only newlines are inspected byte by byte; the marker is compared against
/// the bytes in front of each one.
pub fn find_marker_from(buf: &[u8], marker: &Marker, from: usize) -> Option<MarkerMatch> {
    let needle = marker.as_str().as_bytes();
    buf.iter()
        .enumerate()
        .skip(from + needle.len())
        .filter(|(_, b)| **b == b'\n')
        .map(|(nl, _)| nl)
        .find(|&nl| &buf[nl - needle.len()..nl] == needle)
        .map(|nl| MarkerMatch {
            output_end: nl - needle.len(),
            line_end: nl + 1,
        })
}

/// Incremental search for one marker in the stdout stream.
///
/// Each call looks only at stdout that arrived since the previous one, plus a
/// marker-length overlap.
#[derive(Debug)]
pub(crate) struct MarkerScan {
    marker: Marker,
    /// Stream offset up to which stdout has been searched.
    scanned: usize,
}

impl MarkerScan {
    pub fn new(marker: Marker) -> Self {
        Self { marker, scanned: 0 }
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Positions in the returned match are relative to the current buffer.
    fn search(&mut self, buffers: &OutputBuffers) -> Option<MarkerMatch> {
        let base = buffers.stdout_offset();
        let buf = buffers.stdout();
        let end = base + buf.len();
        if end == self.scanned {
            return None;
        }
        let from = self.scanned.saturating_sub(self.marker.as_str().len()).max(base) - base;
        self.scanned = end;
        find_marker_from(buf, &self.marker, from)
    }
}

/// Claim a command's output if its marker has arrived.
pub(crate) fn take_output(buffers: &mut OutputBuffers, scan: &mut MarkerScan) -> Option<CommandOutput> {
    let found = scan.search(buffers)?;
    let stdout = buffers.consume_stdout(found.output_end);
    buffers.consume_stdout(found.line_end - found.output_end);
    Some(CommandOutput {
        stdout,
        stderr: buffers.take_stderr(),
    })
}

/// Discard the output of abandoned commands whose markers have now arrived.
///
/// Stderr is dropped only as far as it had got when the marker line came in;
/// anything later belongs to the command that is running now.
pub(crate) fn drain_stale(buffers: &mut OutputBuffers, stale: &mut Vec<MarkerScan>) {
    stale.retain_mut(|scan| {
        let Some(found) = scan.search(buffers) else {
            return true;
        };
        let stderr_end = buffers.stderr_at(buffers.stdout_offset() + found.line_end);
        let stdout = buffers.consume_stdout(found.line_end);
        let stderr = buffers.take_stderr_until(stderr_end);
        debug!(
            marker = %scan.marker().as_str(),
            stdout = stdout.len(),
            stderr = stderr.len(),
            "discarded output of abandoned command"
        );
        false
    });
}

/// Marks the session non-reentrant for the lifetime of one `run()`.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> PodshResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PodshError::CommandInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A marker that has been (or may have been) written to the shell.
///
/// Dropped without [`Pending::complete`] (timeout, cancellation) it is
/// recorded as stale so its late output is discarded.
struct Pending<'a> {
    shared: &'a SessionShared,
    marker: Option<Marker>,
}

impl Pending<'_> {
    fn complete(mut self) {
        self.marker = None;
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            warn!(marker = %marker.as_str(), "command abandoned before completion");
            self.shared.lock().abandon(marker);
        }
    }
}

/// Writes commands to the shell and matches them to their output.
pub(crate) struct Correlator {
    sink: Mutex<Box<dyn FrameSink>>,
    shared: Arc<SessionShared>,
    in_flight: AtomicBool,
    poll_interval: Duration,
}

impl Correlator {
    pub fn new(sink: Box<dyn FrameSink>, shared: Arc<SessionShared>, poll_interval: Duration) -> Self {
        Self {
            sink: Mutex::new(sink),
            shared,
            in_flight: AtomicBool::new(false),
            poll_interval,
        }
    }

    /// Run one command and return its output.
    pub async fn run(&self, command: &str, timeout: Option<Duration>) -> PodshResult<CommandOutput> {
        let _in_flight = InFlight::acquire(&self.in_flight)?;

        if let Some(reason) = self.shared.lock().closed_reason() {
            return Err(PodshError::SessionClosed(reason));
        }

        let marker = Marker::generate();
        debug!(command = %command, marker = %marker.as_str(), "running command");

        let pending = Pending {
            shared: self.shared.as_ref(),
            marker: Some(marker.clone()),
        };

        let frame = channel::encode(Channel::Stdin, &compose(command, &marker));
        let sent = {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };
        if let Err(e) = sent {
            pending.complete();
            let reason = format!("failed to write command: {e}");
            if self.shared.lock().finish(SessionState::Failed, reason.clone()) {
                self.shared.wake();
            }
            return Err(PodshError::SessionClosed(reason));
        }

        let output = match timeout {
            Some(limit) => time::timeout(limit, self.wait_for(&marker))
                .await
                .map_err(|_| PodshError::CommandTimeout(limit))??,
            None => self.wait_for(&marker).await?,
        };

        pending.complete();
        debug!(
            stdout = output.stdout.len(),
            stderr = output.stderr.len(),
            "command finished"
        );
        Ok(output)
    }

    /// Suspend until `marker` shows up, the session ends, or the caller
    /// gives up. Wakes on every reader update and at least once per poll
    /// interval.
    async fn wait_for(&self, marker: &Marker) -> PodshResult<CommandOutput> {
        let mut scan = MarkerScan::new(marker.clone());
        loop {
            let notified = self.shared.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                let inner = &mut *inner;
                drain_stale(&mut inner.buffers, &mut inner.stale_markers);
                if let Some(output) = take_output(&mut inner.buffers, &mut scan) {
                    return Ok(output);
                }
                if let Some(reason) = inner.closed_reason() {
                    return Err(PodshError::SessionClosed(reason));
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Close the outbound half of the connection.
    pub async fn close(&self) -> PodshResult<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(s: &str) -> Marker {
        Marker(s.to_string())
    }

    #[test]
    fn markers_are_unique() {
        let a = Marker::generate();
        let b = Marker::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(MARKER_PREFIX));
        assert_eq!(a.as_str().len(), MARKER_PREFIX.len() + 32 + MARKER_SUFFIX.len());
    }

    #[test]
    fn compose_appends_marker_echo() {
        let m = marker("MK");
        assert_eq!(compose("ls /", &m), b"ls /\necho MK\n");
        assert_eq!(compose("ls /  \n", &m), b"ls /\necho MK\n");
        assert_eq!(compose("", &m), b"\necho MK\n");
    }

    #[test]
    fn find_marker_on_own_line() {
        let m = marker("MK");
        let found = find_marker(b"hello\nMK\nrest", &m).unwrap();
        assert_eq!(found, MarkerMatch { output_end: 6, line_end: 9 });
    }

    #[test]
    fn find_marker_needs_newline() {
        let m = marker("MK");
        assert!(find_marker(b"hello\nMK", &m).is_none());
        assert!(find_marker(b"MK", &m).is_none());
        assert!(find_marker(b"hello\nMKX\n", &m).is_none());
    }

    #[test]
    fn find_marker_after_unterminated_output() {
        let m = marker("MK");
        let found = find_marker(b"no-newlineMK\n", &m).unwrap();
        assert_eq!(found.output_end, 10);
    }

    fn scan(s: &str) -> MarkerScan {
        MarkerScan::new(marker(s))
    }

    #[test]
    fn take_output_consumes_through_marker() {
        let mut bufs = OutputBuffers::new();
        bufs.append(Channel::Stdout, b"a\nb\nMK\nnext");
        bufs.append(Channel::Stderr, b"warn\n");

        let out = take_output(&mut bufs, &mut scan("MK")).unwrap();
        assert_eq!(out.stdout, b"a\nb\n");
        assert_eq!(out.stderr, b"warn\n");
        assert_eq!(bufs.stdout(), b"next");
        assert!(bufs.stderr().is_empty());
    }

    #[test]
    fn take_output_waits_for_marker() {
        let mut bufs = OutputBuffers::new();
        bufs.append(Channel::Stdout, b"partial output");
        assert!(take_output(&mut bufs, &mut scan("MK")).is_none());
        assert_eq!(bufs.stdout(), b"partial output");
    }

    #[test]
    fn scan_finds_marker_split_across_appends() {
        let mut bufs = OutputBuffers::new();
        let mut pending = scan("__MARK__");
        bufs.append(Channel::Stdout, b"out\n__MA");
        assert!(pending.search(&bufs).is_none());
        bufs.append(Channel::Stdout, b"RK__\n");
        assert_eq!(
            pending.search(&bufs),
            Some(MarkerMatch { output_end: 4, line_end: 13 })
        );
    }

    #[test]
    fn scan_resumes_after_prefix_is_consumed() {
        let mut bufs = OutputBuffers::new();
        let mut pending = scan("MK");
        bufs.append(Channel::Stdout, b"stale\nOLD\nM");
        assert!(pending.search(&bufs).is_none());
        bufs.consume_stdout(10);
        bufs.append(Channel::Stdout, b"K\n");
        assert_eq!(
            pending.search(&bufs),
            Some(MarkerMatch { output_end: 0, line_end: 3 })
        );
    }

    #[test]
    fn large_output_in_small_frames_is_scanned_once() {
        const FRAME: usize = 16 * 1024;
        const TOTAL: usize = 8 * 1024 * 1024;
        let line = [b'x'; 63].iter().chain(b"\n").copied().collect::<Vec<u8>>();
        let frame = line.repeat(FRAME / line.len());

        let mut bufs = OutputBuffers::new();
        let mut pending = scan("__PODSH_DONE_0123456789abcdef0123456789abcdef__");
        let started = std::time::Instant::now();
        for _ in 0..TOTAL / FRAME {
            bufs.append(Channel::Stdout, &frame);
            assert!(take_output(&mut bufs, &mut pending).is_none());
        }
        bufs.append(Channel::Stdout, b"__PODSH_DONE_0123456789abcdef0123456789abcdef__\n");
        let out = take_output(&mut bufs, &mut pending).unwrap();

        assert_eq!(out.stdout.len(), TOTAL);
        assert!(bufs.is_empty());
        assert!(
            started.elapsed() < std::time::Duration::from_secs(10),
            "scanning took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn drain_stale_drops_abandoned_output() {
        let mut bufs = OutputBuffers::new();
        bufs.append(Channel::Stderr, b"slow warning\n");
        bufs.append(Channel::Stdout, b"slow result\nOLD\nfresh\n");
        let mut stale = vec![scan("OLD"), scan("NEVER")];

        drain_stale(&mut bufs, &mut stale);

        assert_eq!(bufs.stdout(), b"fresh\n");
        assert!(bufs.stderr().is_empty());
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].marker(), &marker("NEVER"));
    }

    #[test]
    fn drain_stale_keeps_stderr_of_next_command() {
        let mut bufs = OutputBuffers::new();
        bufs.append(Channel::Stderr, b"old warning\n");
        bufs.append(Channel::Stdout, b"OLD\n");
        bufs.append(Channel::Stderr, b"new command error\n");
        bufs.append(Channel::Stdout, b"NEW\n");
        let mut stale = vec![scan("OLD")];

        drain_stale(&mut bufs, &mut stale);
        let out = take_output(&mut bufs, &mut scan("NEW")).unwrap();

        assert!(stale.is_empty());
        assert!(out.stdout.is_empty());
        assert_eq!(out.stderr, b"new command error\n");
    }

    #[test]
    fn in_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = InFlight::acquire(&flag).unwrap();
        assert!(matches!(
            InFlight::acquire(&flag),
            Err(PodshError::CommandInProgress)
        ));
        drop(guard);
        assert!(InFlight::acquire(&flag).is_ok());
    }

    #[test]
    fn output_lossy_helpers() {
        let out = CommandOutput {
            stdout: b"hi\n".to_vec(),
            stderr: vec![0xff],
        };
        assert_eq!(out.stdout_lossy(), "hi\n");
        assert_eq!(out.stderr_lossy(), "\u{fffd}");
    }
}
