//! A scripted stand-in for the remote shell, used by the session tests.

use podsh_core::channel::{encode, Channel};
use podsh_core::transport::memory::RemoteEnd;
use tokio::task::JoinHandle;

/// Interprets the handful of shell commands the tests send.
///
/// - `echo X` prints `X\n` on stdout, `echo X 1>&2` on stderr
/// - `printf X` prints `X` with no newline
/// - `exit N` reports a terminal status and ignores everything after it
/// - `hang` holds every following line until [`FakeShell::release`]
/// - anything else prints `sh: <cmd>: not found` on stderr
#[derive(Debug, Default)]
pub(crate) struct FakeShell {
    holding: bool,
    held: Vec<String>,
    exited: bool,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdin payload; returns the frames the shell answers with.
    pub fn feed(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        let text = String::from_utf8_lossy(payload);
        let mut frames = Vec::new();
        for line in text.lines() {
            if self.holding {
                self.held.push(line.to_string());
            } else {
                frames.extend(self.exec(line));
            }
        }
        frames
    }

    /// Let the hung command finish and run whatever queued behind it.
    pub fn release(&mut self) -> Vec<Vec<u8>> {
        self.holding = false;
        let held = std::mem::take(&mut self.held);
        held.iter().flat_map(|line| self.exec(line)).collect()
    }

    fn exec(&mut self, line: &str) -> Vec<Vec<u8>> {
        let line = line.trim();
        if line.is_empty() || self.exited {
            return Vec::new();
        }
        if line == "hang" {
            self.holding = true;
            return Vec::new();
        }
        if let Some(rest) = line.strip_prefix("echo ") {
            return match rest.strip_suffix(" 1>&2") {
                Some(text) => vec![encode(Channel::Stderr, format!("{text}\n").as_bytes())],
                None => vec![encode(Channel::Stdout, format!("{rest}\n").as_bytes())],
            };
        }
        if let Some(rest) = line.strip_prefix("printf ") {
            return vec![encode(Channel::Stdout, rest.as_bytes())];
        }
        if let Some(code) = line.strip_prefix("exit ") {
            self.exited = true;
            let status = if code == "0" {
                r#"{"metadata":{},"status":"Success"}"#.to_string()
            } else {
                format!(
                    r#"{{"metadata":{{}},"status":"Failure","message":"command terminated with non-zero exit code","reason":"NonZeroExitCode","details":{{"causes":[{{"reason":"ExitCode","message":"{code}"}}]}}}}"#
                )
            };
            return vec![encode(Channel::Status, status.as_bytes())];
        }
        vec![encode(
            Channel::Stderr,
            format!("sh: {line}: not found\n").as_bytes(),
        )]
    }
}

/// Serve `remote` with a [`FakeShell`] until the session closes its side.
pub(crate) fn spawn_fake_shell(mut remote: RemoteEnd) -> JoinHandle<RemoteEnd> {
    tokio::spawn(async move {
        let mut shell = FakeShell::new();
        while let Some(frame) = remote.recv().await {
            let Ok((Channel::Stdin, payload)) = podsh_core::channel::decode(&frame) else {
                continue;
            };
            for reply in shell.feed(payload) {
                remote.send_frame(reply);
            }
        }
        remote
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use podsh_core::channel::decode;

    fn decoded(frames: Vec<Vec<u8>>) -> Vec<(Channel, Vec<u8>)> {
        frames
            .iter()
            .map(|f| {
                let (c, p) = decode(f).unwrap();
                (c, p.to_vec())
            })
            .collect()
    }

    #[test]
    fn echo_goes_to_stdout_or_stderr() {
        let mut shell = FakeShell::new();
        assert_eq!(
            decoded(shell.feed(b"echo hi\necho oops 1>&2\n")),
            vec![
                (Channel::Stdout, b"hi\n".to_vec()),
                (Channel::Stderr, b"oops\n".to_vec()),
            ]
        );
    }

    #[test]
    fn hang_holds_until_release() {
        let mut shell = FakeShell::new();
        assert!(shell.feed(b"hang\necho M1\n").is_empty());
        assert_eq!(
            decoded(shell.release()),
            vec![(Channel::Stdout, b"M1\n".to_vec())]
        );
    }
}
