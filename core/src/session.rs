//! A single command execution on a single host.
//!
//! A session owns one transport connection from the moment the command
//! is armed until the connection is torn down. The lifecycle is
//! strict: connect, release, drain until the exit status is captured,
//! close. Sessions never block; draining makes exactly one attempt to
//! pull whatever is ready.

use std::io;
use std::os::fd::BorrowedFd;

use tracing::debug;

use crate::error::{Error, Result};
use crate::host::HostDescriptor;
use crate::token::quote;
use crate::transport::{Connection, Transport};

// ---------------------------------------------------------------------------
// Command framing
// ---------------------------------------------------------------------------

/// Wraps a command for remote execution.
///
/// The leading `read` is the release gate: the command sits armed
/// until a newline arrives on stdin, and runs never if stdin closes
/// without one. The rest moves into the workspace and loads the
/// profile before the command proper.
pub fn frame_command(workspace: &str, profile: Option<&str>, command: &str) -> String {
    let mut framed = format!("read -r _ && cd {}", quote(workspace));
    if let Some(profile) = profile {
        if !profile.is_empty() {
            framed.push_str(&format!(" && . {}", quote(profile)));
        }
    }
    framed.push_str(&format!(" && {command}"));
    framed
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, command armed but not yet running.
    Connecting,
    /// Released; the command is running.
    Started,
    /// At least one output byte has arrived.
    Draining,
    /// Streams closed and exit status captured.
    Done,
    /// Connection torn down.
    Closed,
}

/// One armed or running command on one host.
pub struct Session {
    target: HostDescriptor,
    command: String,
    conn: Box<dyn Connection>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_eof: bool,
    stderr_eof: bool,
    exit_status: Option<i32>,
    state: SessionState,
}

impl Session {
    /// Connects to `target` and arms `command` there.
    ///
    /// The command does not begin executing until [`Session::release`].
    pub fn open(transport: &dyn Transport, target: HostDescriptor, command: &str) -> Result<Session> {
        let framed = frame_command(&target.workspace, target.profile.as_deref(), command);
        debug!("arming on {}: {}", target.location, framed);
        let conn = transport.connect(&target, &framed)?;
        Ok(Session {
            target,
            command: command.to_string(),
            conn,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_eof: false,
            stderr_eof: false,
            exit_status: None,
            state: SessionState::Connecting,
        })
    }

    /// Lets the armed command begin executing.
    pub fn release(&mut self) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(Error::Usage(format!(
                "session on {} released twice",
                self.target.location
            )));
        }
        self.conn.release()?;
        self.state = SessionState::Started;
        Ok(())
    }

    /// Makes one non-blocking attempt to pull output.
    ///
    /// Returns `Ok(true)` when bytes were read from either stream.
    /// Once both streams have closed, each call checks for the exit
    /// status; capturing it does not count as progress.
    pub fn drain(&mut self) -> Result<bool> {
        match self.state {
            SessionState::Connecting => {
                return Err(Error::Usage(format!(
                    "session on {} drained before release",
                    self.target.location
                )));
            }
            SessionState::Closed => {
                return Err(Error::Usage(format!(
                    "session on {} drained after close",
                    self.target.location
                )));
            }
            SessionState::Done => return Ok(false),
            SessionState::Started | SessionState::Draining => {}
        }

        let mut buf = [0u8; 4096];

        if !self.stdout_eof {
            match self.conn.read_stdout(&mut buf) {
                Ok(0) => self.stdout_eof = true,
                Ok(n) => {
                    self.stdout.extend_from_slice(&buf[..n]);
                    self.state = SessionState::Draining;
                    return Ok(true);
                }
                Err(ref e) if ignorable(e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !self.stderr_eof {
            match self.conn.read_stderr(&mut buf) {
                Ok(0) => self.stderr_eof = true,
                Ok(n) => {
                    self.stderr.extend_from_slice(&buf[..n]);
                    self.state = SessionState::Draining;
                    return Ok(true);
                }
                Err(ref e) if ignorable(e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.stdout_eof && self.stderr_eof {
            if let Some(status) = self.conn.poll_exit()? {
                debug!("{} exited with {}", self.target.location, status);
                self.exit_status = Some(status);
                self.state = SessionState::Done;
            }
        }
        Ok(false)
    }

    /// Tears the connection down. Ends the command if still running.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting => {
                return Err(Error::Usage(format!(
                    "session on {} closed before start",
                    self.target.location
                )));
            }
            SessionState::Closed => {
                return Err(Error::Usage(format!(
                    "session on {} closed twice",
                    self.target.location
                )));
            }
            _ => {}
        }
        self.conn.shutdown()?;
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn location(&self) -> &str {
        &self.target.location
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr_bytes(&self) -> &[u8] {
        &self.stderr
    }

    pub(crate) fn stdout_fd(&self) -> Option<BorrowedFd<'_>> {
        self.conn.stdout_fd()
    }

    pub(crate) fn stderr_fd(&self) -> Option<BorrowedFd<'_>> {
        self.conn.stderr_fd()
    }

    pub(crate) fn stdout_eof(&self) -> bool {
        self.stdout_eof
    }

    pub(crate) fn stderr_eof(&self) -> bool {
        self.stderr_eof
    }
}

fn ignorable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::thread;
    use std::time::Duration;

    fn make_target() -> HostDescriptor {
        HostDescriptor {
            location: "localhost".to_string(),
            username: None,
            workspace: "/tmp".to_string(),
            profile: None,
        }
    }

    fn drain_to_completion(session: &mut Session) {
        for _ in 0..1000 {
            while session.drain().unwrap() {}
            if session.exit_status().is_some() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("session did not finish");
    }

    // -- Framing tests --

    #[test]
    fn frame_includes_release_gate_and_workspace() {
        assert_eq!(
            frame_command("/var/work", None, "make test"),
            "read -r _ && cd /var/work && make test"
        );
    }

    #[test]
    fn frame_loads_profile_when_present() {
        assert_eq!(
            frame_command("/w", Some("/etc/profile.d/env.sh"), "true"),
            "read -r _ && cd /w && . /etc/profile.d/env.sh && true"
        );
    }

    #[test]
    fn frame_skips_empty_profile() {
        assert_eq!(frame_command("/w", Some(""), "true"), "read -r _ && cd /w && true");
    }

    #[test]
    fn frame_quotes_awkward_paths() {
        assert_eq!(
            frame_command("/my work", None, "true"),
            "read -r _ && cd '/my work' && true"
        );
    }

    // -- Lifecycle tests --

    #[test]
    fn full_lifecycle_captures_output_and_exit() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "echo out; echo err >&2").unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        session.release().unwrap();
        assert_eq!(session.state(), SessionState::Started);

        drain_to_completion(&mut session);
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.exit_status(), Some(0));
        assert_eq!(session.stdout_bytes(), b"out\n");
        assert_eq!(session.stderr_bytes(), b"err\n");

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn nonzero_exit_is_captured_not_raised() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "exit 3").unwrap();
        session.release().unwrap();
        drain_to_completion(&mut session);
        assert_eq!(session.exit_status(), Some(3));
        session.close().unwrap();
    }

    #[test]
    fn drain_after_done_reports_no_progress() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "true").unwrap();
        session.release().unwrap();
        drain_to_completion(&mut session);
        assert!(!session.drain().unwrap());
        session.close().unwrap();
    }

    // -- Misuse tests --

    #[test]
    fn drain_before_release_is_an_error() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "true").unwrap();
        assert!(matches!(session.drain(), Err(Error::Usage(_))));
        session.release().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn release_twice_is_an_error() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "true").unwrap();
        session.release().unwrap();
        assert!(matches!(session.release(), Err(Error::Usage(_))));
        session.close().unwrap();
    }

    #[test]
    fn close_before_release_is_an_error() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "true").unwrap();
        assert!(matches!(session.close(), Err(Error::Usage(_))));
        session.release().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn close_twice_is_an_error() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "true").unwrap();
        session.release().unwrap();
        session.close().unwrap();
        assert!(matches!(session.close(), Err(Error::Usage(_))));
    }

    #[test]
    fn close_ends_a_running_command() {
        let transport = LocalTransport::new();
        let mut session = Session::open(&transport, make_target(), "sleep 60").unwrap();
        session.release().unwrap();
        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
