//! Concurrent execution of a batch of sessions.
//!
//! The multiplexer owns a batch of armed sessions end to end: it
//! registers every output descriptor for readiness, releases the whole
//! batch, then alternates between sweeping all sessions and waiting
//! for readiness until every session has delivered its exit status.
//! Output is withheld while commands run and printed per host once the
//! batch completes, so interleaved streams never mix on the terminal.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::session::{Session, SessionState};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Captured outcome of one session in a batch.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub host: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

/// Drives a batch of sessions to completion.
pub struct Multiplexer {
    wake_interval: Duration,
    deadline: Option<Duration>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Multiplexer::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        Multiplexer {
            wake_interval: Duration::from_secs(1),
            deadline: None,
        }
    }

    /// Caps how long a wait for readiness may sleep. Exit statuses are
    /// only discovered by sweeping, so this bounds how stale a
    /// finished-but-unreaped session can get.
    pub fn with_wake_interval(mut self, interval: Duration) -> Self {
        self.wake_interval = interval;
        self
    }

    /// Fails the whole batch if it outlives `deadline`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs the batch, emitting grouped output to stdout.
    ///
    /// With `expected` set, any session whose exit status differs
    /// fails the batch after output has been emitted.
    pub fn run(&self, batch: Vec<Session>, expected: Option<i32>) -> Result<Vec<ExecutionResult>> {
        let stdout = io::stdout();
        let mut sink = stdout.lock();
        self.run_with_sink(batch, expected, &mut sink)
    }

    /// Runs the batch, emitting grouped output to `sink`.
    pub fn run_with_sink<W: Write>(
        &self,
        mut batch: Vec<Session>,
        expected: Option<i32>,
        sink: &mut W,
    ) -> Result<Vec<ExecutionResult>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let poller = Poller::new()?;
        // One slot per stream; flipped off as each fd is deleted at EOF.
        let mut regs: Vec<[bool; 2]> = vec![[false; 2]; batch.len()];
        for (i, session) in batch.iter().enumerate() {
            if let Some(fd) = session.stdout_fd() {
                // Safety: the fd outlives its registration. It is
                // deleted at stream EOF, before the session closes the
                // connection that owns it.
                unsafe {
                    poller.add_with_mode(fd.as_raw_fd(), Event::readable(i * 2), PollMode::Level)?;
                }
                regs[i][0] = true;
            }
            if let Some(fd) = session.stderr_fd() {
                unsafe {
                    poller.add_with_mode(
                        fd.as_raw_fd(),
                        Event::readable(i * 2 + 1),
                        PollMode::Level,
                    )?;
                }
                regs[i][1] = true;
            }
        }

        // Nothing runs until every session is registered; a failure
        // here leaves the rest armed, and dropping the batch reclaims
        // their connections.
        for session in batch.iter_mut() {
            session.release()?;
        }

        let started = Instant::now();
        let mut active = batch.len();
        let mut events = Events::new();

        while active > 0 {
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    return Err(Error::Timeout { deadline });
                }
            }

            // Sweep everything: readiness only covers sessions with
            // pollable descriptors, and exit statuses arrive without
            // any readiness event at all.
            for i in 0..batch.len() {
                if drive(&mut batch[i], &poller, &mut regs[i])? {
                    active -= 1;
                }
            }
            if active == 0 {
                break;
            }

            let mut timeout = self.wake_interval;
            if let Some(deadline) = self.deadline {
                timeout = timeout.min(deadline.saturating_sub(started.elapsed()));
            }
            events.clear();
            match poller.wait(&mut events, Some(timeout)) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for ev in events.iter() {
                let i = ev.key / 2;
                if i < batch.len() && drive(&mut batch[i], &poller, &mut regs[i])? {
                    active -= 1;
                }
            }
        }

        info!("batch of {} complete", batch.len());

        for session in &batch {
            emit_stream(sink, "stdout", session.location(), session.stdout_bytes())?;
            emit_stream(sink, "stderr", session.location(), session.stderr_bytes())?;
        }
        sink.flush().map_err(Error::Io)?;

        if let Some(want) = expected {
            for session in &batch {
                if session.exit_status() != Some(want) {
                    return Err(Error::CommandFailure {
                        host: session.location().to_string(),
                        command: session.command().to_string(),
                    });
                }
            }
        }

        Ok(batch
            .iter()
            .map(|session| ExecutionResult {
                host: session.location().to_string(),
                exit_status: session.exit_status().unwrap_or(-1),
                stdout: String::from_utf8_lossy(session.stdout_bytes()).into_owned(),
                stderr: String::from_utf8_lossy(session.stderr_bytes()).into_owned(),
            })
            .collect())
    }
}

/// Drains one session as far as it will go and closes it once its exit
/// status is in. Returns true on the call that closes it.
fn drive(session: &mut Session, poller: &Poller, regs: &mut [bool; 2]) -> Result<bool> {
    if session.state() == SessionState::Closed {
        return Ok(false);
    }
    while session.drain()? {}
    if regs[0] && session.stdout_eof() {
        if let Some(fd) = session.stdout_fd() {
            poller.delete(fd)?;
        }
        regs[0] = false;
    }
    if regs[1] && session.stderr_eof() {
        if let Some(fd) = session.stderr_fd() {
            poller.delete(fd)?;
        }
        regs[1] = false;
    }
    if session.exit_status().is_some() {
        session.close()?;
        return Ok(true);
    }
    Ok(false)
}

/// Prints one captured stream as tagged lines.
///
/// A trailing newline closes the final line rather than opening an
/// empty one; interior blank lines are real output and survive.
fn emit_stream<W: Write>(sink: &mut W, stream: &str, host: &str, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(data);
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    for line in lines {
        writeln!(sink, "{stream}:{host}: {line}").map_err(Error::Io)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
