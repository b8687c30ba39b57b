//! Child-process plumbing shared by the ssh and local transports.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use super::Connection;

/// Places a descriptor in non-blocking mode.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: the fd belongs to a pipe handle owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A command connection backed by a local child process.
///
/// Both ssh sessions and local sessions reduce to this: a child with
/// piped stdio whose output pipes are non-blocking, and whose stdin
/// carries the release handshake.
#[derive(Debug)]
pub struct ProcessConnection {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl ProcessConnection {
    /// Spawns `argv` with all three stdio streams piped.
    pub fn spawn(argv: &[String]) -> io::Result<ProcessConnection> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty command line")
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // The pipes are guaranteed present because all three were piped.
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stderr missing"))?;

        set_nonblocking(stdout.as_raw_fd())?;
        set_nonblocking(stderr.as_raw_fd())?;

        Ok(ProcessConnection {
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

impl Connection for ProcessConnection {
    fn release(&mut self) -> io::Result<()> {
        // Writing the newline satisfies the read gate in the framed
        // command; closing stdin afterwards means an armed command can
        // never be released twice.
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(b"\n")?;
            stdin.flush()?;
        }
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stderr.read(buf)
    }

    fn poll_exit(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn stdout_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.stdout.as_fd())
    }

    fn stderr_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.stderr.as_fd())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.stdin.take();
        let _ = self.child.kill();
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        // A connection dropped without shutdown still may not leave the
        // child behind.
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
