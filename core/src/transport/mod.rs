//! Connection transports.
//!
//! A transport knows how to start a framed command on a target host
//! and how to retrieve files from it. The engine only sees the
//! [`Transport`] and [`Connection`] traits, so sessions run the same
//! way over ssh, against the local machine, or against a scripted
//! mock in tests.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::Path;

use crate::error::Result;
use crate::host::HostDescriptor;

pub mod local;
pub mod mock;
mod process;
pub mod ssh;

pub use local::LocalTransport;
pub use mock::{MockProbe, MockScript, MockTransport};
pub use ssh::SshTransport;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Starts commands and retrieves files on a class of targets.
pub trait Transport {
    /// Launches `command` on the target and returns the live connection.
    ///
    /// The command must not begin executing until the connection is
    /// released.
    fn connect(&self, target: &HostDescriptor, command: &str) -> Result<Box<dyn Connection>>;

    /// Copies the remote file `src` to the local path `dst`.
    fn fetch(&self, target: &HostDescriptor, src: &str, dst: &Path) -> Result<()>;
}

/// One live command execution.
///
/// Both output streams must be readable without blocking; a read that
/// would block returns [`io::ErrorKind::WouldBlock`].
pub trait Connection {
    /// Signals the armed command to begin executing.
    fn release(&mut self) -> io::Result<()>;

    /// Reads available standard output, `Ok(0)` once the stream closed.
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads available standard error, `Ok(0)` once the stream closed.
    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Returns the exit status if the command has finished.
    fn poll_exit(&mut self) -> io::Result<Option<i32>>;

    /// Standard output descriptor for readiness polling, if any.
    fn stdout_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Standard error descriptor for readiness polling, if any.
    fn stderr_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Tears the connection down, ending the command if still running.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection(..)")
    }
}
