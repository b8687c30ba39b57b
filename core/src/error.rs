//! Error types for the execution engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using the muster error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine and the experiment layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or incomplete host/hostset/parameter declaration.
    #[error("{0}")]
    Configuration(String),

    /// A session's exit status did not match its expectation.
    #[error("Host {host} failed to execute {command}")]
    CommandFailure { host: String, command: String },

    /// A remote file could not be retrieved.
    #[error("Could not copy {host}:{src} -> {dst}")]
    Transfer { host: String, src: String, dst: String },

    /// The caller referenced an unknown trial, parameter, or host, or
    /// misused an operation.
    #[error("{0}")]
    Usage(String),

    /// The external merge command exited non-zero.
    #[error("merge command failed with status {status}: {command}")]
    MergeFailed { command: String, status: i32 },

    /// A batch exceeded its configured deadline.
    #[error("batch did not complete within {deadline:?}")]
    Timeout { deadline: Duration },

    /// Transport or filesystem error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_names_host_and_command() {
        let err = Error::CommandFailure {
            host: "node-1".into(),
            command: "make test".into(),
        };
        assert_eq!(err.to_string(), "Host node-1 failed to execute make test");
    }

    #[test]
    fn transfer_names_endpoints() {
        let err = Error::Transfer {
            host: "node-1".into(),
            src: "/w/out.dat".into(),
            dst: "results/out.dat".into(),
        };
        assert_eq!(
            err.to_string(),
            "Could not copy node-1:/w/out.dat -> results/out.dat"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
