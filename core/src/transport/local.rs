//! The local transport.
//!
//! Runs commands on the invoking machine through `sh -c`. Useful for
//! single-machine experiments and for exercising the engine against
//! real processes in tests.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use super::process::ProcessConnection;
use super::{Connection, Transport};
use crate::error::{Error, Result};
use crate::host::HostDescriptor;

#[derive(Debug, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        LocalTransport
    }
}

impl Transport for LocalTransport {
    fn connect(&self, _target: &HostDescriptor, command: &str) -> Result<Box<dyn Connection>> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        debug!("spawning {}", argv.join(" "));
        Ok(Box::new(ProcessConnection::spawn(&argv)?))
    }

    fn fetch(&self, target: &HostDescriptor, src: &str, dst: &Path) -> Result<()> {
        match fs::copy(src, dst) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Transfer {
                host: target.location.clone(),
                src: src.to_string(),
                dst: dst.to_string_lossy().into_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
