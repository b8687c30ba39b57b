//! The ssh transport.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use super::process::ProcessConnection;
use super::{Connection, Transport};
use crate::error::{Error, Result};
use crate::host::HostDescriptor;

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
];

/// Runs commands over ssh and fetches files over scp.
///
/// Authentication is non-interactive; targets must be reachable with
/// the invoking user's keys or per-host ssh configuration.
#[derive(Debug, Default)]
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        SshTransport
    }
}

fn ssh_argv(target: &HostDescriptor, command: &str) -> Vec<String> {
    let mut argv = vec!["ssh".to_string()];
    argv.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    argv.push(target.remote_target());
    argv.push(command.to_string());
    argv
}

fn scp_argv(target: &HostDescriptor, src: &str, dst: &Path) -> Vec<String> {
    let mut argv = vec!["scp".to_string(), "-q".to_string()];
    argv.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
    argv.push(format!("{}:{}", target.remote_target(), src));
    argv.push(dst.to_string_lossy().into_owned());
    argv
}

impl Transport for SshTransport {
    fn connect(&self, target: &HostDescriptor, command: &str) -> Result<Box<dyn Connection>> {
        let argv = ssh_argv(target, command);
        debug!("spawning {}", argv.join(" "));
        Ok(Box::new(ProcessConnection::spawn(&argv)?))
    }

    fn fetch(&self, target: &HostDescriptor, src: &str, dst: &Path) -> Result<()> {
        let argv = scp_argv(target, src, dst);
        debug!("spawning {}", argv.join(" "));
        let output = Command::new(&argv[0]).args(&argv[1..]).output()?;
        if !output.status.success() {
            debug!("scp stderr: {}", String::from_utf8_lossy(&output.stderr));
            return Err(Error::Transfer {
                host: target.location.clone(),
                src: src.to_string(),
                dst: dst.to_string_lossy().into_owned(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_descriptor(username: Option<&str>) -> HostDescriptor {
        HostDescriptor {
            location: "node-1.example.com".to_string(),
            username: username.map(|s| s.to_string()),
            workspace: "/var/tmp/work".to_string(),
            profile: None,
        }
    }

    // -- Argument vector tests --

    #[test]
    fn ssh_argv_places_target_before_command() {
        let argv = ssh_argv(&make_descriptor(None), "echo hi");
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "node-1.example.com",
                "echo hi",
            ]
        );
    }

    #[test]
    fn ssh_argv_applies_username() {
        let argv = ssh_argv(&make_descriptor(Some("alice")), "true");
        assert!(argv.contains(&"alice@node-1.example.com".to_string()));
    }

    #[test]
    fn scp_argv_forms_remote_path() {
        let argv = scp_argv(
            &make_descriptor(Some("alice")),
            "/var/tmp/work/out.dat",
            Path::new("results/out.dat"),
        );
        assert_eq!(
            argv,
            vec![
                "scp",
                "-q",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "alice@node-1.example.com:/var/tmp/work/out.dat",
                "results/out.dat",
            ]
        );
    }
}
