//! A scripted transport for tests.
//!
//! Each expected connection is scripted ahead of time with the output
//! and exit status it should produce. The transport records every
//! connect and fetch, and hands out probes so tests can check that
//! sessions were released and shut down.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::{Connection, Transport};
use crate::error::{Error, Result};
use crate::host::HostDescriptor;

// ---------------------------------------------------------------------------
// Scripts and probes
// ---------------------------------------------------------------------------

/// The behavior one scripted connection should play back.
#[derive(Debug, Clone)]
pub struct MockScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

impl MockScript {
    pub fn new(stdout: &str, stderr: &str, exit_status: i32) -> Self {
        MockScript {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_status,
        }
    }
}

/// Observation point for one connection's lifecycle.
#[derive(Debug, Default)]
pub struct MockProbe {
    released: Cell<bool>,
    shut_down: Cell<bool>,
    read_before_release: Cell<bool>,
}

impl MockProbe {
    pub fn released(&self) -> bool {
        self.released.get()
    }

    pub fn shut_down(&self) -> bool {
        self.shut_down.get()
    }

    pub fn read_before_release(&self) -> bool {
        self.read_before_release.get()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Transport that plays back scripted connections and fetches.
#[derive(Default)]
pub struct MockTransport {
    scripts: RefCell<HashMap<String, VecDeque<MockScript>>>,
    files: RefCell<HashMap<(String, String), Vec<u8>>>,
    connects: RefCell<Vec<(String, String)>>,
    probes: RefCell<Vec<(String, Rc<MockProbe>)>>,
    fetches: RefCell<Vec<(String, String, PathBuf)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Queues a scripted connection for `location`. Connections to the
    /// same location play back in the order scripted.
    pub fn script(&self, location: &str, script: MockScript) {
        self.scripts
            .borrow_mut()
            .entry(location.to_string())
            .or_default()
            .push_back(script);
    }

    /// Declares the content of a remote file so a fetch can succeed.
    pub fn script_file(&self, location: &str, src: &str, content: &[u8]) {
        self.files
            .borrow_mut()
            .insert((location.to_string(), src.to_string()), content.to_vec());
    }

    /// Every (location, command) pair connected so far.
    pub fn connections(&self) -> Vec<(String, String)> {
        self.connects.borrow().clone()
    }

    /// Probes for every connection handed out, in connect order.
    pub fn probes(&self) -> Vec<(String, Rc<MockProbe>)> {
        self.probes.borrow().clone()
    }

    /// Every (location, src, dst) fetch recorded so far.
    pub fn fetches(&self) -> Vec<(String, String, PathBuf)> {
        self.fetches.borrow().clone()
    }
}

impl Transport for MockTransport {
    fn connect(&self, target: &HostDescriptor, command: &str) -> Result<Box<dyn Connection>> {
        self.connects
            .borrow_mut()
            .push((target.location.clone(), command.to_string()));
        let script = self
            .scripts
            .borrow_mut()
            .get_mut(&target.location)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "no scripted connection for host {}",
                    target.location
                ))
            })?;
        let probe = Rc::new(MockProbe::default());
        self.probes
            .borrow_mut()
            .push((target.location.clone(), Rc::clone(&probe)));
        Ok(Box::new(MockConnection {
            stdout: script.stdout,
            stdout_pos: 0,
            stderr: script.stderr,
            stderr_pos: 0,
            exit_status: script.exit_status,
            probe,
        }))
    }

    fn fetch(&self, target: &HostDescriptor, src: &str, dst: &Path) -> Result<()> {
        self.fetches.borrow_mut().push((
            target.location.clone(),
            src.to_string(),
            dst.to_path_buf(),
        ));
        let files = self.files.borrow();
        match files.get(&(target.location.clone(), src.to_string())) {
            Some(content) => {
                fs::write(dst, content)?;
                Ok(())
            }
            None => Err(Error::Transfer {
                host: target.location.clone(),
                src: src.to_string(),
                dst: dst.to_string_lossy().into_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct MockConnection {
    stdout: Vec<u8>,
    stdout_pos: usize,
    stderr: Vec<u8>,
    stderr_pos: usize,
    exit_status: i32,
    probe: Rc<MockProbe>,
}

fn serve(data: &[u8], pos: &mut usize, buf: &mut [u8]) -> usize {
    let remaining = &data[*pos..];
    let n = remaining.len().min(buf.len());
    buf[..n].copy_from_slice(&remaining[..n]);
    *pos += n;
    n
}

impl Connection for MockConnection {
    fn release(&mut self) -> io::Result<()> {
        self.probe.released.set(true);
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.probe.released.get() {
            self.probe.read_before_release.set(true);
        }
        Ok(serve(&self.stdout, &mut self.stdout_pos, buf))
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.probe.released.get() {
            self.probe.read_before_release.set(true);
        }
        Ok(serve(&self.stderr, &mut self.stderr_pos, buf))
    }

    fn poll_exit(&mut self) -> io::Result<Option<i32>> {
        // The exit becomes visible only once both streams are drained,
        // like a real child whose pipes close at exit.
        if self.stdout_pos == self.stdout.len() && self.stderr_pos == self.stderr.len() {
            Ok(Some(self.exit_status))
        } else {
            Ok(None)
        }
    }

    fn stdout_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn stderr_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.probe.shut_down.set(true);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_descriptor(location: &str) -> HostDescriptor {
        HostDescriptor {
            location: location.to_string(),
            username: None,
            workspace: "/w".to_string(),
            profile: None,
        }
    }

    // -- Playback tests --

    #[test]
    fn scripts_play_back_in_order() {
        let transport = MockTransport::new();
        transport.script("a", MockScript::new("first\n", "", 0));
        transport.script("a", MockScript::new("second\n", "", 0));

        let desc = make_descriptor("a");
        let mut buf = [0u8; 64];

        let mut one = transport.connect(&desc, "cmd1").unwrap();
        let n = one.read_stdout(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first\n");

        let mut two = transport.connect(&desc, "cmd2").unwrap();
        let n = two.read_stdout(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second\n");

        assert_eq!(
            transport.connections(),
            vec![
                ("a".to_string(), "cmd1".to_string()),
                ("a".to_string(), "cmd2".to_string()),
            ]
        );
    }

    #[test]
    fn unscripted_connect_fails() {
        let transport = MockTransport::new();
        let err = transport
            .connect(&make_descriptor("ghost"), "cmd")
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn exit_hidden_until_streams_drain() {
        let transport = MockTransport::new();
        transport.script("a", MockScript::new("out", "err", 7));
        let mut conn = transport.connect(&make_descriptor("a"), "cmd").unwrap();

        assert_eq!(conn.poll_exit().unwrap(), None);
        let mut buf = [0u8; 64];
        conn.read_stdout(&mut buf).unwrap();
        assert_eq!(conn.poll_exit().unwrap(), None);
        conn.read_stderr(&mut buf).unwrap();
        assert_eq!(conn.poll_exit().unwrap(), Some(7));
    }

    #[test]
    fn probe_flags_reads_before_release() {
        let transport = MockTransport::new();
        transport.script("a", MockScript::new("out", "", 0));
        let mut conn = transport.connect(&make_descriptor("a"), "cmd").unwrap();
        let mut buf = [0u8; 8];
        conn.read_stdout(&mut buf).unwrap();

        let probes = transport.probes();
        assert!(probes[0].1.read_before_release());
    }

    // -- Fetch tests --

    #[test]
    fn fetch_writes_scripted_content() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.script_file("a", "/w/out.dat", b"payload");

        let dst = dir.path().join("out.dat");
        transport
            .fetch(&make_descriptor("a"), "/w/out.dat", &dst)
            .unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(transport.fetches().len(), 1);
    }

    #[test]
    fn fetch_of_unscripted_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let err = transport
            .fetch(&make_descriptor("a"), "/w/gone", &dir.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, Error::Transfer { .. }));
    }
}
