//! Hosts and host sets.
//!
//! A host binds a descriptor to a transport and runs one command at a
//! time on it. A host set fans a command out across its members, or
//! spreads indexed invocations over them round robin, and gathers
//! per-member result files back into one merged output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mux::{ExecutionResult, Multiplexer};
use crate::session::Session;
use crate::token::{self, CommandToken};
use crate::transfer;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Where and how to reach one execution target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    /// Network location, e.g. a hostname the transport understands.
    pub location: String,
    /// Login user; the transport's default user when absent.
    pub username: Option<String>,
    /// Directory commands run in.
    pub workspace: String,
    /// Shell profile sourced before each command.
    pub profile: Option<String>,
}

impl HostDescriptor {
    /// The location as the transport addresses it.
    pub fn remote_target(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}", self.location),
            None => self.location.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// A single named execution target.
pub struct Host {
    name: String,
    descriptor: HostDescriptor,
    transport: Arc<dyn Transport>,
}

impl Host {
    pub fn new(name: &str, descriptor: HostDescriptor, transport: Arc<dyn Transport>) -> Host {
        Host {
            name: name.to_string(),
            descriptor,
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &HostDescriptor {
        &self.descriptor
    }

    /// Runs a command on this host, printing its output when done.
    ///
    /// With `expected` set, a differing exit status is an error.
    pub fn run(&self, tokens: &[CommandToken], expected: Option<i32>) -> Result<()> {
        let command = token::render(tokens)?;
        info!("run on {}: {}", self.name, command);
        let session = Session::open(self.transport.as_ref(), self.descriptor.clone(), &command)?;
        Multiplexer::new().run(vec![session], expected)?;
        Ok(())
    }

    /// Copies one file from this host into `output_dir`.
    ///
    /// The remote name defaults to `output` itself; pass `source` to
    /// fetch under a different name.
    pub fn collect(&self, output_dir: &Path, output: &str, source: Option<&str>) -> Result<()> {
        let src = source.unwrap_or(output);
        info!("collect {} from {}", src, self.name);
        transfer::fetch(
            self.transport.as_ref(),
            &self.descriptor,
            src,
            &output_dir.join(output),
        )
    }
}

// ---------------------------------------------------------------------------
// Host sets
// ---------------------------------------------------------------------------

const DEFAULT_MERGE: &[&str] = &["muster", "merge"];

/// A named group of interchangeable execution targets.
pub struct HostSet {
    name: String,
    members: Vec<HostDescriptor>,
    transport: Arc<dyn Transport>,
}

impl HostSet {
    pub fn new(
        name: &str,
        members: Vec<HostDescriptor>,
        transport: Arc<dyn Transport>,
    ) -> Result<HostSet> {
        if members.is_empty() {
            return Err(Error::Configuration(format!(
                "host set {name} has no members"
            )));
        }
        Ok(HostSet {
            name: name.to_string(),
            members,
            transport,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[HostDescriptor] {
        &self.members
    }

    /// Runs the same command on every member concurrently.
    pub fn run(
        &self,
        tokens: &[CommandToken],
        expected: Option<i32>,
    ) -> Result<Vec<ExecutionResult>> {
        let command = token::render(tokens)?;
        info!(
            "run on all {} members of {}: {}",
            self.members.len(),
            self.name,
            command
        );
        let mut batch = Vec::with_capacity(self.members.len());
        for member in &self.members {
            batch.push(Session::open(
                self.transport.as_ref(),
                member.clone(),
                &command,
            )?);
        }
        Multiplexer::new().run(batch, expected)
    }

    /// Runs indexed invocations spread over the members round robin.
    ///
    /// `count` defaults to the member count. A predicate restricts
    /// which indices actually run; skipped indices still occupy their
    /// round-robin slot.
    pub fn run_many(
        &self,
        tokens: &[CommandToken],
        expected: Option<i32>,
        count: Option<usize>,
        predicate: Option<&dyn Fn(usize) -> bool>,
    ) -> Result<Vec<ExecutionResult>> {
        let count = count.unwrap_or(self.members.len());
        let pretty: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
        info!(
            "run {} indexed invocations on {}: {}",
            count,
            self.name,
            pretty.join(" ")
        );
        let mut batch = Vec::with_capacity(count);
        for index in 0..count {
            if let Some(predicate) = predicate {
                if !predicate(index) {
                    continue;
                }
            }
            let command = token::render_indexed(tokens, index);
            let member = &self.members[index % self.members.len()];
            batch.push(Session::open(
                self.transport.as_ref(),
                member.clone(),
                &command,
            )?);
        }
        Multiplexer::new().run(batch, expected)
    }

    /// Gathers per-index result files and merges them into one output.
    ///
    /// Piece `i` is fetched from the member that ran index `i`. Pieces
    /// land in a scratch directory that is removed however the merge
    /// ends. The merge command receives `--output <dest>` followed by
    /// the staged pieces in index order.
    pub fn collect(
        &self,
        output_dir: &Path,
        output: &str,
        source: Option<&CommandToken>,
        merge: Option<&[String]>,
        count: Option<usize>,
    ) -> Result<()> {
        let count = count.unwrap_or(self.members.len());
        let dest = output_dir.join(output);
        info!("collect {} pieces of {} from {}", count, output, self.name);

        let scratch = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(output_dir)?;
        let mut files = Vec::with_capacity(count);
        for index in 0..count {
            let member = &self.members[index % self.members.len()];
            let src = match source {
                Some(token) => token.resolve_value(index),
                None => output.to_string(),
            };
            let dst = scratch.path().join(format!("{index}-{output}"));
            transfer::fetch(self.transport.as_ref(), member, &src, &dst)?;
            files.push(dst);
        }

        let argv = merge_argv(merge, &dest, &files);
        debug!("merging: {}", argv.join(" "));
        let status = Command::new(&argv[0]).args(&argv[1..]).status()?;
        if !status.success() {
            return Err(Error::MergeFailed {
                command: argv.join(" "),
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for HostSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSet")
            .field("name", &self.name)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

fn merge_argv(merge: Option<&[String]>, dest: &Path, files: &[PathBuf]) -> Vec<String> {
    let mut argv: Vec<String> = match merge {
        Some(custom) if !custom.is_empty() => custom.to_vec(),
        _ => DEFAULT_MERGE.iter().map(|s| s.to_string()).collect(),
    };
    argv.push("--output".to_string());
    argv.push(dest.to_string_lossy().into_owned());
    argv.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
    argv
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
