//! Fleet command execution for experiments.
//!
//! The engine runs shell commands concurrently across a fleet of
//! hosts, gathers their output and result files, and wraps the whole
//! thing in a declarative experiment layer with reproducible output
//! directories.
//!
//! The layers, bottom up:
//!
//! - [`token`]: command token sequences and shell-safe rendering.
//! - [`transport`]: how commands reach a target (ssh, local, mock).
//! - [`session`]: one armed command on one host, drained without
//!   blocking.
//! - [`mux`]: drives a batch of sessions to completion and prints
//!   their output grouped per host.
//! - [`host`]: named hosts and round-robin host sets.
//! - [`experiment`] and [`driver`]: declarations, configuration, and
//!   the shared command line for experiment binaries.
//!
//! An experiment binary is a few declarations plus [`driver::main`]:
//!
//! ```no_run
//! use muster_core::{driver, Experiment, Parameter};
//!
//! fn main() -> std::process::ExitCode {
//!     let mut experiment = Experiment::new("results/sort-bench");
//!     experiment
//!         .parameter("size", Parameter::int(1_000_000))
//!         .declare_host_set("pool")
//!         .trial("bench", |ctx| {
//!             let pool = ctx.host_set("pool")?;
//!             pool.run(&["make".into(), "bench".into()], Some(0))?;
//!             Ok(())
//!         });
//!     driver::main(experiment)
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod experiment;
pub mod host;
pub mod merge;
pub mod mux;
pub mod session;
pub mod token;
pub mod transfer;
pub mod transport;

pub use config::Configuration;
pub use error::{Error, Result};
pub use experiment::{Experiment, ParamValue, Parameter, RunOptions, TrialContext};
pub use host::{Host, HostDescriptor, HostSet};
pub use mux::{ExecutionResult, Multiplexer};
pub use session::{Session, SessionState};
pub use token::CommandToken;
pub use transport::{LocalTransport, SshTransport, Transport};
