//! Fleet-side companion tool for experiment binaries.
//!
//! # Usage
//!
//! ```text
//! muster merge -o merged.dat pieces/0-out.dat pieces/1-out.dat
//! muster merge --force -o merged.dat pieces/*.dat
//! ```
//!
//! Experiments themselves are binaries that link the core crate and
//! call its driver; this tool carries the shared plumbing they shell
//! out to, most importantly the default merge step of host set
//! collection.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use muster_core::driver;
use muster_core::merge::{merge_files, DEFAULT_MERGE_OUTPUT};

#[derive(Parser)]
#[command(name = "muster", about = "Fleet experiment companion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge sorted result files into one sorted output.
    Merge(MergeArgs),
}

#[derive(Args)]
struct MergeArgs {
    /// Where the merged output goes.
    #[arg(short = 'o', long, default_value = DEFAULT_MERGE_OUTPUT)]
    output: PathBuf,

    /// Overwrite the output if it already exists.
    #[arg(short = 'f', long)]
    force: bool,

    /// Sorted input files.
    inputs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    driver::init_logging();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Merge(args) => merge_files(&args.inputs, &args.output, args.force),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("muster: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_arguments_parse() {
        let cli = Cli::try_parse_from([
            "muster", "merge", "-o", "all.dat", "--force", "0-out.dat", "1-out.dat",
        ])
        .unwrap();
        let Command::Merge(args) = cli.command;
        assert_eq!(args.output, PathBuf::from("all.dat"));
        assert!(args.force);
        assert_eq!(
            args.inputs,
            vec![PathBuf::from("0-out.dat"), PathBuf::from("1-out.dat")]
        );
    }

    #[test]
    fn merge_output_defaults() {
        let cli = Cli::try_parse_from(["muster", "merge", "in.dat"]).unwrap();
        let Command::Merge(args) = cli.command;
        assert_eq!(args.output, PathBuf::from(DEFAULT_MERGE_OUTPUT));
        assert!(!args.force);
    }
}
