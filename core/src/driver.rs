//! Command line driver for experiment binaries.
//!
//! An experiment binary declares its experiment and hands it to
//! [`main`]; everything else, argument parsing, configuration,
//! trial scheduling, logging, is shared. The `run` subcommand runs
//! trials against a configuration file and `configure` prints a
//! template configuration to fill in.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::experiment::{Experiment, RunOptions};
use crate::transport::{SshTransport, Transport};

#[derive(Parser)]
#[command(about = "Run experiment trials across a host fleet")]
pub struct ExperimentCli {
    #[command(subcommand)]
    command: ExperimentCommand,
}

#[derive(Subcommand)]
enum ExperimentCommand {
    /// Run trials against a configuration file.
    Run(RunArgs),
    /// Print a configuration template for this experiment.
    Configure,
}

#[derive(Args)]
pub struct RunArgs {
    /// Override a parameter.
    #[arg(short = 'p', long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Override an environment variable.
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE")]
    pub envs: Vec<String>,

    /// Label this run so repeats of a trial land side by side.
    #[arg(long)]
    pub name: Option<String>,

    /// Replace existing results instead of refusing to run.
    #[arg(long)]
    pub overwrite: bool,

    /// Configuration file to run against.
    pub configuration: PathBuf,

    /// Trials to run, in order.
    #[arg(required = true)]
    pub trials: Vec<String>,
}

/// Entry point for experiment binaries.
pub fn main(experiment: Experiment) -> ExitCode {
    init_logging();
    let cli = ExperimentCli::parse();
    let outcome = match cli.command {
        ExperimentCommand::Run(args) => run(experiment, &args, Arc::new(SshTransport::new())),
        ExperimentCommand::Configure => {
            print!("{}", configure(&experiment));
            Ok(())
        }
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Configures the experiment and runs the requested trials in order.
///
/// Trial names and result collisions are checked up front, so a bad
/// third trial is caught before the first one runs.
pub fn run(
    mut experiment: Experiment,
    args: &RunArgs,
    transport: Arc<dyn Transport>,
) -> Result<()> {
    let mut config = Configuration::load(&args.configuration)?;
    experiment.configure(&mut config, &args.params, &args.envs, transport)?;
    let options = RunOptions {
        name: args.name.clone(),
        overwrite: args.overwrite,
        work_dir: None,
    };

    for trial in &args.trials {
        if !experiment.has_trial(trial) {
            return Err(Error::Usage(format!("Experiment has no trial {trial}")));
        }
        let out = experiment.output_dir(trial, options.name.as_deref());
        if !experiment.is_utility(trial) && out.exists() && !options.overwrite {
            return Err(Error::Usage(format!(
                "Experiment already run.  To run, erase:\n{}",
                out.display()
            )));
        }
    }

    for trial in &args.trials {
        experiment.run_trial(trial, &config, &options)?;
    }
    Ok(())
}

/// Renders a configuration template with every declared knob.
pub fn configure(experiment: &Experiment) -> String {
    let mut config = Configuration::new();
    for (name, value) in experiment.parameters() {
        config.set("parameters", name, &value.to_string());
    }
    for (name, value) in experiment.envvars() {
        config.set("envvars", name, &value.to_string());
    }
    for name in experiment.host_names() {
        config.set("hosts", &format!("{name}.location"), "<location>");
        config.set("hosts", &format!("{name}.username"), "");
        config.set("hosts", &format!("{name}.workspace"), "<workspace>");
        config.set("hosts", &format!("{name}.profile"), "");
    }
    for name in experiment.host_set_names() {
        config.set("hosts", &format!("{name}.number"), "1");
        config.set("hosts", &format!("{name}.location"), "<default location>");
        config.set("hosts", &format!("{name}.username"), "");
        config.set("hosts", &format!("{name}.workspace"), "<default workspace>");
        config.set("hosts", &format!("{name}.profile"), "");
        config.set("hosts", &format!("{name}[0].location"), "<member location>");
    }
    config.render()
}

/// Structured logging to stderr, `RUST_LOG` controlled, info default.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Parameter;
    use crate::transport::LocalTransport;
    use std::cell::Cell;
    use std::fs;
    use std::rc::Rc;

    fn make_run_args(configuration: PathBuf, trials: &[&str]) -> RunArgs {
        RunArgs {
            params: Vec::new(),
            envs: Vec::new(),
            name: None,
            overwrite: false,
            configuration,
            trials: trials.iter().map(|t| t.to_string()).collect(),
        }
    }

    // -- Parse tests --

    #[test]
    fn run_arguments_parse() {
        let cli = ExperimentCli::try_parse_from([
            "bench",
            "run",
            "-p",
            "size=3",
            "--env",
            "path=/opt",
            "--overwrite",
            "cluster.ini",
            "first",
            "second",
        ])
        .unwrap();
        match cli.command {
            ExperimentCommand::Run(args) => {
                assert_eq!(args.params, vec!["size=3"]);
                assert_eq!(args.envs, vec!["path=/opt"]);
                assert!(args.overwrite);
                assert_eq!(args.configuration, PathBuf::from("cluster.ini"));
                assert_eq!(args.trials, vec!["first", "second"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_trial() {
        assert!(ExperimentCli::try_parse_from(["bench", "run", "cluster.ini"]).is_err());
    }

    #[test]
    fn configure_subcommand_parses() {
        let cli = ExperimentCli::try_parse_from(["bench", "configure"]).unwrap();
        assert!(matches!(cli.command, ExperimentCommand::Configure));
    }

    // -- Template tests --

    #[test]
    fn template_covers_every_declaration() {
        let mut exp = Experiment::new("results");
        exp.parameter("size", Parameter::int(10))
            .envvar("data", Parameter::text("/data"))
            .declare_host("node")
            .declare_host_set("pool");

        let template = configure(&exp);

        assert!(template.contains("[parameters]"));
        assert!(template.contains("size = 10"));
        assert!(template.contains("data = /data"));
        assert!(template.contains("node.location = <location>"));
        assert!(template.contains("node.workspace = <workspace>"));
        assert!(template.contains("pool.number = 1"));
        assert!(template.contains("pool[0].location = <member location>"));
    }

    #[test]
    fn template_parses_back() {
        let mut exp = Experiment::new("results");
        exp.parameter("size", Parameter::int(10)).declare_host("node");
        assert!(Configuration::parse(&configure(&exp)).is_ok());
    }

    // -- Run tests --

    #[test]
    fn run_checks_trial_names_before_running_any() {
        let root = tempfile::tempdir().unwrap();
        let config_path = root.path().join("config");
        fs::write(&config_path, "").unwrap();

        let ran = Rc::new(Cell::new(0));
        let seen = ran.clone();
        let mut exp = Experiment::new(root.path().join("out").to_str().unwrap());
        exp.trial("bench", move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });

        let args = make_run_args(config_path, &["bench", "nope"]);
        let err = run(exp, &args, Arc::new(LocalTransport::new())).unwrap_err();

        assert_eq!(err.to_string(), "Experiment has no trial nope");
        assert_eq!(ran.get(), 0);
    }

    #[test]
    fn run_executes_trials_in_order() {
        let root = tempfile::tempdir().unwrap();
        let config_path = root.path().join("config");
        fs::write(&config_path, "[parameters]\nsize = 5\n").unwrap();

        let mut exp = Experiment::new(root.path().join("out").to_str().unwrap());
        exp.parameter("size", Parameter::int(1));
        exp.trial("bench", |ctx| {
            let size = ctx.parameter("size")?.as_int()?;
            fs::write(ctx.output().join("out.dat"), size.to_string())?;
            Ok(())
        });
        let out_dir = {
            let mut probe = Experiment::new(root.path().join("out").to_str().unwrap());
            probe.parameter("size", Parameter::int(5));
            probe.output_dir("bench", None)
        };

        let args = make_run_args(config_path, &["bench"]);
        run(exp, &args, Arc::new(LocalTransport::new())).unwrap();

        assert_eq!(fs::read_to_string(out_dir.join("out.dat")).unwrap(), "5");
    }

    #[test]
    fn run_refuses_existing_results_up_front() {
        let root = tempfile::tempdir().unwrap();
        let config_path = root.path().join("config");
        fs::write(&config_path, "").unwrap();
        let out = root.path().join("out").to_str().unwrap().to_string();

        let first_ran = Rc::new(Cell::new(0));
        let seen = first_ran.clone();
        let mut exp = Experiment::new(&out);
        exp.trial("bench", move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        let args = make_run_args(config_path.clone(), &["bench"]);
        run(exp, &args, Arc::new(LocalTransport::new())).unwrap();
        assert_eq!(first_ran.get(), 1);

        let second_ran = Rc::new(Cell::new(0));
        let seen = second_ran.clone();
        let mut again = Experiment::new(&out);
        again.trial("bench", move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });
        let args = make_run_args(config_path, &["bench"]);
        let err = run(again, &args, Arc::new(LocalTransport::new())).unwrap_err();

        assert!(err.to_string().starts_with("Experiment already run."));
        assert_eq!(second_ran.get(), 0);
    }
}
