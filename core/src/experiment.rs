//! Experiment declaration, configuration, and trial runs.
//!
//! An experiment declares its parameters, environment variables,
//! hosts, host sets, and trials up front. Configuration then binds
//! the declarations to concrete values from an INI file with command
//! line overrides on top. A trial runs inside a staging directory and
//! its results are promoted into the experiment's output tree only
//! when it succeeds end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::host::{Host, HostDescriptor, HostSet};
use crate::token::CommandToken;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// The value of a parameter or environment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A typed experimental parameter.
///
/// The declared default fixes the type; configured values are cast to
/// it, so an integer parameter can never silently become a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameter {
    value: ParamValue,
}

impl Parameter {
    pub fn int(value: i64) -> Parameter {
        Parameter {
            value: ParamValue::Int(value),
        }
    }

    pub fn float(value: f64) -> Parameter {
        Parameter {
            value: ParamValue::Float(value),
        }
    }

    pub fn text(value: impl Into<String>) -> Parameter {
        Parameter {
            value: ParamValue::Str(value.into()),
        }
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    pub fn as_int(&self) -> Result<i64> {
        match self.value {
            ParamValue::Int(i) => Ok(i),
            _ => Err(Error::Usage(format!(
                "parameter value {self} is not an integer"
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self.value {
            ParamValue::Int(i) => Ok(i as f64),
            ParamValue::Float(x) => Ok(x),
            ParamValue::Str(_) => Err(Error::Usage(format!(
                "parameter value {self} is not a number"
            ))),
        }
    }

    /// Casts a configured string to this parameter's type.
    pub fn cast(&self, raw: &str) -> Result<Parameter> {
        match self.value {
            ParamValue::Int(_) => raw
                .parse::<i64>()
                .map(Parameter::int)
                .map_err(|_| {
                    Error::Configuration(format!("invalid integer parameter value '{raw}'"))
                }),
            ParamValue::Float(_) => raw
                .parse::<f64>()
                .map(Parameter::float)
                .map_err(|_| {
                    Error::Configuration(format!("invalid float parameter value '{raw}'"))
                }),
            ParamValue::Str(_) => Ok(Parameter::text(raw)),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&Parameter> for CommandToken {
    fn from(param: &Parameter) -> CommandToken {
        CommandToken::literal(param.to_string())
    }
}

// ---------------------------------------------------------------------------
// Trials
// ---------------------------------------------------------------------------

/// What a trial gets to work with while it runs.
pub struct TrialContext<'a> {
    output: &'a Path,
    experiment: &'a Experiment,
}

impl<'a> TrialContext<'a> {
    /// Staging directory the trial writes its results into.
    pub fn output(&self) -> &Path {
        self.output
    }

    pub fn parameter(&self, name: &str) -> Result<&'a Parameter> {
        self.experiment.parameters.get(name).ok_or_else(|| {
            Error::Usage(format!("Experiment has no parameter {name}"))
        })
    }

    pub fn envvar(&self, name: &str) -> Result<&'a Parameter> {
        self.experiment.envvars.get(name).ok_or_else(|| {
            Error::Usage(format!("Experiment has no environment variable {name}"))
        })
    }

    pub fn host(&self, name: &str) -> Result<&'a Host> {
        self.experiment
            .host(name)
            .ok_or_else(|| Error::Usage(format!("Experiment has no host {name}")))
    }

    pub fn host_set(&self, name: &str) -> Result<&'a HostSet> {
        self.experiment
            .host_set(name)
            .ok_or_else(|| Error::Usage(format!("Experiment has no host set {name}")))
    }
}

type TrialFn = Box<dyn Fn(&TrialContext) -> Result<()>>;

struct Trial {
    run: TrialFn,
    utility: bool,
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// Options for one trial run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Distinguishes repeated runs of the same trial.
    pub name: Option<String>,
    /// Replace existing results instead of refusing to run.
    pub overwrite: bool,
    /// Where staging directories are created. Defaults to the
    /// experiment's output root, which keeps staging and results on
    /// one filesystem so promotion stays a single rename.
    pub work_dir: Option<PathBuf>,
}

/// A declared experiment.
pub struct Experiment {
    path: String,
    parameters: BTreeMap<String, Parameter>,
    envvars: BTreeMap<String, Parameter>,
    host_names: BTreeSet<String>,
    host_set_names: BTreeSet<String>,
    hosts: BTreeMap<String, Host>,
    host_sets: BTreeMap<String, HostSet>,
    trials: BTreeMap<String, Trial>,
}

impl Experiment {
    /// Declares an experiment whose results live under `path`.
    pub fn new(path: impl Into<String>) -> Experiment {
        Experiment {
            path: path.into(),
            parameters: BTreeMap::new(),
            envvars: BTreeMap::new(),
            host_names: BTreeSet::new(),
            host_set_names: BTreeSet::new(),
            hosts: BTreeMap::new(),
            host_sets: BTreeMap::new(),
            trials: BTreeMap::new(),
        }
    }

    // -- Declaration --

    pub fn parameter(&mut self, name: &str, default: Parameter) -> &mut Self {
        self.parameters.insert(name.to_string(), default);
        self
    }

    pub fn envvar(&mut self, name: &str, default: Parameter) -> &mut Self {
        self.envvars.insert(name.to_string(), default);
        self
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn declare_host(&mut self, name: &str) -> &mut Self {
        self.host_names.insert(name.to_string());
        self
    }

    pub fn host_set(&self, name: &str) -> Option<&HostSet> {
        self.host_sets.get(name)
    }

    pub fn declare_host_set(&mut self, name: &str) -> &mut Self {
        self.host_set_names.insert(name.to_string());
        self
    }

    /// Declares a trial whose results are kept.
    pub fn trial<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&TrialContext) -> Result<()> + 'static,
    {
        self.trials.insert(
            name.to_string(),
            Trial {
                run: Box::new(f),
                utility: false,
            },
        );
        self
    }

    /// Declares a utility trial; it runs like any other but its
    /// staging directory is discarded instead of promoted.
    pub fn utility<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&TrialContext) -> Result<()> + 'static,
    {
        self.trials.insert(
            name.to_string(),
            Trial {
                run: Box::new(f),
                utility: true,
            },
        );
        self
    }

    // -- Accessors --

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &BTreeMap<String, Parameter> {
        &self.parameters
    }

    pub fn envvars(&self) -> &BTreeMap<String, Parameter> {
        &self.envvars
    }

    pub fn host_names(&self) -> &BTreeSet<String> {
        &self.host_names
    }

    pub fn host_set_names(&self) -> &BTreeSet<String> {
        &self.host_set_names
    }

    pub fn has_trial(&self, name: &str) -> bool {
        self.trials.contains_key(name)
    }

    pub fn is_utility(&self, name: &str) -> bool {
        self.trials.get(name).map(|t| t.utility).unwrap_or(false)
    }

    /// `name=value` pairs of every parameter, sorted, comma joined.
    /// One point in parameter space maps to exactly one such string.
    pub fn parameter_string(&self) -> String {
        let parts: Vec<String> = self
            .parameters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        parts.join(",")
    }

    /// Where a trial's promoted results land.
    pub fn output_dir(&self, trial: &str, name: Option<&str>) -> PathBuf {
        let leaf = match name {
            Some(name) => format!("{trial}-{name}"),
            None => trial.to_string(),
        };
        Path::new(&self.path).join(self.parameter_string()).join(leaf)
    }

    // -- Configuration --

    /// Binds declarations to the configuration, with command line
    /// overrides applied after the file. Effective parameter and
    /// environment variable values are written back into `config` so
    /// the saved copy reflects what actually ran.
    pub fn configure(
        &mut self,
        config: &mut Configuration,
        params: &[String],
        envs: &[String],
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        apply_values(&mut self.parameters, config, "parameters", params, "parameter")?;
        apply_values(&mut self.envvars, config, "envvars", envs, "environment variable")?;

        for name in self.host_names.clone() {
            let options = config.host_options(&name);
            let descriptor = descriptor_from_options(&name, &options)?;
            self.hosts
                .insert(name.clone(), Host::new(&name, descriptor, transport.clone()));
        }

        for name in self.host_set_names.clone() {
            let options = config.host_options(&name);
            let raw = options.get("number").ok_or_else(|| {
                Error::Configuration(format!("Host {name} missing option number"))
            })?;
            let number: usize = raw.parse().map_err(|_| {
                Error::Configuration(format!("host set {name} has invalid member count '{raw}'"))
            })?;
            if number == 0 {
                return Err(Error::Configuration(format!(
                    "host set {name} has no members"
                )));
            }
            let mut defaults = options.clone();
            defaults.remove("number");
            let mut members = Vec::with_capacity(number);
            for index in 0..number {
                let member_name = format!("{name}[{index}]");
                let mut member_options = defaults.clone();
                member_options.extend(config.host_options(&member_name));
                members.push(descriptor_from_options(&member_name, &member_options)?);
            }
            self.host_sets.insert(
                name.clone(),
                HostSet::new(&name, members, transport.clone())?,
            );
        }

        for (name, value) in &self.parameters {
            config.set("parameters", name, &value.to_string());
        }
        for (name, value) in &self.envvars {
            config.set("envvars", name, &value.to_string());
        }
        Ok(())
    }

    // -- Running --

    /// Runs one trial against the configured experiment.
    ///
    /// The trial works inside a fresh staging directory. On success
    /// the staging directory, including the saved configuration and
    /// the run manifest, becomes the trial's output directory in one
    /// rename. On failure, and always for utility trials, staging is
    /// removed and the output tree is untouched.
    pub fn run_trial(
        &self,
        trial_name: &str,
        config: &Configuration,
        options: &RunOptions,
    ) -> Result<()> {
        let trial = self
            .trials
            .get(trial_name)
            .ok_or_else(|| Error::Usage(format!("Experiment has no trial {trial_name}")))?;
        let final_dir = self.output_dir(trial_name, options.name.as_deref());
        if !trial.utility && final_dir.exists() && !options.overwrite {
            return Err(Error::Usage(format!(
                "Experiment already run.  To run, erase:\n{}",
                final_dir.display()
            )));
        }

        let started_ms = now_ms();
        info!("trial {trial_name} begins");
        let work_dir = match &options.work_dir {
            Some(dir) => dir.clone(),
            None => {
                let root = PathBuf::from(&self.path);
                fs::create_dir_all(&root)?;
                root
            }
        };
        let staging = tempfile::Builder::new()
            .prefix("muster-")
            .tempdir_in(&work_dir)?;
        let ctx = TrialContext {
            output: staging.path(),
            experiment: self,
        };
        (trial.run)(&ctx)?;
        let completed_ms = now_ms();

        if trial.utility {
            info!("utility trial {trial_name} complete");
            return Ok(());
        }

        config.save(&staging.path().join("config"))?;
        let manifest = Manifest {
            experiment: &self.path,
            trial: trial_name,
            name: options.name.as_deref(),
            parameters: &self.parameters,
            envvars: &self.envvars,
            hosts: self
                .hosts
                .iter()
                .map(|(name, host)| (name.as_str(), host.descriptor()))
                .collect(),
            host_sets: self
                .host_sets
                .iter()
                .map(|(name, set)| (name.as_str(), set.members()))
                .collect(),
            started_ms,
            completed_ms,
        };
        let json = serde_json::to_string_pretty(&manifest).map_err(io::Error::from)?;
        fs::write(staging.path().join("manifest.json"), json)?;

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if final_dir.exists() {
            // Only reachable with overwrite set; checked above.
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(staging.path(), &final_dir)?;
        drop(staging);
        info!("trial {trial_name} complete: {}", final_dir.display());
        Ok(())
    }
}

/// Everything recorded about one promoted trial run.
#[derive(Serialize)]
struct Manifest<'a> {
    experiment: &'a str,
    trial: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    parameters: &'a BTreeMap<String, Parameter>,
    envvars: &'a BTreeMap<String, Parameter>,
    hosts: BTreeMap<&'a str, &'a HostDescriptor>,
    host_sets: BTreeMap<&'a str, &'a [HostDescriptor]>,
    started_ms: u128,
    completed_ms: u128,
}

fn apply_values(
    values: &mut BTreeMap<String, Parameter>,
    config: &Configuration,
    section: &str,
    overrides: &[String],
    kind: &str,
) -> Result<()> {
    let names: Vec<String> = values.keys().cloned().collect();
    for name in names {
        if let Some(raw) = config.get(section, &name) {
            let cast = values[&name].cast(raw)?;
            values.insert(name, cast);
        }
    }
    for assignment in overrides {
        let (name, raw) = assignment.split_once('=').ok_or_else(|| {
            Error::Usage(format!(
                "malformed {kind} override '{assignment}', expected name=value"
            ))
        })?;
        let cast = values
            .get(name)
            .ok_or_else(|| {
                Error::Usage(format!(
                    "Command line {kind} {name} is not an experimental {kind}"
                ))
            })?
            .cast(raw)?;
        values.insert(name.to_string(), cast);
    }
    Ok(())
}

fn descriptor_from_options(
    name: &str,
    options: &BTreeMap<String, String>,
) -> Result<HostDescriptor> {
    let require = |key: &str| -> Result<String> {
        options.get(key).cloned().ok_or_else(|| {
            Error::Configuration(format!("Host {name} missing option {key}"))
        })
    };
    Ok(HostDescriptor {
        location: require("location")?,
        username: options.get("username").filter(|v| !v.is_empty()).cloned(),
        workspace: require("workspace")?,
        profile: options.get("profile").filter(|v| !v.is_empty()).cloned(),
    })
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
