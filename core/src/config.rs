//! INI-style configuration files.
//!
//! Experiments read their parameters, environment variables, and host
//! declarations from a flat INI file and write back the effective
//! values next to their results. Keys are case-insensitive and stored
//! lowercased; values keep their case.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

const HOSTS_SECTION: &str = "hosts";

/// A parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl Configuration {
    pub fn new() -> Configuration {
        Configuration::default()
    }

    /// Reads and parses the file at `path`.
    pub fn load(path: &Path) -> Result<Configuration> {
        let text = fs::read_to_string(path)?;
        Configuration::parse(&text)
    }

    /// Parses INI text.
    ///
    /// Lines starting with `#` or `;` are comments. A key with no `=`
    /// takes the empty value. Keys must follow a section header.
    pub fn parse(text: &str) -> Result<Configuration> {
        let mut config = Configuration::new();
        let mut current: Option<String> = None;
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                let lineno = index + 1;
                let name = line
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        Error::Configuration(format!("line {lineno}: malformed section header"))
                    })?;
                config.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let section = current.clone().ok_or_else(|| {
                Error::Configuration(format!(
                    "line {}: option before any section header",
                    index + 1
                ))
            })?;
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, ""),
            };
            config.set(&section, key, value);
        }
        Ok(config)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_lowercase(), value.to_string());
    }

    /// All keys of one section in sorted order.
    pub fn keys(&self, section: &str) -> Vec<&str> {
        match self.sections.get(section) {
            Some(entries) => entries.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    /// Options for one host, gathered by prefix from the hosts section.
    ///
    /// `node.location = x` surfaces as `location = x` for host `node`.
    /// The prefix match is exact up to the dot, so `pool[0].location`
    /// never bleeds into host `pool`.
    pub fn host_options(&self, name: &str) -> BTreeMap<String, String> {
        let prefix = format!("{name}.");
        let mut options = BTreeMap::new();
        if let Some(entries) = self.sections.get(HOSTS_SECTION) {
            for (key, value) in entries {
                if let Some(suffix) = key.strip_prefix(&prefix) {
                    options.insert(suffix.to_string(), value.clone());
                }
            }
        }
        options
    }

    /// Renders the configuration back to INI text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.sections {
            out.push_str(&format!("[{name}]\n"));
            for (key, value) in entries {
                out.push_str(&format!("{key} = {value}\n"));
            }
            out.push('\n');
        }
        out
    }

    /// Writes the rendered configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
