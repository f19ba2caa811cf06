//! Proxy configuration: which upstream commands to launch and how long to
//! wait on them.
//!
//! Sources are layered with the `config` crate, lowest priority first:
//! built-in defaults, the YAML file, `PROXY_`-prefixed environment
//! variables, then command-line flags.

use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, collections::HashSet, fmt, time::Duration};

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Default wait for a single upstream response line.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "PROXY_CONFIG")]
    pub config: Option<String>,

    /// Seconds to wait for an upstream response before giving up
    #[arg(long, env = "PROXY_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    #[serde(default)]
    pub upstream_servers: Vec<UpstreamServerConfig>,
    pub request_timeout_secs: u64,
}

/// One upstream entry as written in the config file.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct UpstreamServerConfig {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl UpstreamServerConfig {
    pub fn new(id: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            command,
            env: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Launch command: a shell line or an explicit argv.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    /// Program and arguments to spawn, or `None` for an empty command.
    ///
    /// Shell lines run through `sh -c` (`cmd /C` on Windows).
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        match self {
            Self::Shell(line) if line.trim().is_empty() => None,
            Self::Shell(line) => {
                #[cfg(windows)]
                let (shell, flag) = ("cmd", "/C");
                #[cfg(not(windows))]
                let (shell, flag) = ("sh", "-c");
                Some((shell.to_string(), vec![flag.to_string(), line.clone()]))
            }
            Self::Argv(argv) => {
                let (program, args) = argv.split_first()?;
                if program.trim().is_empty() {
                    return None;
                }
                Some((program.clone(), args.to_vec()))
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

impl ProxyConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let mut builder = Config::builder()
            .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
            // An explicitly named file must exist; the default one is optional.
            .add_source(File::new(&path, FileFormat::Yaml).required(cli.config.is_some()))
            .add_source(
                Environment::with_prefix("PROXY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(secs) = cli.request_timeout_secs {
            builder = builder.set_override("request_timeout_secs", secs)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject entries the manager could never start.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.upstream_servers {
            if entry.id.trim().is_empty() {
                return Err(config::ConfigError::Message(
                    "upstream server with empty id".to_string(),
                ));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(config::ConfigError::Message(format!(
                    "duplicate upstream server id '{}'",
                    entry.id
                )));
            }
            if entry.command.program_and_args().is_none() {
                return Err(config::ConfigError::Message(format!(
                    "upstream server '{}' has an empty command",
                    entry.id
                )));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Expand `${VAR}` placeholders from the process environment.
///
/// Unknown variables and unterminated placeholders are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    _ => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}
