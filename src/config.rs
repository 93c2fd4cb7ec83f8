use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::cli::{Cli, Command};
use crate::error::{Error, Result};

/// Per-agent binary/model/timeout overrides, keyed by agent name under
/// `[overrides.<name>]` in the config file.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentOverride {
    pub binary: Option<String>,
    pub model: Option<String>,
    /// Seconds.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub agents: Option<Vec<String>>,
    pub concurrency: Option<i64>,
    pub mode: Option<String>,
    pub base_branch: Option<String>,
    pub dry_run: Option<bool>,
    pub agent_timeout: Option<u64>,
    pub fix_agent: Option<String>,
    pub max_fix_cycles: Option<u32>,
    pub verify_commands: Option<Vec<String>>,
    pub verify_timeout: Option<u64>,
    pub prompt_dir: Option<String>,
    pub overrides: Option<HashMap<String, AgentOverride>>,
}

/// Resolved configuration: file values overridden by CLI flags, defaults
/// filled in, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub agents: Vec<String>,
    pub concurrency: usize,
    pub mode: String,
    pub base_branch: String,
    pub dry_run: bool,
    /// Seconds; None disables the agent timeout.
    pub agent_timeout: Option<u64>,
    pub fix_agent: String,
    pub max_fix_cycles: u32,
    pub verify_commands: Vec<String>,
    /// Seconds, per command.
    pub verify_timeout: u64,
    pub prompt_dir: Option<String>,
    pub overrides: HashMap<String, AgentOverride>,
}

const DEFAULT_CONFIG_FILE: &str = ".raven/config.toml";

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(cli, Path::new("."))
    }

    pub fn load_from(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let file_config = match &cli.config {
            Some(explicit_path) => {
                let path = Path::new(explicit_path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path)?;
                parse_config(&content)?
            }
            None => {
                let path = project_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    let content = std::fs::read_to_string(&path)?;
                    parse_config(&content)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    Ok(config)
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    let mut config = Config {
        agents: file
            .agents
            .unwrap_or_else(|| vec!["claude".to_string()]),
        concurrency: clamp_concurrency(file.concurrency.unwrap_or(3)),
        mode: file.mode.unwrap_or_else(|| "all".to_string()),
        base_branch: file.base_branch.unwrap_or_else(|| "main".to_string()),
        dry_run: file.dry_run.unwrap_or(false),
        agent_timeout: file.agent_timeout.or(Some(900)),
        fix_agent: file.fix_agent.unwrap_or_else(|| "claude".to_string()),
        max_fix_cycles: file.max_fix_cycles.unwrap_or(3),
        verify_commands: file.verify_commands.unwrap_or_default(),
        verify_timeout: file.verify_timeout.unwrap_or(300),
        prompt_dir: file.prompt_dir,
        overrides: file.overrides.unwrap_or_default(),
    };

    match &cli.command {
        Command::Review(args) => {
            if !args.agents.is_empty() {
                config.agents = args.agents.clone();
            }
            if let Some(concurrency) = args.concurrency {
                config.concurrency = clamp_concurrency(concurrency);
            }
            if let Some(mode) = &args.mode {
                config.mode = mode.clone();
            }
            if let Some(base_branch) = &args.base_branch {
                config.base_branch = base_branch.clone();
            }
            config.dry_run = config.dry_run || args.dry_run;
        }
        Command::Fix(args) => {
            if let Some(agent) = &args.agent {
                config.fix_agent = agent.clone();
            }
            if let Some(max_cycles) = args.max_cycles {
                config.max_fix_cycles = max_cycles;
            }
            if !args.verify_commands.is_empty() {
                config.verify_commands = args.verify_commands.clone();
            }
            if let Some(timeout) = args.verify_timeout {
                config.verify_timeout = timeout;
            }
            if let Some(base_branch) = &args.base_branch {
                config.base_branch = base_branch.clone();
            }
            config.dry_run = config.dry_run || args.dry_run;
        }
    }

    validate(&config)?;
    Ok(config)
}

fn clamp_concurrency(value: i64) -> usize {
    if value < 1 {
        warn!(value, "concurrency below 1, clamping to 1");
        1
    } else {
        value as usize
    }
}

fn validate(config: &Config) -> Result<()> {
    match config.mode.as_str() {
        "all" | "split" => {}
        other => {
            return Err(Error::ConfigValidation(format!(
                "unknown mode: {other} (expected: all, split)"
            )));
        }
    }
    if config.agents.is_empty() {
        return Err(Error::ConfigValidation(
            "agents must not be empty".to_string(),
        ));
    }
    if config.verify_timeout == 0 {
        return Err(Error::ConfigValidation(
            "verify_timeout must be > 0".to_string(),
        ));
    }
    Ok(())
}
