use clap::{Args, Parser, Subcommand};

/// raven — multi-agent AI code review pipeline
#[derive(Parser, Debug)]
#[command(name = "raven", version, about)]
pub struct Cli {
    /// Path to config file (default: .raven/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fan review agents out over the current change and consolidate
    /// their findings
    Review(ReviewArgs),
    /// Run the fix-and-verify loop over saved findings
    Fix(FixArgs),
}

#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// Agents to run (comma-separated: claude, codex, gemini)
    #[arg(long, value_delimiter = ',')]
    pub agents: Vec<String>,

    /// Maximum agents running at once
    #[arg(long, allow_hyphen_values = true)]
    pub concurrency: Option<i64>,

    /// File assignment mode (all, split)
    #[arg(long)]
    pub mode: Option<String>,

    /// Branch to diff against
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Print the plan without invoking any agent
    #[arg(long)]
    pub dry_run: bool,

    /// Run the fix loop on the consolidated findings afterwards
    #[arg(long)]
    pub fix: bool,

    /// Write the consolidated findings as JSON to this path
    #[arg(long)]
    pub output: Option<String>,
}

#[derive(Args, Debug)]
pub struct FixArgs {
    /// Path to a findings JSON file (a review output or a findings array)
    #[arg(long)]
    pub findings: String,

    /// Agent that applies fixes
    #[arg(long)]
    pub agent: Option<String>,

    /// Maximum fix cycles
    #[arg(long)]
    pub max_cycles: Option<u32>,

    /// Verification command, repeatable; run in order after each cycle
    #[arg(long = "verify", value_name = "CMD")]
    pub verify_commands: Vec<String>,

    /// Per-command verification timeout in seconds
    #[arg(long)]
    pub verify_timeout: Option<u64>,

    /// Branch to diff against
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Print the fix prompt without invoking agent or verifier
    #[arg(long)]
    pub dry_run: bool,
}
