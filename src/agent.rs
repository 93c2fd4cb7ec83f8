use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::AgentOverride;
use crate::error::Result;
use crate::process::{ProcessConfig, spawn_and_stream};

/// Inputs for a single agent invocation.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub prompt: String,
    pub work_dir: PathBuf,
}

/// Throttle signal parsed from an agent's output. When `limited` is set the
/// orchestrator classifies the run as rate-limited regardless of exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limited: bool,
    pub reset_after: Option<Duration>,
    pub message: String,
}

/// Captured output of one agent subprocess run. Non-zero exits are data
/// here; classification happens in the orchestrator.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub rate_limit: Option<RateLimitInfo>,
}

/// A reviewing agent backed by some LLM CLI.
pub trait Agent {
    fn name(&self) -> &str;

    /// Launch the CLI with the prompt and capture its output.
    fn run(
        &self,
        cancel: &CancellationToken,
        opts: &RunOpts,
    ) -> impl std::future::Future<Output = Result<AgentRunResult>> + Send;

    /// Display-only preview of the command this agent would run.
    fn dry_run_command(&self, opts: &RunOpts) -> String;
}

/// Claude Code agent — invokes the claude CLI in non-interactive mode.
pub struct ClaudeAgent {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl ClaudeAgent {
    pub fn new(binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.binary.clone(), args)
    }
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<AgentRunResult> {
        let (command, args) = self.build_command(&opts.prompt);
        run_cli(self.name(), command, args, None, opts, self.timeout, cancel).await
    }

    fn dry_run_command(&self, _opts: &RunOpts) -> String {
        let (command, args) = self.build_command("<prompt>");
        format!("{command} {}", args.join(" "))
    }
}

/// Codex agent — prompt is fed on stdin.
pub struct CodexAgent {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl CodexAgent {
    pub fn new(binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    pub fn build_command(&self) -> (String, Vec<String>) {
        let mut args = vec!["--quiet".to_string(), "--full-auto".to_string()];

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        (self.binary.clone(), args)
    }
}

impl Agent for CodexAgent {
    fn name(&self) -> &str {
        "codex"
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<AgentRunResult> {
        let (command, args) = self.build_command();
        run_cli(
            self.name(),
            command,
            args,
            Some(opts.prompt.clone()),
            opts,
            self.timeout,
            cancel,
        )
        .await
    }

    fn dry_run_command(&self, _opts: &RunOpts) -> String {
        let (command, args) = self.build_command();
        format!("{command} {} (prompt on stdin)", args.join(" "))
    }
}

/// Gemini CLI agent.
pub struct GeminiAgent {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl GeminiAgent {
    pub fn new(binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>) {
        let mut args = vec!["--yolo".to_string()];

        if let Some(ref model) = self.model {
            args.push("-m".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(prompt.to_string());

        (self.binary.clone(), args)
    }
}

impl Agent for GeminiAgent {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<AgentRunResult> {
        let (command, args) = self.build_command(&opts.prompt);
        run_cli(self.name(), command, args, None, opts, self.timeout, cancel).await
    }

    fn dry_run_command(&self, _opts: &RunOpts) -> String {
        let (command, args) = self.build_command("<prompt>");
        format!("{command} {}", args.join(" "))
    }
}

/// Enum dispatching to one of the bundled CLI agents.
pub enum AnyAgent {
    Claude(ClaudeAgent),
    Codex(CodexAgent),
    Gemini(GeminiAgent),
}

impl Agent for AnyAgent {
    fn name(&self) -> &str {
        match self {
            AnyAgent::Claude(a) => a.name(),
            AnyAgent::Codex(a) => a.name(),
            AnyAgent::Gemini(a) => a.name(),
        }
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<AgentRunResult> {
        match self {
            AnyAgent::Claude(a) => a.run(cancel, opts).await,
            AnyAgent::Codex(a) => a.run(cancel, opts).await,
            AnyAgent::Gemini(a) => a.run(cancel, opts).await,
        }
    }

    fn dry_run_command(&self, opts: &RunOpts) -> String {
        match self {
            AnyAgent::Claude(a) => a.dry_run_command(opts),
            AnyAgent::Codex(a) => a.dry_run_command(opts),
            AnyAgent::Gemini(a) => a.dry_run_command(opts),
        }
    }
}

/// Build the name → agent registry for every bundled agent, applying
/// per-agent binary/model/timeout overrides from config.
pub fn build_registry(
    overrides: &HashMap<String, AgentOverride>,
    default_timeout: Option<Duration>,
) -> HashMap<String, AnyAgent> {
    let mut registry = HashMap::new();
    for name in ["claude", "codex", "gemini"] {
        let over = overrides.get(name);
        let binary = over
            .and_then(|o| o.binary.clone())
            .unwrap_or_else(|| name.to_string());
        let model = over.and_then(|o| o.model.clone());
        let timeout = over
            .and_then(|o| o.timeout)
            .map(Duration::from_secs)
            .or(default_timeout);
        let agent = match name {
            "codex" => AnyAgent::Codex(CodexAgent::new(binary, model, timeout)),
            "gemini" => AnyAgent::Gemini(GeminiAgent::new(binary, model, timeout)),
            _ => AnyAgent::Claude(ClaudeAgent::new(binary, model, timeout)),
        };
        registry.insert(name.to_string(), agent);
    }
    registry
}

async fn run_cli(
    name: &str,
    command: String,
    args: Vec<String>,
    stdin_data: Option<String>,
    opts: &RunOpts,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<AgentRunResult> {
    let started = Instant::now();
    let config = ProcessConfig {
        command,
        args,
        working_dir: opts.work_dir.clone(),
        timeout,
        log_prefix: format!("agent:{name}"),
        env: vec![],
        stdin_data,
    };

    let output = spawn_and_stream(config, cancel).await?;

    let stdout = output.stdout_lines.join("\n");
    let stderr = output.stderr_lines.join("\n");
    let rate_limit = detect_rate_limit(&stdout, &stderr);

    Ok(AgentRunResult {
        exit_code: output.exit_code,
        stdout,
        stderr,
        duration: started.elapsed(),
        rate_limit,
    })
}

/// Scan agent output for throttle signals. Distinct from a generic
/// non-zero exit: a limited agent should be retried later, not fixed.
pub fn detect_rate_limit(stdout: &str, stderr: &str) -> Option<RateLimitInfo> {
    let haystack = format!("{stdout}\n{stderr}");
    let signal =
        Regex::new(r"(?i)rate.?limit|too many requests|quota exceeded|resource.?exhausted|\b429\b")
            .unwrap();
    if !signal.is_match(&haystack) {
        return None;
    }

    let reset_re = Regex::new(r"(?i)(?:retry|reset)[^0-9]{0,20}(\d+)\s*(seconds?|secs?|minutes?|mins?|s|m)?\b")
        .unwrap();
    let reset_after = reset_re.captures(&haystack).and_then(|cap| {
        let n: u64 = cap[1].parse().ok()?;
        let minutes = cap
            .get(2)
            .is_some_and(|unit| unit.as_str().to_ascii_lowercase().starts_with('m'));
        Some(Duration::from_secs(if minutes { n * 60 } else { n }))
    });

    let message = haystack
        .lines()
        .find(|line| signal.is_match(line))
        .unwrap_or("rate limited")
        .trim()
        .to_string();

    Some(RateLimitInfo {
        limited: true,
        reset_after,
        message,
    })
}
