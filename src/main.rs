use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use raven::agent::{AnyAgent, build_registry};
use raven::cli::{Cli, Command, FixArgs, ReviewArgs};
use raven::config::Config;
use raven::context::ProjectContext;
use raven::diff::{DiffGenerator, GitDiff};
use raven::error::{Error, Result};
use raven::events::{self, EventSender};
use raven::fix::{FixEngine, FixRequest, FixStatus};
use raven::orchestrator::{Orchestrator, ReviewMode, ReviewOutcome, ReviewRequest};
use raven::prompts::PromptEngine;
use raven::report;
use raven::review_schema::{Finding, ReviewResult};
use raven::verify::VerificationRunner;

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let code = match run(&cli, &config, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli, config: &Config, cancel: &CancellationToken) -> Result<i32> {
    let work_dir = std::env::current_dir()?;
    let context = ProjectContext::load(&work_dir);
    let prompts = Arc::new(PromptEngine::new(
        config.prompt_dir.clone().map(PathBuf::from),
        context,
    ));

    let (tx, rx) = mpsc::channel(64);
    let events = EventSender::new(tx);
    tokio::spawn(events::log_events(rx));

    match &cli.command {
        Command::Review(args) => {
            run_review(args, config, cancel, &work_dir, prompts, events).await
        }
        Command::Fix(args) => run_fix(args, config, cancel, &work_dir, prompts, events).await,
    }
}

async fn run_review(
    args: &ReviewArgs,
    config: &Config,
    cancel: &CancellationToken,
    work_dir: &PathBuf,
    prompts: Arc<PromptEngine>,
    events: EventSender,
) -> Result<i32> {
    let registry = build_registry(
        &config.overrides,
        config.agent_timeout.map(Duration::from_secs),
    );
    let orchestrator = Orchestrator::new(
        registry,
        GitDiff::new(work_dir.clone()),
        Arc::clone(&prompts),
        events.clone(),
        work_dir.clone(),
    );
    let request = ReviewRequest {
        agents: config.agents.clone(),
        concurrency: config.concurrency,
        mode: ReviewMode::parse(&config.mode),
        base_branch: config.base_branch.clone(),
        dry_run: config.dry_run,
    };

    if request.dry_run {
        println!("{}", orchestrator.dry_run(&request)?);
        return Ok(0);
    }

    let outcome = orchestrator.run(cancel, &request).await?;
    println!("{}", report::render_pr_body(&outcome.review, &outcome.stats));

    if let Some(path) = &args.output {
        write_findings(path, &outcome)?;
    }

    if args.fix && !outcome.review.findings.is_empty() {
        let fix_request = FixRequest {
            findings: outcome.review.findings.clone(),
            max_cycles: None,
            diff: outcome.diff.full_diff.clone(),
            previous_cycles: vec![],
        };
        let engine = build_fix_engine(config, work_dir, prompts, events)?;
        let fix_report = engine.run(cancel, &fix_request).await?;
        println!("{}", report::render_fix_summary(&fix_report));
        return Ok(if fix_report.final_status == FixStatus::Passed {
            0
        } else {
            1
        });
    }

    Ok(match outcome.review.verdict {
        raven::review_schema::Verdict::Approved => 0,
        _ => 1,
    })
}

async fn run_fix(
    args: &FixArgs,
    config: &Config,
    cancel: &CancellationToken,
    work_dir: &PathBuf,
    prompts: Arc<PromptEngine>,
    events: EventSender,
) -> Result<i32> {
    let findings = load_findings(&args.findings)?;
    let diff = GitDiff::new(work_dir.clone())
        .generate(&config.base_branch)
        .map(|d| d.full_diff)
        .unwrap_or_else(|e| {
            warn!(error = %e, "diff generation failed, fixing without diff context");
            String::new()
        });

    let engine = build_fix_engine(config, work_dir, prompts, events)?;
    let request = FixRequest {
        findings,
        max_cycles: None,
        diff,
        previous_cycles: vec![],
    };

    if config.dry_run {
        println!("{}", engine.dry_run(&request)?);
        return Ok(0);
    }

    let fix_report = engine.run(cancel, &request).await?;
    println!("{}", report::render_fix_summary(&fix_report));
    Ok(if fix_report.final_status == FixStatus::Passed {
        0
    } else {
        1
    })
}

fn build_fix_engine(
    config: &Config,
    work_dir: &PathBuf,
    prompts: Arc<PromptEngine>,
    events: EventSender,
) -> Result<FixEngine<AnyAgent>> {
    let mut registry = build_registry(
        &config.overrides,
        config.agent_timeout.map(Duration::from_secs),
    );
    let agent = registry.remove(&config.fix_agent).ok_or_else(|| {
        Error::Pipeline(format!("unknown fix agent: {}", config.fix_agent))
    })?;

    let verifier = if config.verify_commands.is_empty() {
        None
    } else {
        Some(VerificationRunner::new(
            config.verify_commands.clone(),
            work_dir.clone(),
            Duration::from_secs(config.verify_timeout),
        ))
    };

    Ok(FixEngine::new(
        agent,
        verifier,
        prompts,
        events,
        work_dir.clone(),
        config.max_fix_cycles,
    )
    .with_diff_source(
        Box::new(GitDiff::new(work_dir.clone())),
        config.base_branch.clone(),
    ))
}

/// Accepts either a full review output (`{"findings": [...]}`) or a bare
/// findings array.
fn load_findings(path: &str) -> Result<Vec<Finding>> {
    let content = std::fs::read_to_string(path)?;
    if let Ok(result) = serde_json::from_str::<ReviewResult>(&content) {
        return Ok(result.findings);
    }
    serde_json::from_str::<Vec<Finding>>(&content)
        .map_err(|e| Error::Pipeline(format!("could not parse findings from {path}: {e}")))
}

fn write_findings(path: &str, outcome: &ReviewOutcome) -> Result<()> {
    let result = ReviewResult {
        findings: outcome.review.findings.clone(),
        verdict: outcome.review.verdict,
    };
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| Error::Pipeline(format!("failed to serialize findings: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}
