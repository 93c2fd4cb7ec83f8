use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, RunOpts};
use crate::consolidate::{ConsolidatedReview, ConsolidationStats, consolidate};
use crate::diff::{ChangedFile, DiffGenerator, DiffResult};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSender};
use crate::prompts::PromptEngine;
use crate::report;
use crate::review_schema::{
    AgentError, AgentErrorKind, AgentReviewResult, extract_review_result,
};

/// How changed files are handed to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewMode {
    /// Every agent reviews the full changed set.
    #[default]
    All,
    /// Files are split round-robin across agents, high-risk files first.
    Split,
}

impl ReviewMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "split" => ReviewMode::Split,
            "all" => ReviewMode::All,
            other => {
                warn!(mode = other, "unknown review mode, falling back to all");
                ReviewMode::All
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMode::All => "all",
            ReviewMode::Split => "split",
        }
    }
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrator run's worth of configuration.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub agents: Vec<String>,
    pub concurrency: usize,
    pub mode: ReviewMode,
    pub base_branch: String,
    pub dry_run: bool,
}

/// Everything a caller gets back from one run.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub review: ConsolidatedReview,
    pub stats: ConsolidationStats,
    pub diff: DiffResult,
    pub duration: Duration,
    pub agent_errors: Vec<AgentError>,
}

/// Fans review work out to a set of agents with bounded parallelism and
/// feeds the per-agent results through the consolidator.
pub struct Orchestrator<A, D> {
    registry: Arc<HashMap<String, A>>,
    diff_gen: D,
    prompts: Arc<PromptEngine>,
    events: EventSender,
    work_dir: PathBuf,
}

impl<A, D> Orchestrator<A, D>
where
    A: Agent + Send + Sync + 'static,
    D: DiffGenerator,
{
    pub fn new(
        registry: HashMap<String, A>,
        diff_gen: D,
        prompts: Arc<PromptEngine>,
        events: EventSender,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            diff_gen,
            prompts,
            events,
            work_dir,
        }
    }

    /// Run the full review pipeline: validate, diff, assign, fan out,
    /// consolidate.
    ///
    /// Per-agent failures never abort the run; the only errors that
    /// surface here are invalid requests and diff generation failures.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        request: &ReviewRequest,
    ) -> Result<ReviewOutcome> {
        let started = Instant::now();
        self.validate(request)?;

        self.events.emit(EventKind::ReviewStarted {
            agents: request.agents.clone(),
            mode: request.mode.to_string(),
        });

        let diff = Arc::new(self.diff_gen.generate(&request.base_branch)?);
        let mut assignments = assign_files(&request.agents, &diff.files, request.mode);

        let concurrency = request.concurrency.max(1);
        info!(
            agents = request.agents.len(),
            concurrency,
            mode = %request.mode,
            files = diff.files.len(),
            "starting review fan-out"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers: JoinSet<AgentReviewResult> = JoinSet::new();

        for name in &request.agents {
            let name = name.clone();
            let files = assignments.remove(&name).unwrap_or_default();
            let registry = Arc::clone(&self.registry);
            let prompts = Arc::clone(&self.prompts);
            let diff = Arc::clone(&diff);
            let events = self.events.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let mode = request.mode;
            let work_dir = self.work_dir.clone();

            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match registry.get(&name) {
                    Some(agent) => {
                        review_worker(agent, files, &diff, mode, work_dir, &prompts, &events, &cancel)
                            .await
                    }
                    // Unreachable after validation; degrade to an errored result.
                    None => errored(
                        &events,
                        &name,
                        AgentErrorKind::Execution,
                        format!("agent '{name}' missing from registry"),
                        String::new(),
                        Duration::ZERO,
                    ),
                }
            });
        }

        let mut results: Vec<AgentReviewResult> = Vec::with_capacity(request.agents.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "review worker task failed"),
            }
        }

        // Deterministic ordering for reports regardless of completion order.
        results.sort_by_key(|r| {
            request
                .agents
                .iter()
                .position(|a| a == &r.agent)
                .unwrap_or(usize::MAX)
        });

        let agent_errors: Vec<AgentError> =
            results.iter().filter_map(|r| r.error.clone()).collect();
        let (mut review, stats) = consolidate(&results);
        review.duration = started.elapsed();

        self.events.emit(EventKind::Consolidated {
            unique_findings: stats.unique_findings,
            verdict: review.verdict,
        });
        info!(
            verdict = %review.verdict,
            unique = stats.unique_findings,
            duplicates = stats.duplicates_removed,
            errors = agent_errors.len(),
            "review consolidated"
        );

        let diff = Arc::try_unwrap(diff).unwrap_or_else(|arc| (*arc).clone());
        Ok(ReviewOutcome {
            review,
            stats,
            diff,
            duration: started.elapsed(),
            agent_errors,
        })
    }

    /// Validate the request, generate the diff, compute assignments, and
    /// render a human-readable plan. Agents are never invoked.
    pub fn dry_run(&self, request: &ReviewRequest) -> Result<String> {
        self.validate(request)?;
        self.events.emit(EventKind::ReviewStarted {
            agents: request.agents.clone(),
            mode: request.mode.to_string(),
        });
        let diff = self.diff_gen.generate(&request.base_branch)?;
        let assignments = assign_files(&request.agents, &diff.files, request.mode);

        let mut entries = Vec::with_capacity(request.agents.len());
        for name in &request.agents {
            let files = assignments.get(name).map_or(0, Vec::len);
            let preview = self
                .registry
                .get(name)
                .map(|agent| {
                    agent.dry_run_command(&RunOpts {
                        prompt: "<prompt>".to_string(),
                        work_dir: self.work_dir.clone(),
                    })
                })
                .unwrap_or_default();
            entries.push(report::PlanEntry {
                agent: name.clone(),
                file_count: files,
                command: preview,
            });
        }

        Ok(report::render_plan(
            request.mode.as_str(),
            &request.base_branch,
            diff.files.len(),
            &entries,
        ))
    }

    fn validate(&self, request: &ReviewRequest) -> Result<()> {
        if request.agents.is_empty() {
            return Err(Error::Pipeline("no review agents configured".to_string()));
        }
        for name in &request.agents {
            if !self.registry.contains_key(name) {
                let mut known: Vec<&str> = self.registry.keys().map(String::as_str).collect();
                known.sort_unstable();
                return Err(Error::Pipeline(format!(
                    "unknown agent: {name} (known: {})",
                    known.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Distribute changed files across agents.
///
/// In `all` mode every bucket holds the full set. In `split` mode files go
/// round-robin, dealing high-risk files first so each bucket gets at least
/// one when enough exist.
pub fn assign_files(
    agents: &[String],
    files: &[ChangedFile],
    mode: ReviewMode,
) -> HashMap<String, Vec<ChangedFile>> {
    let mut buckets: HashMap<String, Vec<ChangedFile>> = agents
        .iter()
        .map(|agent| (agent.clone(), Vec::new()))
        .collect();
    if agents.is_empty() {
        return buckets;
    }

    match mode {
        ReviewMode::All => {
            for agent in agents {
                if let Some(bucket) = buckets.get_mut(agent) {
                    *bucket = files.to_vec();
                }
            }
        }
        ReviewMode::Split => {
            let (high_risk, rest): (Vec<_>, Vec<_>) =
                files.iter().cloned().partition(|f| f.high_risk);
            for (i, file) in high_risk.into_iter().chain(rest).enumerate() {
                let agent = &agents[i % agents.len()];
                if let Some(bucket) = buckets.get_mut(agent) {
                    bucket.push(file);
                }
            }
        }
    }
    buckets
}

#[allow(clippy::too_many_arguments)]
async fn review_worker<A: Agent>(
    agent: &A,
    files: Vec<ChangedFile>,
    diff: &DiffResult,
    mode: ReviewMode,
    work_dir: PathBuf,
    prompts: &PromptEngine,
    events: &EventSender,
    cancel: &CancellationToken,
) -> AgentReviewResult {
    let name = agent.name().to_string();
    let started = Instant::now();
    events.emit(EventKind::AgentStarted {
        agent: name.clone(),
    });

    let prompt = match prompts.build_for_agent(&name, diff, &files, mode.as_str()) {
        Ok(prompt) => prompt,
        Err(e) => {
            return errored(
                events,
                &name,
                AgentErrorKind::Prompt,
                format!("prompt build failed: {e}"),
                String::new(),
                started.elapsed(),
            );
        }
    };

    let opts = RunOpts {
        prompt,
        work_dir,
    };
    let run = match agent.run(cancel, &opts).await {
        Ok(run) => run,
        Err(e) => {
            return errored(
                events,
                &name,
                AgentErrorKind::Execution,
                e.to_string(),
                String::new(),
                started.elapsed(),
            );
        }
    };

    if let Some(info) = run.rate_limit.as_ref().filter(|info| info.limited) {
        events.emit(EventKind::RateLimited {
            agent: name.clone(),
            reset_after: info.reset_after,
            message: info.message.clone(),
        });
        warn!(agent = %name, "rate limited: {}", info.message);
        let error = AgentError {
            agent: name.clone(),
            kind: AgentErrorKind::RateLimited,
            message: info.message.clone(),
        };
        return AgentReviewResult {
            agent: name,
            result: None,
            duration: started.elapsed(),
            error: Some(error),
            raw_output: run.stdout,
        };
    }

    if run.exit_code != 0 {
        let tail: String = run.stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
        return errored(
            events,
            &name,
            AgentErrorKind::Exit,
            format!("agent exited with code {}: {tail}", run.exit_code),
            run.stdout,
            started.elapsed(),
        );
    }

    let result = match extract_review_result(&run.stdout) {
        Ok(result) => result,
        Err(e) => {
            return errored(
                events,
                &name,
                AgentErrorKind::Parse,
                e,
                run.stdout,
                started.elapsed(),
            );
        }
    };

    if let Err(e) = result.validate() {
        return errored(
            events,
            &name,
            AgentErrorKind::Validation,
            e,
            run.stdout,
            started.elapsed(),
        );
    }

    events.emit(EventKind::AgentCompleted {
        agent: name.clone(),
        findings: result.findings.len(),
        duration: started.elapsed(),
    });
    info!(agent = %name, findings = result.findings.len(), "agent review complete");

    AgentReviewResult {
        agent: name,
        result: Some(result),
        duration: started.elapsed(),
        error: None,
        raw_output: run.stdout,
    }
}

fn errored(
    events: &EventSender,
    agent: &str,
    kind: AgentErrorKind,
    message: String,
    raw_output: String,
    duration: Duration,
) -> AgentReviewResult {
    warn!(agent, %kind, "{message}");
    events.emit(EventKind::AgentError {
        agent: agent.to_string(),
        kind,
        message: message.clone(),
    });
    AgentReviewResult {
        agent: agent.to_string(),
        result: None,
        duration,
        error: Some(AgentError {
            agent: agent.to_string(),
            kind,
            message,
        }),
        raw_output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, high_risk: bool) -> ChangedFile {
        ChangedFile {
            path: path.to_string(),
            status: "M".to_string(),
            high_risk,
        }
    }

    fn agents(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ReviewMode::parse("all"), ReviewMode::All);
        assert_eq!(ReviewMode::parse("split"), ReviewMode::Split);
        assert_eq!(ReviewMode::parse("shuffle"), ReviewMode::All);
    }

    #[test]
    fn test_assign_all_mode_gives_everyone_everything() {
        let files = vec![file("a.rs", false), file("b.rs", false)];
        let buckets = assign_files(&agents(&["claude", "codex"]), &files, ReviewMode::All);
        assert_eq!(buckets["claude"].len(), 2);
        assert_eq!(buckets["codex"].len(), 2);
    }

    #[test]
    fn test_assign_split_round_robin() {
        let files: Vec<ChangedFile> = (0..6).map(|i| file(&format!("f{i}.rs"), false)).collect();
        let buckets = assign_files(&agents(&["claude", "codex"]), &files, ReviewMode::Split);
        assert_eq!(buckets["claude"].len(), 3);
        assert_eq!(buckets["codex"].len(), 3);
    }

    #[test]
    fn test_assign_split_distributes_high_risk_first() {
        let files = vec![
            file("a.rs", false),
            file("auth.rs", true),
            file("b.rs", false),
            file("secrets.rs", true),
            file("c.rs", false),
            file("d.rs", false),
        ];
        let buckets = assign_files(&agents(&["claude", "codex"]), &files, ReviewMode::Split);
        assert_eq!(buckets["claude"].len(), 3);
        assert_eq!(buckets["codex"].len(), 3);
        assert!(buckets["claude"].iter().any(|f| f.high_risk));
        assert!(buckets["codex"].iter().any(|f| f.high_risk));
    }

    #[test]
    fn test_assign_split_uneven_counts() {
        let files: Vec<ChangedFile> = (0..5).map(|i| file(&format!("f{i}.rs"), false)).collect();
        let buckets = assign_files(&agents(&["a", "b", "c"]), &files, ReviewMode::Split);
        let mut counts: Vec<usize> = buckets.values().map(Vec::len).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 2]);
    }

    #[test]
    fn test_assign_empty_files() {
        let buckets = assign_files(&agents(&["claude"]), &[], ReviewMode::Split);
        assert!(buckets["claude"].is_empty());
    }
}
