use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, AgentRunResult, RunOpts};
use crate::diff::DiffGenerator;
use crate::error::Result;
use crate::events::{EventKind, EventSender};
use crate::prompts::PromptEngine;
use crate::report;
use crate::review_schema::Finding;
use crate::verify::{VerificationReport, VerificationRunner};

/// Diff text embedded in a fix prompt is capped at this many bytes.
pub const MAX_PROMPT_DIFF_BYTES: usize = 50 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixStatus {
    Passed,
    /// The sentinel: stays until a verification run passes.
    #[default]
    Failed,
}

impl FixStatus {
    pub fn label(&self) -> &'static str {
        match self {
            FixStatus::Passed => "PASSED",
            FixStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One iteration of (agent applies fixes → verifier checks).
#[derive(Debug, Clone)]
pub struct FixCycleResult {
    /// 1-based.
    pub cycle: u32,
    pub agent_result: Option<AgentRunResult>,
    pub verification: Option<VerificationReport>,
    pub duration: Duration,
    /// Working-tree diff captured after the agent ran.
    pub diff_after: String,
}

/// Outcome of one fix-engine invocation.
#[derive(Debug, Clone, Default)]
pub struct FixReport {
    pub cycles: Vec<FixCycleResult>,
    pub total_cycles: u32,
    pub final_status: FixStatus,
    /// True iff at least one cycle's agent exited with code 0.
    pub fixes_applied: bool,
    pub duration: Duration,
}

/// Inputs for one fix run.
#[derive(Debug, Clone, Default)]
pub struct FixRequest {
    pub findings: Vec<Finding>,
    /// Overrides the engine default when set. Zero takes the fast path.
    pub max_cycles: Option<u32>,
    /// Diff shown to the agent, truncated at [`MAX_PROMPT_DIFF_BYTES`].
    pub diff: String,
    /// Failure context seeded from an earlier run. Feeds the prompt only;
    /// does not count toward `total_cycles`.
    pub previous_cycles: Vec<FixCycleResult>,
}

/// Closed-loop controller that invokes an agent to apply fixes and re-runs
/// the verifier until it passes or the cycle budget is spent.
pub struct FixEngine<A> {
    agent: A,
    verifier: Option<VerificationRunner>,
    prompts: Arc<PromptEngine>,
    events: EventSender,
    work_dir: PathBuf,
    default_max_cycles: u32,
    base_branch: String,
    diff_gen: Option<Box<dyn DiffGenerator + Send + Sync>>,
}

impl<A: Agent> FixEngine<A> {
    pub fn new(
        agent: A,
        verifier: Option<VerificationRunner>,
        prompts: Arc<PromptEngine>,
        events: EventSender,
        work_dir: PathBuf,
        default_max_cycles: u32,
    ) -> Self {
        Self {
            agent,
            verifier,
            prompts,
            events,
            work_dir,
            default_max_cycles,
            base_branch: "main".to_string(),
            diff_gen: None,
        }
    }

    /// Attach a diff source used to snapshot the working tree after each
    /// fix cycle.
    pub fn with_diff_source(
        mut self,
        diff_gen: Box<dyn DiffGenerator + Send + Sync>,
        base_branch: String,
    ) -> Self {
        self.diff_gen = Some(diff_gen);
        self.base_branch = base_branch;
        self
    }

    /// Run the fix loop.
    ///
    /// Agent failures are recorded per cycle and the loop continues; the
    /// only errors surfacing here are prompt-template failures.
    pub async fn run(&self, cancel: &CancellationToken, request: &FixRequest) -> Result<FixReport> {
        let started = Instant::now();
        let max_cycles = request.max_cycles.unwrap_or(self.default_max_cycles);

        self.events.emit(EventKind::FixStarted {
            findings: request.findings.len(),
            max_cycles,
        });

        let mut report = FixReport::default();

        if max_cycles == 0 || request.findings.is_empty() {
            info!(
                findings = request.findings.len(),
                max_cycles, "nothing to fix"
            );
            report.final_status = FixStatus::Passed;
            report.duration = started.elapsed();
            self.events.emit(EventKind::FixCompleted {
                status: report.final_status,
                cycles: 0,
            });
            return Ok(report);
        }

        let mut prior: Vec<FixCycleResult> = request.previous_cycles.clone();

        for cycle in 1..=max_cycles {
            if cancel.is_cancelled() {
                info!(cycle, "cancelled, stopping fix loop");
                break;
            }
            self.events.emit(EventKind::CycleStarted { cycle });
            info!(cycle, max_cycles, "starting fix cycle");
            let cycle_started = Instant::now();

            let prompt = self.build_prompt(request, &prior)?;
            let opts = RunOpts {
                prompt,
                work_dir: self.work_dir.clone(),
            };

            let agent_result = match self.agent.run(cancel, &opts).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(cycle, error = %e, "fix agent invocation failed");
                    let result = FixCycleResult {
                        cycle,
                        agent_result: None,
                        verification: None,
                        duration: cycle_started.elapsed(),
                        diff_after: String::new(),
                    };
                    prior.push(result.clone());
                    report.cycles.push(result);
                    report.total_cycles = cycle;
                    continue;
                }
            };

            if agent_result.exit_code == 0 {
                report.fixes_applied = true;
            }
            self.events.emit(EventKind::AgentInvoked {
                cycle,
                exit_code: agent_result.exit_code,
            });

            let diff_after = self.snapshot_diff();

            let verification = match &self.verifier {
                Some(verifier) => {
                    self.events.emit(EventKind::VerificationStarted { cycle });
                    match verifier.run(cancel, false).await {
                        Ok(verification) => {
                            self.events.emit(EventKind::VerificationResult {
                                cycle,
                                passed: verification.passed(),
                            });
                            Some(verification)
                        }
                        Err(e) => {
                            // Cancelled mid-command; the loop check above
                            // ends the run on the next pass.
                            warn!(cycle, error = %e, "verification aborted");
                            None
                        }
                    }
                }
                None => None,
            };

            let passed = verification.as_ref().is_some_and(VerificationReport::passed);
            let result = FixCycleResult {
                cycle,
                agent_result: Some(agent_result),
                verification,
                duration: cycle_started.elapsed(),
                diff_after,
            };
            self.events.emit(EventKind::CycleCompleted { cycle });
            prior.push(result.clone());
            report.cycles.push(result);
            report.total_cycles = cycle;

            if passed {
                info!(cycle, "verification passed");
                report.final_status = FixStatus::Passed;
                break;
            }
        }

        report.duration = started.elapsed();
        self.events.emit(EventKind::FixCompleted {
            status: report.final_status,
            cycles: report.total_cycles,
        });
        info!(
            status = %report.final_status,
            cycles = report.total_cycles,
            fixes_applied = report.fixes_applied,
            "fix loop finished"
        );
        Ok(report)
    }

    /// Build the first cycle's prompt without invoking agent or verifier.
    pub fn dry_run(&self, request: &FixRequest) -> Result<String> {
        self.events.emit(EventKind::FixStarted {
            findings: request.findings.len(),
            max_cycles: request.max_cycles.unwrap_or(self.default_max_cycles),
        });
        self.build_prompt(request, &request.previous_cycles)
    }

    fn build_prompt(&self, request: &FixRequest, prior: &[FixCycleResult]) -> Result<String> {
        let commands = self
            .verifier
            .as_ref()
            .map(|v| {
                v.commands()
                    .iter()
                    .map(|c| format!("- `{c}`"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(none configured)".to_string());

        let mut vars = HashMap::new();
        vars.insert(
            "findings".to_string(),
            report::render_findings_list(&request.findings),
        );
        vars.insert("diff".to_string(), truncate_diff(&request.diff));
        vars.insert("base_branch".to_string(), self.base_branch.clone());
        vars.insert("verification_commands".to_string(), commands);
        vars.insert(
            "previous_failures".to_string(),
            render_previous_failures(prior),
        );
        self.prompts.render_phase("fix", &vars)
    }

    fn snapshot_diff(&self) -> String {
        let Some(diff_gen) = &self.diff_gen else {
            return String::new();
        };
        match diff_gen.generate(&self.base_branch) {
            Ok(diff) => diff.full_diff,
            Err(e) => {
                warn!(error = %e, "failed to snapshot post-fix diff");
                String::new()
            }
        }
    }
}

fn truncate_diff(diff: &str) -> String {
    if diff.len() <= MAX_PROMPT_DIFF_BYTES {
        return diff.to_string();
    }
    let mut end = MAX_PROMPT_DIFF_BYTES;
    while end > 0 && !diff.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[diff truncated at 50KB]", &diff[..end])
}

/// Render the failure context of prior cycles for the next prompt. This is
/// the only state that grows across cycles.
fn render_previous_failures(prior: &[FixCycleResult]) -> String {
    let mut blocks: Vec<String> = Vec::new();
    for cycle in prior {
        let Some(verification) = &cycle.verification else {
            continue;
        };
        if verification.passed() {
            continue;
        }
        let mut lines = vec![format!("### Cycle {} Failures", cycle.cycle)];
        for result in verification.results.iter().filter(|r| !r.passed) {
            lines.push(format!("Command: `{}`", result.command));
            if result.timed_out {
                lines.push("Timed out.".to_string());
            }
            let stderr = result.stderr.trim();
            if !stderr.is_empty() {
                lines.push(format!("Stderr:\n```\n{stderr}\n```"));
            }
        }
        blocks.push(lines.join("\n"));
    }
    if blocks.is_empty() {
        String::new()
    } else {
        format!("## Previous Fix Attempt Results\n\n{}", blocks.join("\n\n"))
    }
}
