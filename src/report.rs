use std::fmt::Write;

use crate::consolidate::{ConsolidatedReview, ConsolidationStats};
use crate::fix::{FixReport, FixStatus};
use crate::review_schema::{Finding, Severity, Verdict};

fn verdict_badge(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Approved => "\u{2705} APPROVED",
        Verdict::ChangesNeeded => "\u{26A0}\u{FE0F} CHANGES NEEDED",
        Verdict::Blocking => "\u{1F6D1} BLOCKING",
        Verdict::Unknown => "UNKNOWN",
    }
}

/// Render a consolidated review as a pull-request body.
pub fn render_pr_body(review: &ConsolidatedReview, stats: &ConsolidationStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Raven Review — {}", verdict_badge(review.verdict));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} agent(s), {} unique finding(s) ({} duplicate(s) removed, {} escalation(s), {:.0}% overlap), {}s.",
        review.total_agents,
        stats.unique_findings,
        stats.duplicates_removed,
        stats.severity_escalations,
        stats.overlap_rate,
        review.duration.as_secs(),
    );

    if !review.findings.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Findings");
        let mut current: Option<Severity> = None;
        for finding in &review.findings {
            if current != Some(finding.severity) {
                current = Some(finding.severity);
                let _ = writeln!(out);
                let _ = writeln!(out, "#### {}", finding.severity.label());
            }
            let location = if finding.line == 0 {
                format!("`{}`", finding.file)
            } else {
                format!("`{}` L{}", finding.file, finding.line)
            };
            let _ = writeln!(
                out,
                "- **[{}]** {} ({}): {}",
                finding.category, location, finding.agent, finding.description
            );
            if !finding.suggestion.trim().is_empty() {
                let _ = writeln!(out, "  - Suggestion: {}", finding.suggestion.trim());
            }
        }
    }

    let errored: Vec<_> = review
        .agent_results
        .iter()
        .filter_map(|r| r.error.as_ref())
        .collect();
    if !errored.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Agent errors");
        for error in errored {
            let _ = writeln!(out, "- `{}` ({}): {}", error.agent, error.kind, error.message);
        }
    }

    out
}

/// Render findings as a bullet list for injection into the fix prompt.
pub fn render_findings_list(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "No findings.".to_string();
    }
    findings
        .iter()
        .map(|f| {
            let mut line = format!(
                "- **{}** [{}] `{}` L{}: {}",
                f.severity.label().to_uppercase(),
                f.category,
                f.file,
                f.line,
                f.description
            );
            if !f.suggestion.trim().is_empty() {
                line.push_str(&format!(" (suggestion: {})", f.suggestion.trim()));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One agent's row in the dry-run plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub agent: String,
    pub file_count: usize,
    pub command: String,
}

/// Render the dry-run plan: what would run, over which files, with which
/// commands.
pub fn render_plan(
    mode: &str,
    base_branch: &str,
    total_files: usize,
    entries: &[PlanEntry],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Review plan (dry run)");
    let _ = writeln!(out, "  mode: {mode}");
    let _ = writeln!(out, "  base branch: {base_branch}");
    let _ = writeln!(out, "  changed files: {total_files}");
    let _ = writeln!(out, "  agents:");
    for entry in entries {
        let _ = writeln!(
            out,
            "    {} — {} file(s)\n      {}",
            entry.agent, entry.file_count, entry.command
        );
    }
    out
}

/// Render a fix report summary for the console.
pub fn render_fix_summary(report: &FixReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Fix loop {}: {} cycle(s) in {}s, fixes applied: {}",
        report.final_status,
        report.total_cycles,
        report.duration.as_secs(),
        if report.fixes_applied { "yes" } else { "no" },
    );
    for cycle in &report.cycles {
        let agent = match &cycle.agent_result {
            Some(r) => format!("agent exit {}", r.exit_code),
            None => "agent failed".to_string(),
        };
        let verification = match &cycle.verification {
            Some(v) => format!("verification {}/{} passed", v.passed_count, v.total),
            None => "no verification".to_string(),
        };
        let _ = writeln!(out, "  cycle {}: {agent}, {verification}", cycle.cycle);
    }
    if report.final_status == FixStatus::Failed && report.total_cycles > 0 {
        let _ = writeln!(out, "  findings remain; re-run or fix manually.");
    }
    out
}
