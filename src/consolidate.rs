use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::review_schema::{AgentReviewResult, Finding, Severity, Verdict};

/// The deduplicated, severity-escalated output of one orchestrator run.
#[derive(Debug, Clone)]
pub struct ConsolidatedReview {
    pub findings: Vec<Finding>,
    pub verdict: Verdict,
    pub agent_results: Vec<AgentReviewResult>,
    pub total_agents: usize,
    pub duration: Duration,
}

/// Bookkeeping produced alongside a [`ConsolidatedReview`].
#[derive(Debug, Clone, Default)]
pub struct ConsolidationStats {
    pub total_input_findings: usize,
    pub unique_findings: usize,
    pub duplicates_removed: usize,
    pub severity_escalations: usize,
    /// Percentage of unique findings reported by more than one agent.
    pub overlap_rate: f64,
    pub findings_per_agent: BTreeMap<String, usize>,
    pub findings_per_severity: BTreeMap<String, usize>,
}

struct MergedFinding {
    finding: Finding,
    agents: Vec<String>,
}

/// Merge per-agent review results into a single deduplicated review.
///
/// Agents that errored or returned no result contribute a CHANGES_NEEDED
/// verdict and no findings. Never fails: every malformed input degrades to
/// data in the stats. The returned review's `duration` is left at zero for
/// the caller to stamp.
pub fn consolidate(results: &[AgentReviewResult]) -> (ConsolidatedReview, ConsolidationStats) {
    let mut stats = ConsolidationStats::default();
    let mut verdicts: Vec<Verdict> = Vec::with_capacity(results.len());
    let mut merged: HashMap<String, MergedFinding> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for agent_result in results {
        let usable = if agent_result.error.is_some() {
            None
        } else {
            agent_result.result.as_ref()
        };
        let Some(result) = usable else {
            verdicts.push(Verdict::ChangesNeeded);
            stats
                .findings_per_agent
                .entry(agent_result.agent.clone())
                .or_insert(0);
            continue;
        };

        verdicts.push(result.verdict);
        *stats
            .findings_per_agent
            .entry(agent_result.agent.clone())
            .or_insert(0) += result.findings.len();

        for finding in &result.findings {
            stats.total_input_findings += 1;
            let key = finding.dedup_key();
            match merged.get_mut(&key) {
                None => {
                    let mut stored = finding.clone();
                    stored.agent = agent_result.agent.clone();
                    order.push(key.clone());
                    merged.insert(
                        key,
                        MergedFinding {
                            finding: stored,
                            agents: vec![agent_result.agent.clone()],
                        },
                    );
                }
                Some(entry) => {
                    stats.duplicates_removed += 1;
                    if finding.severity.rank() > entry.finding.severity.rank() {
                        entry.finding.severity = finding.severity;
                        stats.severity_escalations += 1;
                    }
                    entry.finding.description =
                        merge_descriptions(&entry.finding.description, &finding.description);
                    entry.agents.push(agent_result.agent.clone());
                }
            }
        }
    }

    let mut findings: Vec<Finding> = Vec::with_capacity(order.len());
    let mut multi_agent = 0usize;
    for key in &order {
        let Some(entry) = merged.remove(key) else {
            continue;
        };
        let mut finding = entry.finding;
        finding.agent = entry.agents.join(", ");
        if entry.agents.len() > 1 {
            multi_agent += 1;
        }
        *stats
            .findings_per_severity
            .entry(finding.severity.label().to_string())
            .or_insert(0) += 1;
        findings.push(finding);
    }

    stats.unique_findings = findings.len();
    stats.overlap_rate = if findings.is_empty() {
        0.0
    } else {
        multi_agent as f64 / findings.len() as f64 * 100.0
    };

    findings.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.line.cmp(&b.line))
    });

    let review = ConsolidatedReview {
        findings,
        verdict: aggregate_verdicts(&verdicts),
        agent_results: results.to_vec(),
        total_agents: results.len(),
        duration: Duration::ZERO,
    };
    (review, stats)
}

/// Fold verdicts under BLOCKING > CHANGES_NEEDED > APPROVED.
/// Empty input approves; unknown values are ignored.
pub fn aggregate_verdicts(verdicts: &[Verdict]) -> Verdict {
    let mut aggregated = Verdict::Approved;
    for verdict in verdicts {
        match verdict {
            Verdict::Blocking => return Verdict::Blocking,
            Verdict::ChangesNeeded => aggregated = Verdict::ChangesNeeded,
            Verdict::Approved | Verdict::Unknown => {}
        }
    }
    aggregated
}

/// Keep the higher-ranked severity. Never downgrades.
pub fn escalate(a: Severity, b: Severity) -> Severity {
    if b.rank() > a.rank() { b } else { a }
}

const MERGE_NOTE_LIMIT: usize = 120;

/// Merge two descriptions of the same finding.
///
/// Identical or empty inputs collapse to the non-empty one; a secondary
/// contained in the primary is dropped; otherwise the longer survives and
/// the shorter is appended as a truncated note.
pub fn merge_descriptions(primary: &str, secondary: &str) -> String {
    let primary = primary.trim();
    let secondary = secondary.trim();
    if primary.is_empty() {
        return secondary.to_string();
    }
    if secondary.is_empty() || primary == secondary {
        return primary.to_string();
    }
    if primary.contains(secondary) {
        return primary.to_string();
    }
    let (kept, note) = if primary.len() >= secondary.len() {
        (primary, secondary)
    } else {
        (secondary, primary)
    };
    format!("{kept}\nAdditional note: {}", truncate_note(note))
}

fn truncate_note(note: &str) -> String {
    if note.len() <= MERGE_NOTE_LIMIT {
        return note.to_string();
    }
    let mut end = MERGE_NOTE_LIMIT;
    while end > 0 && !note.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &note[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review_schema::ReviewResult;
    use std::time::Duration;

    fn finding(sev: Severity, file: &str, line: u32, category: &str, desc: &str) -> Finding {
        Finding {
            severity: sev,
            category: category.to_string(),
            file: file.to_string(),
            line,
            description: desc.to_string(),
            suggestion: String::new(),
            agent: String::new(),
        }
    }

    fn agent_ok(agent: &str, verdict: Verdict, findings: Vec<Finding>) -> AgentReviewResult {
        AgentReviewResult {
            agent: agent.to_string(),
            result: Some(ReviewResult { findings, verdict }),
            duration: Duration::from_millis(10),
            error: None,
            raw_output: String::new(),
        }
    }

    fn agent_err(agent: &str) -> AgentReviewResult {
        AgentReviewResult {
            agent: agent.to_string(),
            result: None,
            duration: Duration::from_millis(10),
            error: Some(crate::review_schema::AgentError {
                agent: agent.to_string(),
                kind: crate::review_schema::AgentErrorKind::Execution,
                message: "boom".to_string(),
            }),
            raw_output: String::new(),
        }
    }

    #[test]
    fn test_empty_input_approves() {
        let (review, stats) = consolidate(&[]);
        assert_eq!(review.verdict, Verdict::Approved);
        assert_eq!(review.total_agents, 0);
        assert!(review.findings.is_empty());
        assert_eq!(stats.total_input_findings, 0);
        assert_eq!(stats.overlap_rate, 0.0);
    }

    #[test]
    fn test_dedup_and_escalate() {
        let a = agent_ok(
            "claude",
            Verdict::ChangesNeeded,
            vec![finding(Severity::Medium, "auth.go", 42, "security", "injection risk")],
        );
        let b = agent_ok(
            "codex",
            Verdict::ChangesNeeded,
            vec![finding(Severity::Critical, "auth.go", 42, "security", "injection risk")],
        );
        let (review, stats) = consolidate(&[a, b]);
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].severity, Severity::Critical);
        assert_eq!(review.findings[0].agent, "claude, codex");
        assert_eq!(stats.total_input_findings, 2);
        assert_eq!(stats.unique_findings, 1);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.severity_escalations, 1);
        assert_eq!(stats.overlap_rate, 100.0);
    }

    #[test]
    fn test_lower_duplicate_does_not_downgrade() {
        let a = agent_ok(
            "claude",
            Verdict::Blocking,
            vec![finding(Severity::Critical, "a.rs", 1, "bug", "x")],
        );
        let b = agent_ok(
            "codex",
            Verdict::Approved,
            vec![finding(Severity::Info, "a.rs", 1, "bug", "x")],
        );
        let (review, stats) = consolidate(&[a, b]);
        assert_eq!(review.findings[0].severity, Severity::Critical);
        assert_eq!(stats.severity_escalations, 0);
        assert_eq!(stats.duplicates_removed, 1);
    }

    #[test]
    fn test_total_equals_unique_plus_duplicates() {
        let a = agent_ok(
            "claude",
            Verdict::Approved,
            vec![
                finding(Severity::Low, "a.rs", 1, "style", "one"),
                finding(Severity::Low, "b.rs", 2, "style", "two"),
            ],
        );
        let b = agent_ok(
            "codex",
            Verdict::Approved,
            vec![
                finding(Severity::Low, "a.rs", 1, "style", "one"),
                finding(Severity::Low, "c.rs", 3, "style", "three"),
            ],
        );
        let (_, stats) = consolidate(&[a, b]);
        assert_eq!(
            stats.total_input_findings,
            stats.unique_findings + stats.duplicates_removed
        );
        assert_eq!(stats.total_input_findings, 4);
        assert_eq!(stats.unique_findings, 3);
    }

    #[test]
    fn test_same_location_different_category_distinct() {
        let a = agent_ok(
            "claude",
            Verdict::Approved,
            vec![
                finding(Severity::Low, "a.rs", 5, "style", "x"),
                finding(Severity::Low, "a.rs", 5, "security", "y"),
            ],
        );
        let (review, stats) = consolidate(&[a]);
        assert_eq!(review.findings.len(), 2);
        assert_eq!(stats.duplicates_removed, 0);
    }

    #[test]
    fn test_errored_agent_contributes_changes_needed() {
        let (review, stats) = consolidate(&[agent_err("gemini")]);
        assert_eq!(review.verdict, Verdict::ChangesNeeded);
        assert!(review.findings.is_empty());
        assert_eq!(stats.findings_per_agent.get("gemini"), Some(&0));
    }

    #[test]
    fn test_missing_result_contributes_changes_needed() {
        let result = AgentReviewResult {
            agent: "claude".to_string(),
            result: None,
            duration: Duration::ZERO,
            error: None,
            raw_output: String::new(),
        };
        let (review, _) = consolidate(&[result]);
        assert_eq!(review.verdict, Verdict::ChangesNeeded);
    }

    #[test]
    fn test_verdict_precedence() {
        let results = vec![
            agent_ok("claude", Verdict::Approved, vec![]),
            agent_ok("codex", Verdict::Blocking, vec![]),
            agent_err("gemini"),
        ];
        let (review, _) = consolidate(&results);
        assert_eq!(review.verdict, Verdict::Blocking);
        assert_eq!(review.total_agents, 3);
        assert_eq!(review.agent_results.len(), 3);
    }

    #[test]
    fn test_aggregate_verdicts_rules() {
        use Verdict::*;
        assert_eq!(aggregate_verdicts(&[]), Approved);
        assert_eq!(aggregate_verdicts(&[Approved, Approved]), Approved);
        assert_eq!(aggregate_verdicts(&[Approved, ChangesNeeded]), ChangesNeeded);
        assert_eq!(aggregate_verdicts(&[ChangesNeeded, Blocking, Approved]), Blocking);
        assert_eq!(aggregate_verdicts(&[Unknown]), Approved);
        assert_eq!(aggregate_verdicts(&[Unknown, ChangesNeeded]), ChangesNeeded);
    }

    #[test]
    fn test_escalate_never_downgrades() {
        let all = [
            Severity::Unknown,
            Severity::Info,
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ];
        for a in all {
            for b in all {
                assert!(escalate(a, b).rank() >= a.rank());
                assert_eq!(escalate(a, b).rank(), escalate(b, a).rank());
            }
        }
    }

    #[test]
    fn test_sort_order() {
        let a = agent_ok(
            "claude",
            Verdict::ChangesNeeded,
            vec![
                finding(Severity::Low, "z.rs", 1, "style", "low z"),
                finding(Severity::Critical, "b.rs", 9, "bug", "crit b"),
                finding(Severity::Critical, "a.rs", 30, "bug", "crit a30"),
                finding(Severity::Critical, "a.rs", 2, "race", "crit a2"),
            ],
        );
        let (review, _) = consolidate(&[a]);
        let keys: Vec<(u8, &str, u32)> = review
            .findings
            .iter()
            .map(|f| (f.severity.rank(), f.file.as_str(), f.line))
            .collect();
        assert_eq!(
            keys,
            vec![
                (5, "a.rs", 2),
                (5, "a.rs", 30),
                (5, "b.rs", 9),
                (2, "z.rs", 1),
            ]
        );
    }

    #[test]
    fn test_attribution_insertion_order() {
        let shared = finding(Severity::High, "m.rs", 7, "bug", "shared");
        let results = vec![
            agent_ok("gemini", Verdict::ChangesNeeded, vec![shared.clone()]),
            agent_ok("claude", Verdict::ChangesNeeded, vec![shared.clone()]),
            agent_ok("codex", Verdict::ChangesNeeded, vec![shared]),
        ];
        let (review, _) = consolidate(&results);
        assert_eq!(review.findings[0].agent, "gemini, claude, codex");
    }

    #[test]
    fn test_same_agent_duplicate_appends_twice() {
        // An agent reporting the same key twice is attributed twice; the
        // finding then counts as multi-agent for the overlap rate.
        let a = agent_ok(
            "claude",
            Verdict::ChangesNeeded,
            vec![
                finding(Severity::Low, "a.rs", 1, "style", "x"),
                finding(Severity::Low, "a.rs", 1, "style", "x"),
            ],
        );
        let (review, stats) = consolidate(&[a]);
        assert_eq!(review.findings[0].agent, "claude, claude");
        assert_eq!(stats.overlap_rate, 100.0);
    }

    #[test]
    fn test_overlap_rate_bounds() {
        let a = agent_ok(
            "claude",
            Verdict::Approved,
            vec![
                finding(Severity::Low, "a.rs", 1, "style", "x"),
                finding(Severity::Low, "b.rs", 2, "style", "y"),
            ],
        );
        let b = agent_ok(
            "codex",
            Verdict::Approved,
            vec![finding(Severity::Low, "a.rs", 1, "style", "x")],
        );
        let (_, stats) = consolidate(&[a, b]);
        assert!(stats.overlap_rate >= 0.0 && stats.overlap_rate <= 100.0);
        assert_eq!(stats.overlap_rate, 50.0);
    }

    #[test]
    fn test_per_agent_and_per_severity_counts() {
        let a = agent_ok(
            "claude",
            Verdict::ChangesNeeded,
            vec![
                finding(Severity::High, "a.rs", 1, "bug", "x"),
                finding(Severity::Low, "b.rs", 2, "style", "y"),
            ],
        );
        let b = agent_ok(
            "codex",
            Verdict::Approved,
            vec![finding(Severity::High, "a.rs", 1, "bug", "x")],
        );
        let (_, stats) = consolidate(&[a, b]);
        assert_eq!(stats.findings_per_agent.get("claude"), Some(&2));
        assert_eq!(stats.findings_per_agent.get("codex"), Some(&1));
        assert_eq!(stats.findings_per_severity.get("high"), Some(&1));
        assert_eq!(stats.findings_per_severity.get("low"), Some(&1));
    }

    #[test]
    fn test_merge_identical_descriptions() {
        assert_eq!(merge_descriptions("same", "same"), "same");
        assert_eq!(merge_descriptions("  same  ", "same"), "same");
    }

    #[test]
    fn test_merge_empty_descriptions() {
        assert_eq!(merge_descriptions("", "only"), "only");
        assert_eq!(merge_descriptions("only", ""), "only");
        assert_eq!(merge_descriptions("", ""), "");
    }

    #[test]
    fn test_merge_substring_keeps_primary() {
        let primary = "buffer overflow when input exceeds 4096 bytes";
        assert_eq!(merge_descriptions(primary, "buffer overflow"), primary);
    }

    #[test]
    fn test_merge_appends_additional_note() {
        let merged = merge_descriptions("short one", "a rather different and much longer description");
        assert!(merged.starts_with("a rather different and much longer description"));
        assert!(merged.contains("\nAdditional note: short one"));
    }

    #[test]
    fn test_merge_truncates_long_note() {
        let secondary = "s".repeat(200);
        let primary = "p".repeat(300);
        let merged = merge_descriptions(&primary, &secondary);
        let note = merged.split("Additional note: ").nth(1).unwrap();
        assert_eq!(note.len(), 123); // 120 bytes + "..."
        assert!(note.ends_with("..."));
    }

    #[test]
    fn test_merge_note_truncation_respects_char_boundary() {
        let secondary = "é".repeat(100); // 200 bytes of two-byte chars
        let merged = merge_descriptions(&"p".repeat(300), &secondary);
        assert!(merged.contains("Additional note: "));
        // Must not panic and must stay valid UTF-8 (implicit in String).
    }
}
