use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Severity of a single finding. Unknown values rank below every known
/// severity so sorting stays stable when an agent invents a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Unknown => 0,
            Severity::Info => 1,
            Severity::Low => 2,
            Severity::Medium => 3,
            Severity::High => 4,
            Severity::Critical => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        }
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Severity::Info,
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.label().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// An agent's judgment about whether the change is acceptable.
/// Blocking dominates changes-needed, which dominates approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Verdict {
    Approved,
    ChangesNeeded,
    Blocking,
    #[default]
    Unknown,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Approved => "APPROVED",
            Verdict::ChangesNeeded => "CHANGES_NEEDED",
            Verdict::Blocking => "BLOCKING",
            Verdict::Unknown => "UNKNOWN",
        }
    }
}

impl From<&str> for Verdict {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVED" => Verdict::Approved,
            "CHANGES_NEEDED" => Verdict::ChangesNeeded,
            "BLOCKING" => Verdict::Blocking,
            _ => Verdict::Unknown,
        }
    }
}

impl From<String> for Verdict {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl From<Verdict> for String {
    fn from(v: Verdict) -> Self {
        v.label().to_string()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single reviewer-surfaced issue at (file, line, category).
///
/// `line` 0 means the finding applies to the whole file. `agent` starts as
/// the reporting agent and is rewritten to the comma-joined attribution
/// list during consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub agent: String,
}

impl Finding {
    /// Composite identifier used to recognize the "same" finding across
    /// agents. Differing categories are distinct even at the same location.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.file, self.line, self.category)
    }
}

/// Structured output of a single review agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReviewResult {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub verdict: Verdict,
}

impl ReviewResult {
    /// Reject output whose verdict or finding severities fall outside the
    /// named values of the agent contract.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.verdict == Verdict::Unknown {
            return Err("verdict must be APPROVED, CHANGES_NEEDED, or BLOCKING".to_string());
        }
        for (i, finding) in self.findings.iter().enumerate() {
            if finding.severity == Severity::Unknown {
                return Err(format!(
                    "finding {} ({}) has an unrecognized severity (expected info, low, medium, high, or critical)",
                    i, finding.file,
                ));
            }
        }
        Ok(())
    }
}

/// The outcome of invoking one agent during an orchestrator run.
#[derive(Debug, Clone)]
pub struct AgentReviewResult {
    pub agent: String,
    pub result: Option<ReviewResult>,
    pub duration: Duration,
    pub error: Option<AgentError>,
    pub raw_output: String,
}

/// A per-agent failure, captured as data instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    pub agent: String,
    pub kind: AgentErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    Prompt,
    Execution,
    RateLimited,
    Exit,
    Parse,
    Validation,
}

impl fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentErrorKind::Prompt => "prompt",
            AgentErrorKind::Execution => "execution",
            AgentErrorKind::RateLimited => "rate_limited",
            AgentErrorKind::Exit => "exit",
            AgentErrorKind::Parse => "parse",
            AgentErrorKind::Validation => "validation",
        };
        f.write_str(label)
    }
}

/// Extract a [`ReviewResult`] from raw agent stdout.
///
/// Accepts bare JSON, JSON wrapped in markdown fences, or a JSON object
/// embedded in surrounding prose; the first object that deserializes wins.
/// Unknown fields are tolerated.
pub fn extract_review_result(raw: &str) -> std::result::Result<ReviewResult, String> {
    let stripped = strip_markdown_fences(raw);
    let first_err = match serde_json::from_str::<ReviewResult>(&stripped) {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };

    // Fall back to scanning for a balanced object anywhere in the output.
    for (i, b) in raw.bytes().enumerate() {
        if b != b'{' {
            continue;
        }
        if let Some(candidate) = balanced_object(raw, i)
            && let Ok(result) = serde_json::from_str::<ReviewResult>(candidate)
        {
            return Ok(result);
        }
    }

    Err(format!("no parsable review JSON in agent output: {first_err}"))
}

/// Return the balanced `{...}` substring starting at `start`, respecting
/// string literals and escapes. `start` must point at a `{` byte.
fn balanced_object(s: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in s.bytes().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove markdown code fences (` ```json ... ``` `) that agents sometimes
/// wrap output in, returning the inner content.
pub fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();

    if let Some(rest) = trimmed.strip_prefix("```") {
        // Skip the optional language tag on the opening fence line
        let after_tag = if let Some(pos) = rest.find('\n') {
            &rest[pos + 1..]
        } else {
            return String::new();
        };

        if let Some(pos) = after_tag.rfind("```") {
            return after_tag[..pos].trim().to_string();
        }
        return after_tag.trim().to_string();
    }

    trimmed.to_string()
}
