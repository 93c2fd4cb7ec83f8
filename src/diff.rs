use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Branch-like strings that reach a git command line are restricted to a
/// conservative character set. Validation lives at this boundary.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Diff("branch name must not be empty".to_string()));
    }
    if name.starts_with("refs/") {
        return Err(Error::Diff(format!(
            "branch name must not start with 'refs/': {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '.' || c == '-')
    {
        return Err(Error::Diff(format!(
            "branch name contains invalid characters (allowed: a-zA-Z0-9/_.-): {name}"
        )));
    }
    Ok(())
}

/// One file of the changed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    /// Git status letter: A, M, D, R, ...
    pub status: String,
    pub high_risk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

/// The changed-file set and unified diff against a base branch.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub files: Vec<ChangedFile>,
    pub full_diff: String,
    pub base_branch: String,
    pub stats: DiffStats,
}

/// Computes the changed-file set for a review run.
pub trait DiffGenerator {
    fn generate(&self, base_branch: &str) -> Result<DiffResult>;
}

/// Git-backed diff generator comparing the working tree against a base
/// branch.
pub struct GitDiff {
    repo_root: PathBuf,
}

impl GitDiff {
    pub fn new(repo_root: PathBuf) -> Self {
        Self { repo_root }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| Error::Diff(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Diff(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DiffGenerator for GitDiff {
    fn generate(&self, base_branch: &str) -> Result<DiffResult> {
        validate_branch_name(base_branch)?;

        let name_status = self.git(&["diff", "--name-status", base_branch])?;
        let files: Vec<ChangedFile> = name_status
            .lines()
            .filter_map(parse_name_status_line)
            .collect();

        let full_diff = self.git(&["diff", base_branch])?;
        let numstat = self.git(&["diff", "--numstat", base_branch])?;
        let stats = parse_numstat(&numstat);

        debug!(
            base_branch,
            files = files.len(),
            insertions = stats.insertions,
            deletions = stats.deletions,
            "diff generated"
        );

        Ok(DiffResult {
            files,
            full_diff,
            base_branch: base_branch.to_string(),
            stats,
        })
    }
}

fn parse_name_status_line(line: &str) -> Option<ChangedFile> {
    let mut parts = line.split('\t');
    let status = parts.next()?.trim();
    // Renames/copies list two paths; review the new one.
    let path = parts.next_back()?.trim();
    if status.is_empty() || path.is_empty() {
        return None;
    }
    Some(ChangedFile {
        path: path.to_string(),
        status: status.chars().take(1).collect(),
        high_risk: is_high_risk(path),
    })
}

fn parse_numstat(numstat: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in numstat.lines() {
        let mut parts = line.split_whitespace();
        let added = parts.next().and_then(|n| n.parse::<usize>().ok());
        let removed = parts.next().and_then(|n| n.parse::<usize>().ok());
        // Binary files report "-" and parse as None.
        stats.files_changed += 1;
        stats.insertions += added.unwrap_or(0);
        stats.deletions += removed.unwrap_or(0);
    }
    stats
}

const HIGH_RISK_MARKERS: &[&str] = &[
    "auth",
    "security",
    "crypto",
    "secret",
    "credential",
    "password",
    "session",
    "permission",
    "sandbox",
];

/// Files whose path suggests security-sensitive content get priority
/// placement when the changed set is split across agents.
pub fn is_high_risk(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    HIGH_RISK_MARKERS.iter().any(|marker| lower.contains(marker))
        || lower.contains("dockerfile")
        || lower.contains(".github/workflows")
}
