use std::path::Path;

use tracing::debug;

/// Project-supplied context injected into prompts: a short brief about the
/// codebase and the team's coding rules. Both are optional files under
/// `.raven/` in the repository root.
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub brief: String,
    pub rules: String,
}

impl ProjectContext {
    pub fn load(repo_root: &Path) -> Self {
        let context = Self {
            brief: read_optional(repo_root, "brief.md"),
            rules: read_optional(repo_root, "rules.md"),
        };
        debug!(
            brief_bytes = context.brief.len(),
            rules_bytes = context.rules.len(),
            "project context loaded"
        );
        context
    }
}

fn read_optional(repo_root: &Path, name: &str) -> String {
    std::fs::read_to_string(repo_root.join(".raven").join(name)).unwrap_or_default()
}
