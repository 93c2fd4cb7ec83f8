use std::collections::HashMap;
use std::path::PathBuf;

use crate::context::ProjectContext;
use crate::diff::{ChangedFile, DiffResult};
use crate::error::{Error, Result};

const DEFAULT_REVIEW: &str = include_str!("default_prompts/review.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix.md");
const OUTPUT_SCHEMA: &str = include_str!("default_prompts/_output-schema.md");

fn default_template(phase: &str) -> Option<&'static str> {
    match phase {
        "review" => Some(DEFAULT_REVIEW),
        "fix" => Some(DEFAULT_FIX),
        _ => None,
    }
}

/// Prompt template engine with embedded defaults and user overrides.
pub struct PromptEngine {
    override_dir: Option<PathBuf>,
    context: ProjectContext,
}

impl PromptEngine {
    pub fn new(override_dir: Option<PathBuf>, context: ProjectContext) -> Self {
        Self {
            override_dir,
            context,
        }
    }

    /// Load a prompt template for the given phase.
    /// User overrides in `override_dir` take precedence over defaults.
    pub fn load_template(&self, phase: &str) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(format!("{phase}.md"));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }

        default_template(phase)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Prompt(format!("unknown prompt phase: {phase}")))
    }

    /// Load a template and render it with the given variables.
    ///
    /// The output schema, project brief, and coding rules are auto-injected
    /// when not already present in `vars`.
    pub fn render_phase(&self, phase: &str, vars: &HashMap<String, String>) -> Result<String> {
        let template = self.load_template(phase)?;
        let mut all_vars = vars.clone();
        all_vars
            .entry("output_schema".to_string())
            .or_insert_with(|| OUTPUT_SCHEMA.to_string());
        all_vars
            .entry("project_brief".to_string())
            .or_insert_with(|| self.context.brief.clone());
        all_vars
            .entry("coding_rules".to_string())
            .or_insert_with(|| self.context.rules.clone());
        render_template(&template, &all_vars)
    }

    /// Build the review prompt for one agent and its assigned files.
    pub fn build_for_agent(
        &self,
        agent_name: &str,
        diff: &DiffResult,
        files: &[ChangedFile],
        mode: &str,
    ) -> Result<String> {
        let file_list = if files.is_empty() {
            "(no files changed)".to_string()
        } else {
            files
                .iter()
                .map(|f| {
                    if f.high_risk {
                        format!("- {} [{}] (high risk)", f.path, f.status)
                    } else {
                        format!("- {} [{}]", f.path, f.status)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut vars = HashMap::new();
        vars.insert("agent_name".to_string(), agent_name.to_string());
        vars.insert("mode".to_string(), mode.to_string());
        vars.insert("base_branch".to_string(), diff.base_branch.clone());
        vars.insert("file_count".to_string(), files.len().to_string());
        vars.insert("file_list".to_string(), file_list);
        vars.insert("diff".to_string(), diff.full_diff.clone());
        self.render_phase("review", &vars)
    }
}

/// Render a template string using the `upon` template engine.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let engine = upon::Engine::new();
    let compiled = engine
        .compile(template)
        .map_err(|e| Error::Prompt(format!("template compile error: {e}")))?;
    compiled
        .render(
            &engine,
            upon::to_value(vars).map_err(|e| Error::Prompt(e.to_string()))?,
        )
        .to_string()
        .map_err(|e| Error::Prompt(format!("template render error: {e}")))
}
