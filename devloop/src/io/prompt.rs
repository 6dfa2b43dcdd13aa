//! Prompt builder for agent calls.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections go first
//! and the last section is truncated as a final resort.

use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::interview::INTERVIEW_COMPLETE_SENTINEL;
use crate::core::plan::{Plan, Task};
use crate::core::types::{CallPurpose, TaskStatus};

/// Marker a review analysis returns when no fix call is needed.
pub const NO_ISSUES_MARKER: &str = "NO_ISSUES_FOUND";

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 60_000;

const TEMPLATES: [(CallPurpose, &str, &str); 9] = [
    (
        CallPurpose::Interview,
        "interview",
        include_str!("prompts/interview.md"),
    ),
    (
        CallPurpose::PlanGeneration,
        "plan",
        include_str!("prompts/plan.md"),
    ),
    (
        CallPurpose::PlanRewrite,
        "rewrite_plan",
        include_str!("prompts/rewrite_plan.md"),
    ),
    (
        CallPurpose::Implementation,
        "implement",
        include_str!("prompts/implement.md"),
    ),
    (
        CallPurpose::ReviewAnalysis,
        "review",
        include_str!("prompts/review.md"),
    ),
    (
        CallPurpose::ReviewFix,
        "review_fix",
        include_str!("prompts/review_fix.md"),
    ),
    (
        CallPurpose::TestWriting,
        "tests",
        include_str!("prompts/tests.md"),
    ),
    (
        CallPurpose::HandoffCommit,
        "handoff_commit",
        include_str!("prompts/handoff_commit.md"),
    ),
    (
        CallPurpose::HandoffSummary,
        "handoff_summary",
        include_str!("prompts/handoff_summary.md"),
    ),
];

fn template_name(purpose: CallPurpose) -> &'static str {
    TEMPLATES
        .iter()
        .find(|(p, _, _)| *p == purpose)
        .map(|(_, name, _)| *name)
        .unwrap_or("implement")
}

fn needs_task(purpose: CallPurpose) -> bool {
    !matches!(
        purpose,
        CallPurpose::Interview | CallPurpose::PlanGeneration | CallPurpose::PlanRewrite
    )
}

#[derive(Debug, Clone, Serialize)]
struct StepContext {
    description: String,
    done: bool,
}

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    number: u32,
    title: String,
    description: String,
    subtasks: Vec<StepContext>,
}

impl TaskContext {
    fn from_task(task: &Task) -> Self {
        Self {
            number: task.number,
            title: task.title.clone(),
            description: task.description.clone(),
            subtasks: task
                .subtasks
                .iter()
                .map(|s| StepContext {
                    description: s.description.clone(),
                    done: s.done,
                })
                .collect(),
        }
    }
}

/// Everything a template may draw on. Unused fields are ignored per purpose.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub feature: String,
    /// Interview transcript (`Q:`/`A:` pairs).
    pub transcript: Option<String>,
    /// Answers to questions raised by the previous call.
    pub answers: Option<String>,
    pub task: Option<Task>,
    /// Raw plan text for the rewrite step.
    pub plan_source: Option<String>,
    /// One line per task with its status.
    pub outline: Option<String>,
    /// Summary seeded after a context handoff.
    pub continuation: Option<String>,
    /// Review analysis handed to the fix call.
    pub findings: Option<String>,
    /// Error from the previous failed attempt at this task.
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let stop = markers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*end..stop].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop order: outline -> transcript -> failure.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in ["outline", "transcript", "failure"] {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let other_len = total - last.content.len();
    let mut allowed = budget.saturating_sub(other_len);
    let marker = "\n[truncated]";
    let with_marker = allowed > marker.len();
    if with_marker {
        allowed -= marker.len();
    }
    while !last.content.is_char_boundary(allowed) {
        allowed -= 1;
    }
    let before_len = last.content.len();
    last.content.truncate(allowed);
    if with_marker {
        last.content.push_str(marker);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders per-purpose prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        for (_, name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("bundled prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    pub fn build(&self, purpose: CallPurpose, input: &PromptInputs) -> Result<String> {
        let task = input.task.as_ref().map(TaskContext::from_task);
        if needs_task(purpose) && task.is_none() {
            return Err(anyhow!("{purpose:?} prompt requires a selected task"));
        }
        let clean = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let template = self.env.get_template(template_name(purpose))?;
        let rendered = template.render(context! {
            sentinel => INTERVIEW_COMPLETE_SENTINEL,
            no_issues => NO_ISSUES_MARKER,
            feature => input.feature.trim(),
            transcript => clean(&input.transcript),
            answers => clean(&input.answers),
            task => task,
            plan_source => clean(&input.plan_source),
            outline => clean(&input.outline),
            continuation => clean(&input.continuation),
            findings => clean(&input.findings),
            failure => clean(&input.failure),
        })?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

/// One line per task: `[x] Task 1: Title` (completed), `[-]` skipped, `[!]` failed.
pub fn plan_outline(plan: &Plan) -> String {
    plan.tasks
        .iter()
        .map(|task| {
            let mark = match task.status {
                TaskStatus::Completed => "x",
                TaskStatus::Skipped => "-",
                TaskStatus::Failed => "!",
                TaskStatus::InProgress => ">",
                TaskStatus::Pending => " ",
            };
            format!("[{mark}] {}", task.label())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
