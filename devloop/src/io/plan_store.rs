//! Markdown plan parsing, serialization, and persistence.
//!
//! Grammar (one block per task, in any order):
//!
//! ```text
//! ## Task 1: Title
//! **Description:** what to do
//! **Status:** in_progress        (optional; pending when absent)
//! - [ ] open subtask
//! - [x] finished subtask
//! ```

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::plan::{Plan, Subtask, Task};
use crate::core::types::TaskStatus;

static TASK_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^##\s+Task\s+(\d+)\s*:\s*(.*?)\s*$").expect("task heading regex")
});
static DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\*\*Description:\*\*\s*(.*?)\s*$").expect("description regex")
});
static STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\*\*Status:\*\*\s*(\w+)").expect("status regex"));
static CHECKLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(.*?)\s*$").expect("checklist regex")
});

pub trait PlanParser: Send + Sync {
    /// Parse plan text. Text without any task block yields an empty plan.
    fn parse(&self, text: &str) -> Plan;
    fn serialize(&self, plan: &Plan) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownPlanParser;

struct Block {
    task: Task,
    description: Vec<String>,
    in_description: bool,
}

impl Block {
    fn finish(self) -> Task {
        let mut task = self.task;
        task.description = self.description.join("\n").trim().to_string();
        task
    }
}

impl PlanParser for MarkdownPlanParser {
    fn parse(&self, text: &str) -> Plan {
        let mut tasks = Vec::new();
        let mut current: Option<Block> = None;

        for line in text.lines() {
            if let Some(caps) = TASK_HEADING.captures(line) {
                let Ok(number) = caps[1].parse::<u32>() else {
                    continue;
                };
                if let Some(block) = current.take() {
                    tasks.push(block.finish());
                }
                current = Some(Block {
                    task: Task::new(number, &caps[2], ""),
                    description: Vec::new(),
                    in_description: false,
                });
                continue;
            }
            if line.starts_with('#') {
                // Unrelated heading ends the block.
                if let Some(block) = current.take() {
                    tasks.push(block.finish());
                }
                continue;
            }
            let Some(block) = current.as_mut() else {
                continue;
            };
            if let Some(caps) = CHECKLIST.captures(line) {
                block.in_description = false;
                block.task.subtasks.push(Subtask {
                    description: caps[2].to_string(),
                    done: !caps[1].trim().is_empty(),
                });
            } else if let Some(caps) = STATUS.captures(line) {
                block.in_description = false;
                if let Some(status) = parse_status(&caps[1]) {
                    block.task.status = status;
                }
            } else if let Some(caps) = DESCRIPTION.captures(line) {
                block.in_description = true;
                block.description.push(caps[1].to_string());
            } else if line.trim().is_empty() {
                block.in_description = false;
            } else if block.in_description || block.description.is_empty() {
                block.in_description = true;
                block.description.push(line.trim().to_string());
            }
        }
        if let Some(block) = current {
            tasks.push(block.finish());
        }

        Plan::new(text, tasks)
    }

    fn serialize(&self, plan: &Plan) -> String {
        let mut out = String::from("# Implementation Plan\n");
        for task in &plan.tasks {
            out.push_str(&format!("\n## Task {}: {}\n", task.number, task.title));
            if !task.description.is_empty() {
                out.push_str(&format!("**Description:** {}\n", task.description));
            }
            if task.status != TaskStatus::Pending {
                out.push_str(&format!("**Status:** {}\n", status_name(task.status)));
            }
            for subtask in &task.subtasks {
                let mark = if subtask.done { 'x' } else { ' ' };
                out.push_str(&format!("- [{mark}] {}\n", subtask.description));
            }
        }
        out
    }
}

fn parse_status(raw: &str) -> Option<TaskStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" => Some(TaskStatus::Pending),
        "in_progress" | "inprogress" => Some(TaskStatus::InProgress),
        "completed" | "done" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        "skipped" => Some(TaskStatus::Skipped),
        _ => None,
    }
}

fn status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Skipped => "skipped",
    }
}

/// Read and parse a plan file.
pub fn load_plan(path: &Path, parser: &dyn PlanParser) -> Result<Plan> {
    let text = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    Ok(parser.parse(&text))
}

/// Serialize and write a plan file (temp file + rename).
pub fn save_plan(path: &Path, plan: &Plan, parser: &dyn PlanParser) -> Result<()> {
    let text = parser.serialize(plan);
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, text).with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Plan

Some preamble the parser ignores.

## Task 2: Add storage
**Description:** Persist sessions
across restarts.
- [ ] Define schema
- [X] Write migration

## Task 1: Scaffold crate
**Description:** Create the workspace.
**Status:** completed
* [x] cargo new
";

    #[test]
    fn parses_blocks_sorted_by_number() {
        let plan = MarkdownPlanParser.parse(SAMPLE);
        assert_eq!(plan.tasks.len(), 2);
        let first = &plan.tasks[0];
        assert_eq!(first.number, 1);
        assert_eq!(first.title, "Scaffold crate");
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(first.subtasks.len(), 1);

        let second = &plan.tasks[1];
        assert_eq!(second.description, "Persist sessions\nacross restarts.");
        assert_eq!(second.status, TaskStatus::Pending);
        assert!(!second.subtasks[0].done);
        assert!(second.subtasks[1].done, "uppercase X counts as done");
        assert_eq!(plan.source, SAMPLE);
    }

    #[test]
    fn text_without_task_blocks_is_empty() {
        let plan = MarkdownPlanParser.parse("# Plan\n\nNothing structured here.\n- [ ] stray\n");
        assert!(plan.is_empty());
    }

    #[test]
    fn unrelated_heading_closes_block() {
        let plan =
            MarkdownPlanParser.parse("## Task 1: A\n**Description:** a\n## Notes\n- [ ] not a subtask\n");
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.tasks[0].subtasks.is_empty());
    }

    #[test]
    fn serialize_then_parse_keeps_status_and_subtasks() {
        let mut plan = MarkdownPlanParser.parse(SAMPLE);
        plan.tasks[1].status = TaskStatus::Skipped;
        let text = MarkdownPlanParser.serialize(&plan);
        let reparsed = MarkdownPlanParser.parse(&text);
        assert_eq!(reparsed.tasks, plan.tasks);
    }

    #[test]
    fn save_and_load_plan_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("PLAN.md");
        let plan = MarkdownPlanParser.parse(SAMPLE);
        save_plan(&path, &plan, &MarkdownPlanParser).expect("save");
        let loaded = load_plan(&path, &MarkdownPlanParser).expect("load");
        assert_eq!(loaded.tasks, plan.tasks);
    }

    #[test]
    fn missing_plan_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_plan(&temp.path().join("PLAN.md"), &MarkdownPlanParser).is_err());
    }
}
