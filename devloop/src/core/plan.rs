//! In-memory plan model: raw source text plus ordered tasks.

use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub description: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, ascending task number as written in the plan.
    pub number: u32,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub subtasks: Vec<Subtask>,
}

impl Task {
    pub fn new(number: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            subtasks: Vec::new(),
        }
    }

    /// Short human label used in log lines and commit messages.
    pub fn label(&self) -> String {
        format!("Task {}: {}", self.number, self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Plan {
    /// Source text the tasks were parsed from.
    pub source: String,
    pub tasks: Vec<Task>,
}

impl Plan {
    pub fn new(source: impl Into<String>, mut tasks: Vec<Task>) -> Self {
        tasks.sort_by_key(|task| task.number);
        Self {
            source: source.into(),
            tasks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Index of the first task not yet completed (resume point for existing plans).
    pub fn first_incomplete_index(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|task| task.status != TaskStatus::Completed)
    }

    /// Index of the next task after `current` that still needs work.
    pub fn next_open_index(&self, current: usize) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .skip(current + 1)
            .find(|(_, task)| !task.status.is_settled())
            .map(|(idx, _)| idx)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    pub fn all_completed(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.status == TaskStatus::Completed)
    }
}
