//! Tasks and their immutable costs.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, UserId};
use crate::error::Error;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task. Tasks are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Open, assigned to a worker.
    Created,
    /// Done. Terminal.
    Completed,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!((self, to), (TaskStatus::Created, TaskStatus::Completed))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub description: String,
    pub author_id: UserId,
    pub assignee_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller supplies to open a task. Assignee and costs are decided by
/// the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    pub description: String,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

/// Prices fixed once at task creation. 1:1 with [`Task`], never updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCost {
    pub task_id: TaskId,
    /// Charged to the assignee on every assignment.
    pub assign_cost: i64,
    /// Paid to the assignee on completion.
    pub complete_cost: i64,
}

impl TaskCost {
    pub const ASSIGN_RANGE: RangeInclusive<i64> = 10..=20;
    pub const COMPLETE_RANGE: RangeInclusive<i64> = 20..=40;

    pub fn is_within_bounds(&self) -> bool {
        Self::ASSIGN_RANGE.contains(&self.assign_cost)
            && Self::COMPLETE_RANGE.contains(&self.complete_cost)
    }
}
