//! Core task type: one node in the delegation tree.
//!
//! # Invariants
//! - `depth == 0` iff `parent_id` is `None`
//! - `cost_nanos` is monotonically non-decreasing; a parent's total includes
//!   the cascaded cost of every terminated child, added exactly once
//! - a terminal row is never mutated again except by the cost cascade

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Queued -> Classifying -> InProgress -> Completed
///                                    \-> Failed
///                                    \-> Stalled
///                                    \-> Checkpoint -> InProgress (approved)
///                                                  \-> Failed     (rejected)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet classified
    Queued,
    /// Tier/model selection in flight
    Classifying,
    /// The execution loop is running
    InProgress,
    /// Suspended, waiting for operator approval or redirection
    Checkpoint,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Halted by a budget or daily-spend guard
    Stalled,
}

impl TaskStatus {
    /// Check if the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stalled
        )
    }

    /// Check if the task is suspended awaiting an external resume.
    pub fn is_suspended(&self) -> bool {
        matches!(self, TaskStatus::Checkpoint)
    }

    /// Check if work is (or is about to be) happening for this task.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Classifying | TaskStatus::InProgress
        )
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Classifying)
                | (Classifying, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Stalled)
                | (InProgress, Checkpoint)
                | (Checkpoint, InProgress)
                | (Checkpoint, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Classifying => "classifying",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Checkpoint => "checkpoint",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stalled => "stalled",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "classifying" => Some(TaskStatus::Classifying),
            "in_progress" => Some(TaskStatus::InProgress),
            "checkpoint" => Some(TaskStatus::Checkpoint),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "stalled" => Some(TaskStatus::Stalled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a node in the delegation tree, decided once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    /// Decomposes work by delegating bounded subtasks
    Planner,
    /// Executes directly with tools
    Worker,
}

impl TaskRole {
    pub fn is_planner(&self) -> bool {
        matches!(self, TaskRole::Planner)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRole::Planner => "planner",
            TaskRole::Worker => "worker",
        }
    }

    /// Parse a stored role string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(TaskRole::Planner),
            "worker" => Some(TaskRole::Worker),
            _ => None,
        }
    }
}

/// One node in the delegation tree, as stored in the repository.
///
/// Rows are never deleted; terminal and suspended rows are the permanent
/// audit trail of the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Back-reference to the delegating parent; `None` only for roots
    pub parent_id: Option<TaskId>,
    /// 0 for roots; child depth = parent depth + 1
    pub depth: u8,
    pub status: TaskStatus,
    pub role: TaskRole,
    pub description: String,
    /// Model chosen at classification time
    pub model: Option<String>,
    pub step_count: u32,
    pub max_steps: u32,
    /// USD ceiling in nanodollars, assigned at creation
    pub budget_nanos: u64,
    /// USD spent so far in nanodollars, including cascaded child costs
    pub cost_nanos: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    /// Budget not yet consumed by this node (including cascaded children).
    pub fn remaining_budget(&self) -> u64 {
        self.budget_nanos.saturating_sub(self.cost_nanos)
    }

    /// Whether this node was created by a delegation tool call.
    pub fn is_subtask(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Parameters for creating a task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub description: String,
    pub parent_id: Option<TaskId>,
    pub depth: u8,
    pub role: TaskRole,
    pub budget_nanos: u64,
    pub max_steps: u32,
}

impl NewTask {
    /// A root task at depth 0.
    pub fn root(description: impl Into<String>, role: TaskRole, budget_nanos: u64, max_steps: u32) -> Self {
        Self {
            description: description.into(),
            parent_id: None,
            depth: 0,
            role,
            budget_nanos,
            max_steps,
        }
    }

    /// A delegated child one level below its parent.
    pub fn child(
        description: impl Into<String>,
        parent_id: TaskId,
        parent_depth: u8,
        budget_nanos: u64,
        max_steps: u32,
    ) -> Self {
        Self {
            description: description.into(),
            parent_id: Some(parent_id),
            depth: parent_depth + 1,
            role: TaskRole::Worker,
            budget_nanos,
            max_steps,
        }
    }
}
