//! The durable task graph's node type and its transition table.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The status a [`Task`] can be in. See the transition table enforced
/// by `bloom-store::TaskStore::setStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet ready to run; dependencies may still be outstanding.
    Todo,
    /// Dependencies satisfied, assignable to a worker slot.
    ReadyForAgent,
    /// Claimed by the scheduler but not yet streaming.
    Assigned,
    /// An agent session is actively running against this task.
    InProgress,
    /// Agent succeeded; awaiting an external merge action.
    DonePendingMerge,
    /// Fully complete.
    Done,
    /// Cannot proceed (checkpoint gate, exhausted retries, ...).
    Blocked,
}

impl TaskStatus {
    /// Whether `self -> next` is one of the allowed status transitions.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Todo, ReadyForAgent)
                | (Todo, Blocked)
                | (ReadyForAgent, Assigned)
                | (ReadyForAgent, InProgress)
                | (ReadyForAgent, Blocked)
                | (ReadyForAgent, Todo)
                | (Assigned, InProgress)
                | (Assigned, ReadyForAgent)
                | (Assigned, Blocked)
                | (InProgress, DonePendingMerge)
                | (InProgress, Done)
                | (InProgress, Blocked)
                | (InProgress, ReadyForAgent)
                | (DonePendingMerge, Done)
                | (DonePendingMerge, InProgress)
                | (Blocked, ReadyForAgent)
                | (Blocked, Todo)
                | (Done, InProgress)
        )
    }
}

/// Status of a single [`Step`] within a multi-step task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Todo,
    /// Currently being worked.
    InProgress,
    /// Finished.
    Done,
}

/// One step of a multi-step task. Step ids follow `<taskId>.<n>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier, `<taskId>.<n>`.
    pub id: String,
    /// What the step asks the agent to do.
    pub instruction: String,
    /// Ordered acceptance criteria for this step.
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    /// Current status.
    pub status: StepStatus,
}

/// A node in the task graph. May recursively contain `subtasks`.
///
/// Field names use `camelCase` on the wire (the YAML task file format)
/// but idiomatic `snake_case` in Rust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable, globally-unique identifier (including across subtasks).
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Free-text instructions for the assigned agent.
    #[serde(default)]
    pub instructions: String,
    /// Ordered acceptance criteria.
    #[serde(rename = "acceptanceCriteria", default)]
    pub acceptance_criteria: Vec<String>,
    /// Ordered notes intended to help the agent (not the human log).
    #[serde(rename = "aiNotes", default)]
    pub ai_notes: Vec<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Name of the agent assigned to this task, if any.
    #[serde(rename = "agentName", default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Repository this task operates in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Branch this task operates on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Branch new work should be based from.
    #[serde(rename = "baseBranch", default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Branch completed work should be merged into.
    #[serde(rename = "mergeInto", default, skip_serializing_if = "Option::is_none")]
    pub merge_into: Option<String>,
    /// Ordinal phase number; checkpoints gate on phase ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<i64>,
    /// Whether this task is a phase boundary.
    #[serde(default)]
    pub checkpoint: bool,
    /// Ids of tasks that must be `done`/`done_pending_merge` first.
    #[serde(rename = "dependsOn", default)]
    pub depends_on: BTreeSet<String>,
    /// Nested subtasks, recursively of the same shape.
    #[serde(default)]
    pub subtasks: Vec<Task>,
    /// Ordered steps, if this task is broken down into steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Last agent session id associated with this task.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ordered, timestamped human-readable notes.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Task {
    /// Construct a minimal `todo` task with no dependencies, notes, or
    /// subtasks — convenient for tests and programmatic graph building.
    pub fn new(id: String, title: String) -> Self {
        Self {
            id,
            title,
            instructions: String::new(),
            acceptance_criteria: Vec::new(),
            ai_notes: Vec::new(),
            status: TaskStatus::Todo,
            agent_name: None,
            repo: None,
            branch: None,
            base_branch: None,
            merge_into: None,
            phase: None,
            checkpoint: false,
            depends_on: BTreeSet::new(),
            subtasks: Vec::new(),
            steps: Vec::new(),
            session_id: None,
            notes: Vec::new(),
        }
    }

    /// `hasSteps ⇔ steps.length > 0`.
    pub fn has_steps(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Append a timestamped note in the format the task file expects.
    pub fn append_note(&mut self, text: &str, at: DateTime<Utc>) {
        self.notes.push(format!("[{}] {}", at.to_rfc3339(), text));
    }
}
