#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-types** – Shared primitive data structures for Bloom.
//!
//! This crate sits at the bottom of the crate graph: the task graph,
//! human-interaction records, and agent-spec shapes that every other
//! Bloom crate depends on. It makes no assumptions about I/O,
//! persistence, or process management — those live in `bloom-store`,
//! `bloom-queue`, and `bloom-agent-runtime` respectively.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod agent_spec;
pub mod task;

pub use agent_spec::{
    AgentSpec, EnvSpec, FlagsSpec, ModeSpec, OutputFormat, OutputSpec, PromptStyle,
};
pub use task::{Step, StepStatus, Task, TaskStatus};

//─────────────────────────────
//  Validation errors
//─────────────────────────────

/// Errors raised while validating a task graph or an individual record.
///
/// Validation failures are data problems, not I/O problems, and are
/// kept distinct from the I/O-facing error kinds elsewhere in the
/// workspace.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Two tasks (possibly nested at different depths) share an id.
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    /// A `dependsOn` entry references an id that doesn't exist anywhere
    /// in the file.
    #[error("task {task} depends on unknown task {depends_on}")]
    UnknownDependency {
        /// The task declaring the dependency.
        task: String,
        /// The missing id it depends on.
        depends_on: String,
    },

    /// The `dependsOn` graph contains a cycle.
    #[error("dependency cycle detected involving task {0}")]
    DependencyCycle(String),

    /// A task's status is inconsistent with the state of its subtasks
    /// or steps (e.g. `done` with an unfinished step).
    #[error("task {task} cannot be {status:?}: {reason}")]
    InconsistentStatus {
        /// The offending task.
        task: String,
        /// The status it claims to have.
        status: TaskStatus,
        /// Why that status is impossible given the task's current data.
        reason: String,
    },

    /// A task id is empty, which is never valid.
    #[error("task id must not be empty")]
    EmptyTaskId,
}

//─────────────────────────────
//  Human-interaction records
//─────────────────────────────

/// Status of a pending or resolved question posed by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    /// Awaiting a human answer.
    Pending,
    /// Answered; `answer`/`answeredAt` are populated.
    Answered,
}

/// A question an agent has asked a human operator, persisted as one
/// JSON file per record under `<bloomDir>/.questions/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Identifier of the form `q-<ms>-<rand6>`.
    pub id: String,
    /// Name of the agent asking the question.
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// Task this question pertains to, if any.
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// The question text.
    pub question: String,
    /// Optional multiple-choice options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// Creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: QuestionStatus,
    /// The human's answer, once provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// When the answer was recorded.
    #[serde(rename = "answeredAt", skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl Question {
    /// Build a new pending question.
    pub fn new(
        id: String,
        agent_name: String,
        question: String,
        task_id: Option<String>,
        options: Option<Vec<String>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            agent_name,
            task_id,
            question,
            options,
            created_at,
            status: QuestionStatus::Pending,
            answer: None,
            answered_at: None,
        }
    }
}

/// Status of an interjection — a human pre-empting a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterjectionStatus {
    /// Waiting for the human to open (and eventually close) the pane.
    Pending,
    /// The human pane closed and the agent was auto-resumed.
    Resumed,
    /// The human declined to take over; no resume will follow.
    Dismissed,
}

/// A human-takeover record, persisted as one JSON file per record
/// under `<bloomDir>/.interjections/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interjection {
    /// Identifier of the form `i-<ms>-<rand6>`.
    pub id: String,
    /// Name of the agent being interjected on.
    #[serde(rename = "agentName")]
    pub agent_name: String,
    /// Task the agent was working on, if any.
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Session id captured at the moment of interjection, for resume.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Working directory the human pane should open in.
    #[serde(rename = "workingDirectory")]
    pub working_directory: String,
    /// Why the human interjected, if given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Creation timestamp.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: InterjectionStatus,
    /// When the human pane closed and the agent resumed.
    #[serde(rename = "resumedAt", skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

impl Interjection {
    /// Build a new pending interjection.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        agent_name: String,
        task_id: Option<String>,
        session_id: Option<String>,
        working_directory: String,
        reason: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            agent_name,
            task_id,
            session_id,
            working_directory,
            reason,
            created_at,
            status: InterjectionStatus::Pending,
            resumed_at: None,
        }
    }
}

//─────────────────────────────
//  Whole-file validation
//─────────────────────────────

/// The full task file: `{ tasks: Task[] }` plus whatever unknown
/// top-level fields the document carried, preserved for round-tripping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    /// All top-level tasks (each may have nested `subtasks`).
    pub tasks: Vec<Task>,
    /// Unrecognized top-level keys, kept so a load-then-save round
    /// trip doesn't silently drop fields tooling doesn't understand.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

/// Flatten the task tree into an id → task reference arena, so
/// dependency and parent/subtask relationships can be resolved as id
/// lookups instead of pointer chasing.
pub fn flatten(tasks: &[Task]) -> Vec<&Task> {
    let mut out = Vec::new();
    fn walk<'a>(tasks: &'a [Task], out: &mut Vec<&'a Task>) {
        for t in tasks {
            out.push(t);
            walk(&t.subtasks, out);
        }
    }
    walk(tasks, &mut out);
    out
}

/// Validate the full set of task graph invariants: unique ids, acyclic
/// `dependsOn`, known references, and the `done`/`ready_for_agent`
/// status preconditions.
pub fn validate(file: &TaskFile) -> Result<(), ValidationError> {
    let all = flatten(&file.tasks);

    let mut seen = HashSet::new();
    for t in &all {
        if t.id.trim().is_empty() {
            return Err(ValidationError::EmptyTaskId);
        }
        if !seen.insert(t.id.as_str()) {
            return Err(ValidationError::DuplicateTaskId(t.id.clone()));
        }
    }

    let by_id: HashMap<&str, &Task> = all.iter().map(|t| (t.id.as_str(), *t)).collect();

    for t in &all {
        for dep in &t.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: t.id.clone(),
                    depends_on: dep.clone(),
                });
            }
        }
    }

    detect_cycles(&by_id)?;

    for t in &all {
        if t.status == TaskStatus::Done {
            if t.subtasks.iter().any(|s| s.status != TaskStatus::Done) {
                return Err(ValidationError::InconsistentStatus {
                    task: t.id.clone(),
                    status: TaskStatus::Done,
                    reason: "not all subtasks are done".to_string(),
                });
            }
            if t.steps.iter().any(|s| s.status != StepStatus::Done) {
                return Err(ValidationError::InconsistentStatus {
                    task: t.id.clone(),
                    status: TaskStatus::Done,
                    reason: "not all steps are done".to_string(),
                });
            }
        }

        if t.status == TaskStatus::ReadyForAgent {
            for dep in &t.depends_on {
                let dep_status = by_id.get(dep.as_str()).map(|d| d.status);
                if !matches!(
                    dep_status,
                    Some(TaskStatus::Done) | Some(TaskStatus::DonePendingMerge)
                ) {
                    return Err(ValidationError::InconsistentStatus {
                        task: t.id.clone(),
                        status: TaskStatus::ReadyForAgent,
                        reason: format!("dependency {dep} is not done"),
                    });
                }
            }
        }

        if t.status == TaskStatus::InProgress && t.session_id.is_none() {
            return Err(ValidationError::InconsistentStatus {
                task: t.id.clone(),
                status: TaskStatus::InProgress,
                reason: "in_progress requires a sessionId".to_string(),
            });
        }
    }

    Ok(())
}

fn detect_cycles(by_id: &HashMap<&str, &Task>) -> Result<(), ValidationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ValidationError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(ValidationError::DependencyCycle(id.to_string())),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(task) = by_id.get(id) {
            for dep in &task.depends_on {
                visit(dep.as_str(), by_id, marks)?;
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for id in by_id.keys() {
        visit(id, by_id, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(id: &str, status: TaskStatus, deps: &[&str]) -> Task {
        Task {
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            status,
            ..Task::new(id.to_string(), "title".to_string())
        }
    }

    #[test]
    fn detects_duplicate_ids() {
        let file = TaskFile {
            tasks: vec![
                task("a", TaskStatus::Todo, &[]),
                task("a", TaskStatus::Todo, &[]),
            ],
            extra: HashMap::new(),
        };
        assert_eq!(
            validate(&file),
            Err(ValidationError::DuplicateTaskId("a".to_string()))
        );
    }

    #[test]
    fn detects_unknown_dependency() {
        let file = TaskFile {
            tasks: vec![task("a", TaskStatus::Todo, &["ghost"])],
            extra: HashMap::new(),
        };
        assert_eq!(
            validate(&file),
            Err(ValidationError::UnknownDependency {
                task: "a".to_string(),
                depends_on: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn detects_cycle() {
        let file = TaskFile {
            tasks: vec![
                task("a", TaskStatus::Todo, &["b"]),
                task("b", TaskStatus::Todo, &["a"]),
            ],
            extra: HashMap::new(),
        };
        assert!(matches!(
            validate(&file),
            Err(ValidationError::DependencyCycle(_))
        ));
    }

    #[test]
    fn ready_for_agent_requires_deps_done() {
        let file = TaskFile {
            tasks: vec![
                task("a", TaskStatus::Todo, &[]),
                task("b", TaskStatus::ReadyForAgent, &["a"]),
            ],
            extra: HashMap::new(),
        };
        assert!(matches!(
            validate(&file),
            Err(ValidationError::InconsistentStatus { .. })
        ));
    }

    #[test]
    fn ready_for_agent_accepts_done_pending_merge() {
        let file = TaskFile {
            tasks: vec![
                task("a", TaskStatus::DonePendingMerge, &[]),
                task("b", TaskStatus::ReadyForAgent, &["a"]),
            ],
            extra: HashMap::new(),
        };
        assert!(validate(&file).is_ok());
    }

    #[test]
    fn done_requires_subtasks_and_steps_done() {
        let mut parent = task("p", TaskStatus::Done, &[]);
        parent.subtasks.push(task("p.1", TaskStatus::Todo, &[]));
        let file = TaskFile {
            tasks: vec![parent],
            extra: HashMap::new(),
        };
        assert!(matches!(
            validate(&file),
            Err(ValidationError::InconsistentStatus { .. })
        ));
    }

    #[test]
    fn question_round_trips_through_json() {
        let q = Question::new(
            "q-1-abcdef".to_string(),
            "claude".to_string(),
            "continue?".to_string(),
            Some("t1".to_string()),
            Some(vec!["y".to_string(), "n".to_string()]),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        );
        let json = serde_json::to_string(&q).unwrap();
        let back: Question = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
    }

    #[test]
    fn flatten_includes_nested_subtasks() {
        let mut parent = task("p", TaskStatus::Todo, &[]);
        parent.subtasks.push(task("p.1", TaskStatus::Todo, &[]));
        let all = flatten(&[parent]);
        assert_eq!(all.len(), 2);
    }
}
