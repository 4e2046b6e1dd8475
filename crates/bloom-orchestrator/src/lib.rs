#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-orchestrator** – the control loop that matches ready tasks
//! to worker slots, drives each through a single agent run, and
//! interprets the result back into a task-state transition.
//!
//! The crate is split into:
//!
//! - [`scheduler`] — [`Scheduler`], the scheduling loop and per-task
//!   worker algorithm.
//! - [`repo`] — the [`repo::RepoManager`] collaborator trait plus a
//!   filesystem-only default implementation.
//! - [`prompt`] — the [`prompt::PromptAssembler`] collaborator trait
//!   plus a minimal default implementation.
//!
//! No module here provisions real git worktrees or renders markdown
//! prompt templates — both remain external collaborators; the traits
//! exist so the scheduler can be built and tested against them.

pub mod prompt;
pub mod repo;
pub mod scheduler;

#[cfg(any(test, feature = "testing"))]
pub mod testkit;

pub use prompt::{PromptAssembler, TemplatePromptAssembler};
pub use repo::{FixedDirRepoManager, FsRepoManager, RepoManager};
pub use scheduler::Scheduler;

/// Errors the orchestrator's public operations can surface.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A `TaskStore` operation failed.
    #[error("task store error: {0}")]
    Store(#[from] bloom_store::StoreError),

    /// A task id was referenced that doesn't exist in the tree.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// An agent name was referenced with no registered `AgentSpec`.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// An interjection targeted a task with no running session.
    #[error("no running session for agent {0}")]
    SessionDisappeared(String),

    /// The `RepoManager` collaborator failed.
    #[error("repo manager error: {0}")]
    Repo(String),

    /// The `PromptAssembler` collaborator failed.
    #[error("prompt assembly error: {0}")]
    Prompt(String),

    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The human queue failed to record or update an interjection.
    #[error("human queue error: {0}")]
    Queue(#[from] bloom_queue::QueueError),
}
