#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **bloom-store** – the single writer for the task graph file.
//!
//! A [`TaskStore`] owns the in-memory task tree and the YAML file it
//! is persisted to. It validates on load, serializes every mutation
//! through an exclusive write lock, and persists atomically (write to
//! a sibling temp file, then rename) so no reader ever observes a
//! half-written file. Concurrent readers see a consistent snapshot at
//! all times; mutation failures are reported to the caller with state
//! left unchanged.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloom_types::{validate, Task, TaskFile, TaskStatus, ValidationError};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Errors raised by [`TaskStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The task file's YAML could not be parsed.
    #[error("failed to parse task file: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// One of the invariants in the data model was violated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A task id was referenced that doesn't exist in the tree.
    #[error("unknown task id: {0}")]
    UnknownTask(String),

    /// A step id was referenced that doesn't exist on the named task.
    #[error("task {task} has no step {step}")]
    UnknownStep {
        /// Owning task id.
        task: String,
        /// The missing step id.
        step: String,
    },

    /// The requested status transition is not in the allowed table.
    #[error("task {task} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// The offending task id.
        task: String,
        /// Status the task was in.
        from: TaskStatus,
        /// Status that was rejected.
        to: TaskStatus,
    },

    /// A `checkpoint` task was about to become claimable while an
    /// earlier-phase task in the same repo is still unfinished.
    #[error("task {task} is checkpoint-gated by an unfinished earlier-phase task in the same repo")]
    CheckpointGated {
        /// The gated task id.
        task: String,
    },
}

/// Optional filter passed to [`TaskStore::ready_set`].
#[derive(Debug, Clone, Default)]
pub struct ReadySetFilter<'a> {
    /// Restrict to tasks currently assigned to this agent name.
    pub agent_filter: Option<&'a str>,
}

struct Inner {
    path: PathBuf,
    file: RwLock<TaskFile>,
}

/// Handle to a durable task graph. Cheap to clone — all clones share
/// the same underlying file and write lock.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl TaskStore {
    /// Load and validate a task file from `path`. A task file written
    /// mid-run (`in_progress` claimed, crash or restart before a
    /// `sessionId` was ever observed) would otherwise be an
    /// unrecoverable, un-loadable file — `reset-stuck`'s own recovery
    /// command included, since it has to load the file before it can
    /// repair it. So that recovery is applied here, before validation:
    /// any `in_progress` task with no `sessionId` is treated exactly
    /// like [`Self::reset_stuck`] would treat it, and reopened to
    /// `ready_for_agent`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let raw = tokio::fs::read_to_string(&path).await?;
        let mut file: TaskFile = serde_yaml::from_str(&raw)?;
        let recovered = recover_stuck_in_progress(&mut file);
        validate(&file)?;
        debug!(tasks = file.tasks.len(), "loaded task file");
        let store = Self {
            inner: Arc::new(Inner {
                path,
                file: RwLock::new(file),
            }),
        };
        if recovered > 0 {
            warn!(count = recovered, "recovered in_progress task(s) with no sessionId to ready_for_agent on load");
            store.save().await?;
        }
        Ok(store)
    }

    /// Serialize the current state to a sibling temp file, then
    /// rename it over the real path. The rename is the only operation
    /// that touches the visible path, so readers never observe a
    /// partially written document.
    #[instrument(skip_all)]
    pub async fn save(&self) -> Result<(), StoreError> {
        let file = self.inner.file.read().await;
        let yaml = serde_yaml::to_string(&*file)?;
        drop(file);

        let dir = self
            .inner
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let suffix: u64 = rand::random();
        let tmp_path = dir.join(format!(
            ".{}.tmp{suffix:x}",
            self.inner
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("tasks.yaml")
        ));

        tokio::fs::write(&tmp_path, yaml.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.inner.path).await?;
        Ok(())
    }

    /// A cloned snapshot of the full tree, safe to read without
    /// holding any lock.
    pub async fn snapshot(&self) -> TaskFile {
        self.inner.file.read().await.clone()
    }

    /// Validate `self -> new_status` against the transition table and
    /// persist on success. Transitions into `ready_for_agent` are
    /// additionally checked against the checkpoint gate:
    /// a `checkpoint` task never becomes claimable while any
    /// earlier-phase task in the same repo is still unfinished.
    #[instrument(skip(self))]
    pub async fn set_status(&self, task_id: &str, new_status: TaskStatus) -> Result<(), StoreError> {
        {
            let mut file = self.inner.file.write().await;
            let gate_ok = if new_status == TaskStatus::ReadyForAgent {
                let by_id = index(&file.tasks);
                let task = by_id.get(task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
                checkpoint_gate_satisfied(&by_id, task)
            } else {
                true
            };

            let task = find_mut(&mut file.tasks, task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
            if !task.status.can_transition_to(new_status) {
                return Err(StoreError::InvalidTransition {
                    task: task_id.to_string(),
                    from: task.status,
                    to: new_status,
                });
            }
            if new_status == TaskStatus::ReadyForAgent && !gate_ok {
                return Err(StoreError::CheckpointGated {
                    task: task_id.to_string(),
                });
            }
            task.status = new_status;
        }
        self.save().await
    }

    /// Record the session id an `AgentRuntime` assigned to a task,
    /// best-effort, as soon as it is first observed.
    #[instrument(skip(self))]
    pub async fn set_session_id(&self, task_id: &str, session_id: &str) -> Result<(), StoreError> {
        {
            let mut file = self.inner.file.write().await;
            let task = find_mut(&mut file.tasks, task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
            task.session_id = Some(session_id.to_string());
        }
        self.save().await
    }

    /// Set the agent name on a task, and opportunistically move it to
    /// `ready_for_agent` if it wasn't already assigned and its
    /// dependencies are satisfied.
    #[instrument(skip(self))]
    pub async fn assign(&self, task_id: &str, agent_name: &str) -> Result<(), StoreError> {
        let mut file = self.inner.file.write().await;
        let (deps_satisfied, gate_ok) = {
            let by_id = index(&file.tasks);
            let task = by_id.get(task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
            let deps_satisfied = task.depends_on.iter().all(|d| {
                matches!(
                    by_id.get(d.as_str()).map(|t| t.status),
                    Some(TaskStatus::Done) | Some(TaskStatus::DonePendingMerge)
                )
            });
            (deps_satisfied, checkpoint_gate_satisfied(&by_id, task))
        };

        let task = find_mut(&mut file.tasks, task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        let already_assigned = task.agent_name.is_some();
        task.agent_name = Some(agent_name.to_string());
        if !already_assigned
            && matches!(task.status, TaskStatus::Todo | TaskStatus::ReadyForAgent)
            && deps_satisfied
            && gate_ok
        {
            task.status = TaskStatus::ReadyForAgent;
        }
        drop(file);
        self.save().await
    }

    /// Append a timestamped note to a task.
    #[instrument(skip(self, text))]
    pub async fn append_note(&self, task_id: &str, text: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        {
            let mut file = self.inner.file.write().await;
            let task = find_mut(&mut file.tasks, task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
            task.append_note(text, at);
        }
        self.save().await
    }

    /// Update the status of one step within a task. Reaching `done`
    /// on every step never auto-closes the task — the caller must
    /// call [`TaskStore::set_status`] explicitly.
    #[instrument(skip(self))]
    pub async fn set_step(
        &self,
        task_id: &str,
        step_id: &str,
        status: bloom_types::StepStatus,
    ) -> Result<(), StoreError> {
        {
            let mut file = self.inner.file.write().await;
            let task = find_mut(&mut file.tasks, task_id).ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
            let step = task
                .steps
                .iter_mut()
                .find(|s| s.id == step_id)
                .ok_or_else(|| StoreError::UnknownStep {
                    task: task_id.to_string(),
                    step: step_id.to_string(),
                })?;
            step.status = status;
        }
        self.save().await
    }

    /// Every task stuck `in_progress` or `blocked` becomes
    /// `ready_for_agent`, with its `sessionId` cleared. Returns the
    /// number of tasks reset. Safe to call at any time; a worker whose
    /// task is reset out from under it observes this on its next
    /// write attempt and aborts.
    #[instrument(skip(self))]
    pub async fn reset_stuck(&self) -> Result<usize, StoreError> {
        let mut file = self.inner.file.write().await;
        let mut count = 0usize;
        walk_mut(&mut file.tasks, &mut |t| {
            if matches!(t.status, TaskStatus::InProgress | TaskStatus::Blocked) {
                t.status = TaskStatus::ReadyForAgent;
                t.session_id = None;
                count += 1;
            }
        });
        drop(file);
        if count > 0 {
            warn!(count, "reset stuck tasks to ready_for_agent");
        }
        self.save().await?;
        Ok(count)
    }

    /// The ordered sequence of claimable tasks: `ready_for_agent`,
    /// with every dependency `done`/`done_pending_merge`, optionally
    /// restricted to a single agent name. Ordered by `phase` ascending
    /// (missing sorts last), then `agentName`, then `id`, both
    /// lexicographically.
    pub async fn ready_set(&self, filter: ReadySetFilter<'_>) -> Vec<Task> {
        let file = self.inner.file.read().await;
        let by_id = index(&file.tasks);
        let mut out: Vec<Task> = by_id
            .values()
            .filter(|t| t.status == TaskStatus::ReadyForAgent)
            .filter(|t| {
                t.depends_on.iter().all(|d| {
                    matches!(
                        by_id.get(d.as_str()).map(|dep| dep.status),
                        Some(TaskStatus::Done) | Some(TaskStatus::DonePendingMerge)
                    )
                })
            })
            .filter(|t| match filter.agent_filter {
                Some(name) => t.agent_name.as_deref() == Some(name),
                None => true,
            })
            .filter(|t| checkpoint_gate_satisfied(&by_id, t))
            .map(|t| (*t).clone())
            .collect();

        out.sort_by(|a, b| {
            let phase_a = a.phase.unwrap_or(i64::MAX);
            let phase_b = b.phase.unwrap_or(i64::MAX);
            phase_a
                .cmp(&phase_b)
                .then_with(|| a.agent_name.cmp(&b.agent_name))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// The set of distinct `agentName` values present anywhere in the
    /// tree.
    pub async fn collect_agents(&self) -> BTreeSet<String> {
        let file = self.inner.file.read().await;
        let mut out = BTreeSet::new();
        walk(&file.tasks, &mut |t| {
            if let Some(name) = &t.agent_name {
                out.insert(name.clone());
            }
        });
        out
    }
}

/// Whether `task` may occupy `ready_for_agent`. Non-checkpoint tasks,
/// or checkpoint tasks with no `phase`, are always satisfied. A
/// checkpoint task with a `phase` is gated on every other task sharing
/// its `repo` whose `phase` is strictly earlier having reached `done`
/// or `done_pending_merge`.
fn checkpoint_gate_satisfied(by_id: &std::collections::HashMap<&str, &Task>, task: &Task) -> bool {
    if !task.checkpoint {
        return true;
    }
    let Some(phase) = task.phase else {
        return true;
    };
    by_id.values().all(|other| {
        if other.id == task.id || other.repo != task.repo {
            return true;
        }
        match other.phase {
            Some(p) if p < phase => matches!(other.status, TaskStatus::Done | TaskStatus::DonePendingMerge),
            _ => true,
        }
    })
}

fn index(tasks: &[Task]) -> std::collections::HashMap<&str, &Task> {
    let mut map = std::collections::HashMap::new();
    walk(tasks, &mut |t| {
        map.insert(t.id.as_str(), t);
    });
    map
}

fn walk<'a>(tasks: &'a [Task], f: &mut impl FnMut(&'a Task)) {
    for t in tasks {
        f(t);
        walk(&t.subtasks, f);
    }
}

fn walk_mut(tasks: &mut [Task], f: &mut impl FnMut(&mut Task)) {
    for t in tasks.iter_mut() {
        f(t);
        walk_mut(&mut t.subtasks, f);
    }
}

/// Reopen any `in_progress` task with no `sessionId` to `ready_for_agent`,
/// clearing `sessionId` along the way. Returns how many tasks were
/// touched. Same recovery [`TaskStore::reset_stuck`] applies on demand,
/// applied here to a freshly parsed file before it is handed to
/// `validate`.
fn recover_stuck_in_progress(file: &mut TaskFile) -> usize {
    let mut count = 0usize;
    walk_mut(&mut file.tasks, &mut |t| {
        if t.status == TaskStatus::InProgress && t.session_id.is_none() {
            t.status = TaskStatus::ReadyForAgent;
            count += 1;
        }
    });
    count
}

fn find_mut<'a>(tasks: &'a mut [Task], id: &str) -> Option<&'a mut Task> {
    for t in tasks.iter_mut() {
        if t.id == id {
            return Some(t);
        }
        if let Some(found) = find_mut(&mut t.subtasks, id) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloom_types::Task;
    use std::collections::HashMap;

    async fn store_with(tasks: Vec<Task>) -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let file = TaskFile {
            tasks,
            extra: HashMap::new(),
        };
        tokio::fs::write(&path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();
        (TaskStore::load(&path).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn load_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let file = TaskFile {
            tasks: vec![Task::new("a".into(), "A".into()), Task::new("a".into(), "A2".into())],
            extra: HashMap::new(),
        };
        tokio::fs::write(&path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();
        let err = TaskStore::load(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn load_recovers_in_progress_task_with_no_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let mut task = Task::new("a".into(), "A".into());
        task.status = TaskStatus::InProgress;
        let file = TaskFile {
            tasks: vec![task],
            extra: HashMap::new(),
        };
        tokio::fs::write(&path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();

        // A file written mid-run (claimed before a sessionId was ever
        // observed, then the process crashed or was restarted) would
        // otherwise fail `validate` on every load, including the
        // reset-stuck command meant to repair it.
        let store = TaskStore::load(&path).await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
        assert!(snap.tasks[0].session_id.is_none());

        // The recovery is persisted, not just held in memory.
        let reloaded = TaskStore::load(&path).await.unwrap();
        let snap = reloaded.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
    }

    #[tokio::test]
    async fn reset_stuck_survives_a_file_written_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let mut task = Task::new("a".into(), "A".into());
        task.status = TaskStatus::InProgress;
        let file = TaskFile {
            tasks: vec![task],
            extra: HashMap::new(),
        };
        tokio::fs::write(&path, serde_yaml::to_string(&file).unwrap())
            .await
            .unwrap();

        let store = TaskStore::load(&path).await.unwrap();
        let count = store.reset_stuck().await.unwrap();
        assert_eq!(count, 0, "load() already recovered the task, nothing left stuck");
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
    }

    #[tokio::test]
    async fn set_status_rejects_invalid_transition() {
        let (store, _dir) = store_with(vec![Task::new("a".into(), "A".into())]).await;
        let err = store
            .set_status("a", TaskStatus::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn set_status_persists_across_reload() {
        let (store, dir) = store_with(vec![Task::new("a".into(), "A".into())]).await;
        store.set_status("a", TaskStatus::ReadyForAgent).await.unwrap();

        let path = dir.path().join("tasks.yaml");
        let reloaded = TaskStore::load(&path).await.unwrap();
        let snap = reloaded.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
    }

    #[tokio::test]
    async fn assign_moves_unassigned_ready_task_with_satisfied_deps() {
        let (store, _dir) = store_with(vec![Task::new("a".into(), "A".into())]).await;
        store.assign("a", "claude-code").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
        assert_eq!(snap.tasks[0].agent_name.as_deref(), Some("claude-code"));
    }

    #[tokio::test]
    async fn assign_does_not_reopen_already_assigned_task() {
        let mut t = Task::new("a".into(), "A".into());
        t.status = TaskStatus::ReadyForAgent;
        t.agent_name = Some("claude-code".to_string());
        t.session_id = Some("s1".to_string());
        t.status = TaskStatus::InProgress;
        let (store, _dir) = store_with(vec![t]).await;

        store.assign("a", "aider").await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::InProgress);
        assert_eq!(snap.tasks[0].agent_name.as_deref(), Some("aider"));
    }

    #[tokio::test]
    async fn ready_set_orders_by_phase_then_agent_then_id() {
        let mut t1 = Task::new("b".into(), "B".into());
        t1.status = TaskStatus::ReadyForAgent;
        t1.phase = Some(2);
        let mut t2 = Task::new("a".into(), "A".into());
        t2.status = TaskStatus::ReadyForAgent;
        t2.phase = Some(1);
        let mut t3 = Task::new("c".into(), "C".into());
        t3.status = TaskStatus::ReadyForAgent;
        t3.phase = None;

        let (store, _dir) = store_with(vec![t1, t2, t3]).await;
        let ready = store.ready_set(ReadySetFilter::default()).await;
        assert_eq!(
            ready.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn ready_set_excludes_tasks_with_unfinished_dependencies() {
        let dep = Task::new("dep".into(), "Dep".into());
        let mut dependent = Task::new("main".into(), "Main".into());
        dependent.status = TaskStatus::ReadyForAgent;
        dependent.depends_on.insert("dep".to_string());

        let (store, _dir) = store_with(vec![dep, dependent]).await;
        let ready = store.ready_set(ReadySetFilter::default()).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn reset_stuck_clears_session_and_reopens() {
        let mut t = Task::new("a".into(), "A".into());
        t.status = TaskStatus::InProgress;
        t.session_id = Some("s1".to_string());
        let (store, _dir) = store_with(vec![t]).await;

        let n = store.reset_stuck().await.unwrap();
        assert_eq!(n, 1);
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
        assert!(snap.tasks[0].session_id.is_none());
    }

    #[tokio::test]
    async fn set_status_rejects_checkpoint_task_while_earlier_phase_unfinished() {
        let mut earlier = Task::new("p1".into(), "Phase 1".into());
        earlier.repo = Some("repo".into());
        earlier.phase = Some(1);

        let mut gate = Task::new("p2".into(), "Phase 2 checkpoint".into());
        gate.repo = Some("repo".into());
        gate.phase = Some(2);
        gate.checkpoint = true;

        let (store, _dir) = store_with(vec![earlier, gate]).await;
        let err = store.set_status("p2", TaskStatus::ReadyForAgent).await.unwrap_err();
        assert!(matches!(err, StoreError::CheckpointGated { .. }));
    }

    #[tokio::test]
    async fn set_status_allows_checkpoint_task_once_earlier_phase_is_done() {
        let mut earlier = Task::new("p1".into(), "Phase 1".into());
        earlier.repo = Some("repo".into());
        earlier.phase = Some(1);
        earlier.status = TaskStatus::Done;

        let mut gate = Task::new("p2".into(), "Phase 2 checkpoint".into());
        gate.repo = Some("repo".into());
        gate.phase = Some(2);
        gate.checkpoint = true;

        let (store, _dir) = store_with(vec![earlier, gate]).await;
        store.set_status("p2", TaskStatus::ReadyForAgent).await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[1].status, TaskStatus::ReadyForAgent);
    }

    #[tokio::test]
    async fn checkpoint_gate_ignores_tasks_in_other_repos() {
        let mut earlier = Task::new("p1".into(), "Phase 1".into());
        earlier.repo = Some("other-repo".into());
        earlier.phase = Some(1);

        let mut gate = Task::new("p2".into(), "Phase 2 checkpoint".into());
        gate.repo = Some("repo".into());
        gate.phase = Some(2);
        gate.checkpoint = true;

        let (store, _dir) = store_with(vec![earlier, gate]).await;
        store.set_status("p2", TaskStatus::ReadyForAgent).await.unwrap();
    }

    #[tokio::test]
    async fn ready_set_excludes_checkpoint_gated_tasks() {
        let mut earlier = Task::new("p1".into(), "Phase 1".into());
        earlier.repo = Some("repo".into());
        earlier.phase = Some(1);

        let mut gate = Task::new("p2".into(), "Phase 2 checkpoint".into());
        gate.repo = Some("repo".into());
        gate.phase = Some(2);
        gate.checkpoint = true;
        gate.status = TaskStatus::ReadyForAgent;

        let (store, _dir) = store_with(vec![earlier, gate]).await;
        let ready = store.ready_set(ReadySetFilter::default()).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn collect_agents_includes_nested_subtasks() {
        let mut parent = Task::new("p".into(), "P".into());
        parent.agent_name = Some("claude-code".to_string());
        let mut child = Task::new("p.1".into(), "P1".into());
        child.agent_name = Some("aider".to_string());
        parent.subtasks.push(child);

        let (store, _dir) = store_with(vec![parent]).await;
        let agents = store.collect_agents().await;
        assert_eq!(
            agents,
            ["aider", "claude-code"].iter().map(|s| s.to_string()).collect()
        );
    }
}
