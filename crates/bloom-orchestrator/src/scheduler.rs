//! [`Scheduler`]: matches ready tasks to worker slots and drives each
//! through a single agent run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bloom_agent_runtime::{AgentResult, AgentRuntime, RunMode, RunOptions};
use bloom_bus::{BloomEvent, EventBus};
use bloom_config::BloomConfig;
use bloom_queue::HumanQueue;
use bloom_store::{ReadySetFilter, StoreError, TaskStore};
use bloom_types::{StepStatus, Task, TaskStatus};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::prompt::PromptAssembler;
use crate::repo::RepoManager;
use crate::OrchestratorError;

/// A worker slot key: `(agentName, repo, branch)`. At most one task per
/// slot runs concurrently.
pub type SlotKey = (String, String, String);

fn slot_key(task: &Task, agent_name: &str) -> SlotKey {
    (
        agent_name.to_string(),
        task.repo.clone().unwrap_or_default(),
        task.branch.clone().unwrap_or_default(),
    )
}

fn find_task<'a>(tasks: &'a [Task], id: &str) -> Option<&'a Task> {
    for t in tasks {
        if t.id == id {
            return Some(t);
        }
        if let Some(found) = find_task(&t.subtasks, id) {
            return Some(found);
        }
    }
    None
}

/// Matches ready tasks to worker slots, drives each through a single
/// agent run, and interprets the result back into a task-state
/// transition. Construct with [`Scheduler::new`] and drive it with
/// either a single [`Scheduler::tick`] or the long-running
/// [`Scheduler::run_forever`].
///
/// The attempt counter backing the retry ceiling is in-memory only — it
/// does not survive a process restart, matching the absence of a
/// persisted `attempts` field anywhere in `bloom_types::Task`. A
/// restarted orchestrator starts every task's counter fresh.
pub struct Scheduler {
    store: TaskStore,
    runtime: Arc<AgentRuntime>,
    config: BloomConfig,
    repo_manager: Arc<dyn RepoManager>,
    prompt_assembler: Arc<dyn PromptAssembler>,
    bus: Option<Arc<dyn EventBus>>,
    queue: Option<Arc<HumanQueue>>,
    active_slots: Mutex<HashSet<SlotKey>>,
    permits: Arc<Semaphore>,
    attempts: DashMap<String, u32>,
    notify: Notify,
}

impl Scheduler {
    /// Build a scheduler around the given collaborators.
    pub fn new(
        store: TaskStore,
        runtime: Arc<AgentRuntime>,
        config: BloomConfig,
        repo_manager: Arc<dyn RepoManager>,
        prompt_assembler: Arc<dyn PromptAssembler>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_parallel_agents.max(1)));
        Arc::new(Self {
            store,
            runtime,
            config,
            repo_manager,
            prompt_assembler,
            bus: None,
            queue: None,
            active_slots: Mutex::new(HashSet::new()),
            permits,
            attempts: DashMap::new(),
            notify: Notify::new(),
        })
    }

    /// Build a scheduler with an event bus already attached.
    /// `task.state_changed`/`task.assigned` are published to it.
    /// Process-level events (`agent.process_started`/
    /// `agent.process_ended`) are the `AgentRuntime`'s responsibility —
    /// wire the same bus into it for a complete event stream.
    pub fn new_with_bus(
        store: TaskStore,
        runtime: Arc<AgentRuntime>,
        config: BloomConfig,
        repo_manager: Arc<dyn RepoManager>,
        prompt_assembler: Arc<dyn PromptAssembler>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_parallel_agents.max(1)));
        Arc::new(Self {
            store,
            runtime,
            config,
            repo_manager,
            prompt_assembler,
            bus: Some(bus),
            queue: None,
            active_slots: Mutex::new(HashSet::new()),
            permits,
            attempts: DashMap::new(),
            notify: Notify::new(),
        })
    }

    /// Build a scheduler with both an event bus and a [`HumanQueue`]
    /// attached. The queue backs [`Self::interject`]'s interjection
    /// records and [`Self::resume_interjection`].
    pub fn new_with_bus_and_queue(
        store: TaskStore,
        runtime: Arc<AgentRuntime>,
        config: BloomConfig,
        repo_manager: Arc<dyn RepoManager>,
        prompt_assembler: Arc<dyn PromptAssembler>,
        bus: Arc<dyn EventBus>,
        queue: Arc<HumanQueue>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_parallel_agents.max(1)));
        Arc::new(Self {
            store,
            runtime,
            config,
            repo_manager,
            prompt_assembler,
            bus: Some(bus),
            queue: Some(queue),
            active_slots: Mutex::new(HashSet::new()),
            permits,
            attempts: DashMap::new(),
            notify: Notify::new(),
        })
    }

    /// One scheduling pass: claim and dispatch every claimable task in
    /// the current ready set. Returns the number of tasks dispatched.
    #[instrument(skip(self))]
    pub async fn tick(self: &Arc<Self>) -> Result<usize, OrchestratorError> {
        let ready = self.store.ready_set(ReadySetFilter::default()).await;
        let mut claimed = 0usize;

        for task in ready {
            let Some(agent_name) = task.agent_name.clone().or_else(|| self.config.default_agent.clone()) else {
                continue;
            };
            let key = slot_key(&task, &agent_name);

            let permit = {
                let mut slots = self.active_slots.lock().await;
                if slots.contains(&key) {
                    continue;
                }
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    continue;
                };
                slots.insert(key.clone());
                permit
            };

            match self.store.set_status(&task.id, TaskStatus::InProgress).await {
                Ok(()) => {
                    claimed += 1;
                    self.publish_state_change(&task.id, TaskStatus::ReadyForAgent, TaskStatus::InProgress);
                    let this = Arc::clone(self);
                    let task_id = task.id.clone();
                    tokio::spawn(async move {
                        this.run_worker(task_id, agent_name, key, permit).await;
                    });
                }
                Err(e) => {
                    debug!(task = %task.id, error = %e, "lost the race to claim task");
                    self.active_slots.lock().await.remove(&key);
                    drop(permit);
                }
            }
        }

        Ok(claimed)
    }

    /// Run the scheduling loop until `shutdown` fires. Sleeps on either
    /// a worker-completion notification or `pollIntervalMs`, whichever
    /// comes first, between ticks that claim nothing.
    pub async fn run_forever(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let poll_interval = self.config.poll_interval();
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.tick().await {
                Ok(0) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "scheduler tick failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    /// Gracefully interject the agent session running `task_id`, if
    /// any, reset the task to `ready_for_agent` unless it already
    /// finished, and — when a [`HumanQueue`] is attached — file a
    /// pending interjection record for the human pane to pick up.
    /// Returns the new record's id, or `None` if no queue is attached.
    pub async fn interject(&self, task_id: &str, reason: Option<String>) -> Result<Option<String>, OrchestratorError> {
        let snapshot = self.store.snapshot().await;
        let task = find_task(&snapshot.tasks, task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        let agent_name = task
            .agent_name
            .clone()
            .ok_or_else(|| OrchestratorError::UnknownAgent(task_id.to_string()))?;

        let Some(session) = self.runtime.interject(&agent_name) else {
            return Err(OrchestratorError::SessionDisappeared(agent_name));
        };

        let interjection_id = if let Some(queue) = &self.queue {
            let id = queue
                .create_interjection(
                    &agent_name,
                    Some(task_id.to_string()),
                    session.session_id(),
                    &session.working_directory,
                    reason,
                )
                .await?;
            self.publish(BloomEvent::InterjectionCreated {
                id: id.clone(),
                task_id: task_id.to_string(),
            });
            Some(id)
        } else {
            None
        };

        if task.status == TaskStatus::InProgress {
            self.store.set_status(task_id, TaskStatus::ReadyForAgent).await?;
            self.publish_state_change(task_id, TaskStatus::InProgress, TaskStatus::ReadyForAgent);
        }
        self.notify.notify_one();
        Ok(interjection_id)
    }

    /// Mark a filed interjection resumed and wake the scheduling loop so
    /// the task it was filed against (already `ready_for_agent` since
    /// [`Self::interject`]) gets picked up without waiting out a full
    /// `pollIntervalMs`. Returns `false` if the record doesn't exist or
    /// no queue is attached.
    pub async fn resume_interjection(&self, interjection_id: &str) -> Result<bool, OrchestratorError> {
        let Some(queue) = &self.queue else {
            return Ok(false);
        };
        let resumed = queue.mark_interjection_resumed(interjection_id).await?;
        if resumed {
            if let Some(record) = queue.get_interjection(interjection_id).await? {
                if let Some(task_id) = record.task_id {
                    self.publish(BloomEvent::InterjectionResumed {
                        id: interjection_id.to_string(),
                        task_id,
                    });
                }
            }
            self.notify.notify_one();
        }
        Ok(resumed)
    }

    /// Reset every stuck task (`in_progress`/`blocked`) to
    /// `ready_for_agent`. Safe to call at any time.
    pub async fn reset_stuck(&self) -> Result<usize, OrchestratorError> {
        let n = self.store.reset_stuck().await?;
        self.notify.notify_one();
        Ok(n)
    }

    async fn run_worker(self: Arc<Self>, task_id: String, agent_name: String, key: SlotKey, permit: tokio::sync::OwnedSemaphorePermit) {
        if let Err(e) = self.execute_task(&task_id, &agent_name).await {
            warn!(task = %task_id, error = %e, "worker failed");
        }
        self.active_slots.lock().await.remove(&key);
        drop(permit);
        self.notify.notify_one();
    }

    async fn execute_task(&self, task_id: &str, agent_name: &str) -> Result<(), OrchestratorError> {
        let snapshot = self.store.snapshot().await;
        let task = find_task(&snapshot.tasks, task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?
            .clone();

        let spec = self
            .runtime
            .registry()
            .get(agent_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_name.to_string()))?;

        let repo = task.repo.clone().unwrap_or_default();
        let branch = task.branch.clone().unwrap_or_default();
        let working_directory = if repo.is_empty() {
            std::path::PathBuf::from(".")
        } else {
            self.repo_manager
                .ensure_worktree(&repo, &branch, task.base_branch.as_deref())
                .await?;
            self.repo_manager.worktree_path(&repo, &branch).await?
        };

        let (system_prompt, user_prompt) = self.prompt_assembler.assemble(&task).await?;

        let agent_cfg = self.config.agent(agent_name);
        let model = agent_cfg.and_then(|c| c.model.clone());
        let heartbeat_interval = agent_cfg
            .and_then(|c| c.heartbeat_interval())
            .unwrap_or(bloom_agent_runtime::DEFAULT_HEARTBEAT_INTERVAL);
        let activity_timeout = agent_cfg
            .and_then(|c| c.timeout())
            .unwrap_or(bloom_agent_runtime::DEFAULT_ACTIVITY_TIMEOUT);
        let env_overlay = agent_cfg.map(|c| c.env.clone()).unwrap_or_default();

        let options = RunOptions {
            system_prompt,
            user_prompt,
            working_directory,
            agent_name: Some(agent_name.to_string()),
            task_id: Some(task_id.to_string()),
            session_id: task.session_id.clone(),
            model,
            env_overlay,
            heartbeat_interval,
            activity_timeout,
            hard_kill_grace: self.config.hard_kill_grace(),
            ..Default::default()
        };

        self.publish(BloomEvent::TaskAssigned {
            id: task_id.to_string(),
            agent_name: agent_name.to_string(),
        });

        let result = self.runtime.run(&spec, RunMode::Streaming, options).await;

        if let Some(id) = &result.session_id {
            if let Err(e) = self.store.set_session_id(task_id, id).await {
                warn!(task = %task_id, error = %e, "failed to persist observed session id");
            }
        }

        info!(task = %task_id, agent = %agent_name, success = result.success, "agent run completed");
        self.interpret_result(task_id, result).await
    }

    /// Read `task_id` back from the store. Used to decide a terminal
    /// transition from the task's *current* state rather than the
    /// snapshot captured before the agent ran — the run itself (and any
    /// concurrent interject) may have changed it.
    async fn current_task(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        let snapshot = self.store.snapshot().await;
        find_task(&snapshot.tasks, task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))
    }

    async fn interpret_result(&self, task_id: &str, result: AgentResult) -> Result<(), OrchestratorError> {
        if result.success {
            self.attempts.remove(task_id);

            let task = self.current_task(task_id).await?;
            if let Some(step) = task.steps.iter().find(|s| s.status != StepStatus::Done) {
                // One successful run advances exactly one step; this is
                // what makes a multi-step task's ready_for_agent ->
                // in_progress -> ready_for_agent cycle converge on
                // done instead of looping forever.
                self.store.set_step(task_id, &step.id, StepStatus::Done).await?;
            }

            let task = self.current_task(task_id).await?;
            let all_steps_done = task.steps.iter().all(|s| s.status == StepStatus::Done);
            let next = if task.steps.is_empty() || all_steps_done {
                if task.merge_into.is_some() {
                    TaskStatus::DonePendingMerge
                } else {
                    TaskStatus::Done
                }
            } else {
                TaskStatus::ReadyForAgent
            };
            self.transition_from_in_progress(task_id, next).await?;
        } else {
            if let Some(message) = &result.error {
                if let Err(e) = self.store.append_note(task_id, message, Utc::now()).await {
                    warn!(task = %task_id, error = %e, "failed to append failure note");
                }
            }

            let attempt = {
                let mut entry = self.attempts.entry(task_id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };

            if attempt < self.config.max_attempts {
                self.transition_from_in_progress(task_id, TaskStatus::ReadyForAgent).await?;
            } else {
                self.attempts.remove(task_id);
                self.transition_from_in_progress(task_id, TaskStatus::Blocked).await?;
            }
        }
        Ok(())
    }

    /// Move `task_id` out of `in_progress` into `next`. A concurrent
    /// [`Self::interject`] may already have moved it to `ready_for_agent`
    /// by the time the run finishes (the agent was killed mid-run); that
    /// race is expected and not an error, so an `InvalidTransition` whose
    /// target already matches `next` is swallowed rather than propagated.
    async fn transition_from_in_progress(&self, task_id: &str, next: TaskStatus) -> Result<(), OrchestratorError> {
        match self.store.set_status(task_id, next).await {
            Ok(()) => {
                self.publish_state_change(task_id, TaskStatus::InProgress, next);
                Ok(())
            }
            Err(StoreError::InvalidTransition { from, .. }) if from == next => {
                debug!(task = %task_id, status = ?next, "already transitioned, likely via a concurrent interject");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&self, event: BloomEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn publish_state_change(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        self.publish(BloomEvent::TaskStateChanged {
            id: task_id.to_string(),
            from: status_wire_name(from),
            to: status_wire_name(to),
        });
    }
}

/// Render a [`TaskStatus`] the way it appears on the wire (its
/// snake_case serde name), for [`BloomEvent::TaskStateChanged`].
fn status_wire_name(status: TaskStatus) -> String {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => s,
        _ => format!("{status:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::TemplatePromptAssembler;
    use crate::repo::FixedDirRepoManager;
    use bloom_agent_runtime::testkit::FakeProcessSpawner;
    use bloom_agent_runtime::AgentRegistry;
    use bloom_bus::InMemoryBus;
    use bloom_types::{Task, TaskFile};
    use std::collections::HashMap;

    async fn store_with(tasks: Vec<Task>) -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        let file = TaskFile {
            tasks,
            extra: HashMap::new(),
        };
        tokio::fs::write(&path, serde_yaml::to_string(&file).unwrap()).await.unwrap();
        (TaskStore::load(&path).await.unwrap(), dir)
    }

    fn scheduler_with(
        store: TaskStore,
        runtime: Arc<AgentRuntime>,
        config: BloomConfig,
    ) -> (Arc<Scheduler>, tempfile::TempDir) {
        let work_dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new(
            store,
            runtime,
            config,
            Arc::new(FixedDirRepoManager::new(work_dir.path())),
            Arc::new(TemplatePromptAssembler::default()),
        );
        (scheduler, work_dir)
    }

    #[tokio::test]
    async fn tick_claims_and_completes_a_happy_path_task() {
        let mut task = Task::new("t1".to_string(), "Do the thing".to_string());
        task.status = TaskStatus::ReadyForAgent;
        task.agent_name = Some("claude-code".to_string());
        let (store, _dir) = store_with(vec![task]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"system","subtype":"init","session_id":"s1"}"#.to_string(),
            r#"{"type":"result","total_cost_usd":0.0,"duration_ms":10}"#.to_string(),
        ]));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let config = BloomConfig {
            max_parallel_agents: 2,
            ..Default::default()
        };
        let (scheduler, _work_dir) = scheduler_with(store.clone(), runtime, config);

        let claimed = scheduler.tick().await.unwrap();
        assert_eq!(claimed, 1);

        for _ in 0..50 {
            let snap = store.snapshot().await;
            if snap.tasks[0].status == TaskStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::Done);
        assert_eq!(snap.tasks[0].session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn failed_run_retries_until_max_attempts_then_blocks() {
        let mut task = Task::new("t1".to_string(), "Flaky task".to_string());
        task.status = TaskStatus::ReadyForAgent;
        task.agent_name = Some("claude-code".to_string());
        let (store, _dir) = store_with(vec![task]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines_and_exit_code(vec![], 1));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let config = BloomConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let (scheduler, _work_dir) = scheduler_with(store.clone(), runtime, config);

        for _ in 0..2 {
            loop {
                let snap = store.snapshot().await;
                if snap.tasks[0].status == TaskStatus::ReadyForAgent {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            scheduler.tick().await.unwrap();
            for _ in 0..50 {
                let snap = store.snapshot().await;
                if snap.tasks[0].status != TaskStatus::InProgress {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn same_slot_is_not_claimed_twice_concurrently() {
        let mut t1 = Task::new("t1".to_string(), "First".to_string());
        t1.status = TaskStatus::ReadyForAgent;
        t1.agent_name = Some("claude-code".to_string());
        let mut t2 = Task::new("t2".to_string(), "Second".to_string());
        t2.status = TaskStatus::ReadyForAgent;
        t2.agent_name = Some("claude-code".to_string());
        let (store, _dir) = store_with(vec![t1, t2]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![]));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let (scheduler, _work_dir) = scheduler_with(store.clone(), runtime, BloomConfig::default());

        let claimed = scheduler.tick().await.unwrap();
        // Both tasks share agent name, empty repo, empty branch -> one slot.
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn interject_on_task_with_no_agent_returns_unknown_agent() {
        let task = Task::new("t1".to_string(), "No agent".to_string());
        let (store, _dir) = store_with(vec![task]).await;
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()));
        let (scheduler, _work_dir) = scheduler_with(store, runtime, BloomConfig::default());

        let err = scheduler.interject("t1", None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn interject_files_an_interjection_record_and_resume_updates_it() {
        let mut task = Task::new("t1".to_string(), "Needs a human".to_string());
        task.status = TaskStatus::InProgress;
        task.agent_name = Some("claude-code".to_string());
        task.session_id = Some("s0".to_string());
        let (store, _dir) = store_with(vec![task]).await;

        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()));
        runtime.sessions().insert(bloom_agent_runtime::AgentSession::new(
            "claude-code".to_string(),
            Some("t1".to_string()),
            "/work/checkout".to_string(),
            Some(4242),
        ));

        let bloom_dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(bloom_queue::HumanQueue::open(bloom_dir.path(), Duration::from_millis(50)).await.unwrap());
        let work_dir = tempfile::tempdir().unwrap();
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(16));
        let scheduler = Scheduler::new_with_bus_and_queue(
            store.clone(),
            runtime,
            BloomConfig::default(),
            Arc::new(FixedDirRepoManager::new(work_dir.path())),
            Arc::new(TemplatePromptAssembler::default()),
            bus,
            queue.clone(),
        );

        let id = scheduler
            .interject("t1", Some("taking over".to_string()))
            .await
            .unwrap()
            .expect("a queue is attached, so an id is returned");

        let record = queue.get_interjection(&id).await.unwrap().expect("record was filed");
        assert_eq!(record.agent_name, "claude-code");
        assert_eq!(record.task_id.as_deref(), Some("t1"));
        assert_eq!(record.working_directory, "/work/checkout");
        assert_eq!(record.reason.as_deref(), Some("taking over"));
        assert_eq!(record.status, bloom_types::InterjectionStatus::Pending);

        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);

        assert!(scheduler.resume_interjection(&id).await.unwrap());
        let record = queue.get_interjection(&id).await.unwrap().unwrap();
        assert_eq!(record.status, bloom_types::InterjectionStatus::Resumed);
    }

    #[tokio::test]
    async fn successful_run_with_unfinished_steps_cycles_back_to_ready_for_agent() {
        let mut task = Task::new("t1".to_string(), "Multi-step task".to_string());
        task.status = TaskStatus::ReadyForAgent;
        task.agent_name = Some("claude-code".to_string());
        task.steps = vec![
            bloom_types::Step {
                id: "step-1".to_string(),
                instruction: "do the first thing".to_string(),
                acceptance_criteria: Vec::new(),
                status: bloom_types::StepStatus::Done,
            },
            bloom_types::Step {
                id: "step-2".to_string(),
                instruction: "do the second thing".to_string(),
                acceptance_criteria: Vec::new(),
                status: bloom_types::StepStatus::Todo,
            },
            bloom_types::Step {
                id: "step-3".to_string(),
                instruction: "do the third thing".to_string(),
                acceptance_criteria: Vec::new(),
                status: bloom_types::StepStatus::Todo,
            },
        ];
        let (store, _dir) = store_with(vec![task]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"result","total_cost_usd":0.0,"duration_ms":5}"#.to_string(),
        ]));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let (scheduler, _work_dir) = scheduler_with(store.clone(), runtime, BloomConfig::default());

        let claimed = scheduler.tick().await.unwrap();
        assert_eq!(claimed, 1);

        for _ in 0..50 {
            let snap = store.snapshot().await;
            if snap.tasks[0].status == TaskStatus::ReadyForAgent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The run succeeded and advanced exactly one open step (step-2),
        // but step-3 is still open, so the task cycles back to
        // ready_for_agent instead of closing out as done.
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
        assert_eq!(snap.tasks[0].steps[1].status, bloom_types::StepStatus::Done);
        assert_eq!(snap.tasks[0].steps[2].status, bloom_types::StepStatus::Todo);
    }

    #[tokio::test]
    async fn multi_step_task_reaches_done_after_every_step_advances() {
        let mut task = Task::new("t1".to_string(), "Multi-step task".to_string());
        task.status = TaskStatus::ReadyForAgent;
        task.agent_name = Some("claude-code".to_string());
        task.steps = vec![
            bloom_types::Step {
                id: "step-1".to_string(),
                instruction: "do the first thing".to_string(),
                acceptance_criteria: Vec::new(),
                status: bloom_types::StepStatus::Todo,
            },
            bloom_types::Step {
                id: "step-2".to_string(),
                instruction: "do the second thing".to_string(),
                acceptance_criteria: Vec::new(),
                status: bloom_types::StepStatus::Todo,
            },
        ];
        let (store, _dir) = store_with(vec![task]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"result","total_cost_usd":0.0,"duration_ms":5}"#.to_string(),
        ]));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let (scheduler, _work_dir) = scheduler_with(store.clone(), runtime, BloomConfig::default());

        // First cycle: advances step-1, cycles back to ready_for_agent.
        scheduler.tick().await.unwrap();
        for _ in 0..50 {
            let snap = store.snapshot().await;
            if snap.tasks[0].status == TaskStatus::ReadyForAgent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::ReadyForAgent);
        assert_eq!(snap.tasks[0].steps[0].status, bloom_types::StepStatus::Done);
        assert_eq!(snap.tasks[0].steps[1].status, bloom_types::StepStatus::Todo);

        // Second cycle: advances step-2, every step is now done, so the
        // task closes out as done instead of cycling again.
        scheduler.tick().await.unwrap();
        for _ in 0..50 {
            let snap = store.snapshot().await;
            if snap.tasks[0].status == TaskStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let snap = store.snapshot().await;
        assert_eq!(snap.tasks[0].status, TaskStatus::Done);
        assert_eq!(snap.tasks[0].steps[1].status, bloom_types::StepStatus::Done);
    }

    #[tokio::test]
    async fn event_bus_observes_task_state_changes() {
        let mut task = Task::new("t1".to_string(), "Observed".to_string());
        task.status = TaskStatus::ReadyForAgent;
        task.agent_name = Some("claude-code".to_string());
        let (store, _dir) = store_with(vec![task]).await;

        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![]));
        let runtime = Arc::new(AgentRuntime::new(AgentRegistry::with_builtins()).with_spawner(spawner));
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new(16));
        let mut rx = bus.subscribe();

        let work_dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::new_with_bus(
            store,
            runtime,
            BloomConfig::default(),
            Arc::new(FixedDirRepoManager::new(work_dir.path())),
            Arc::new(TemplatePromptAssembler::default()),
            bus,
        );

        scheduler.tick().await.unwrap();
        let event = rx.recv().await.unwrap();
        match event {
            BloomEvent::TaskStateChanged { to, .. } => assert_eq!(to, "in_progress"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
