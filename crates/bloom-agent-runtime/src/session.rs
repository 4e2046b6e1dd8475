//! [`AgentSession`] and the process-wide [`SessionIndex`].
//!
//! Running sessions live in an explicit [`SessionIndex`] value owned by
//! `AgentRuntime` and passed to any collaborator that needs it, rather
//! than a module-level mutable map — a `dashmap`-backed table keyed by
//! agent name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// A running (or just-finished) agent session, as tracked by
/// [`AgentRuntime`](crate::runtime::AgentRuntime).
#[derive(Clone)]
pub struct AgentSession {
    /// Name of the agent spec this session is running.
    pub agent_name: String,
    /// Task this session is working, if any.
    pub task_id: Option<String>,
    /// Directory the subprocess was spawned in.
    pub working_directory: String,
    /// When this session was spawned.
    pub start_time: Instant,
    /// Last time any activity (a decoded event, a raw line, stderr
    /// output) was observed.
    pub last_activity: Arc<std::sync::Mutex<Instant>>,
    /// Session id reported by the CLI, once observed.
    pub session_id: Arc<std::sync::Mutex<Option<String>>>,
    /// OS process id of the spawned subprocess.
    pub pid: Option<u32>,
    /// Set by [`SessionIndex::request_interject`]; the run loop polls
    /// this to know a graceful-termination request landed.
    interject_requested: Arc<AtomicBool>,
}

impl AgentSession {
    /// Construct a fresh session descriptor with `last_activity` set to
    /// the current instant.
    pub fn new(agent_name: String, task_id: Option<String>, working_directory: String, pid: Option<u32>) -> Self {
        let now = Instant::now();
        Self {
            agent_name,
            task_id,
            working_directory,
            start_time: now,
            last_activity: Arc::new(std::sync::Mutex::new(now)),
            session_id: Arc::new(std::sync::Mutex::new(None)),
            pid,
            interject_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session lock poisoned") = Instant::now();
    }

    /// Seconds since the last observed activity.
    pub fn idle_secs(&self) -> u64 {
        self.last_activity
            .lock()
            .expect("session lock poisoned")
            .elapsed()
            .as_secs()
    }

    /// The session id observed so far, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session lock poisoned").clone()
    }

    /// Record an observed session id. First write wins — once a
    /// session id is known it is never overwritten.
    pub fn set_session_id_if_absent(&self, id: String) {
        let mut guard = self.session_id.lock().expect("session lock poisoned");
        if guard.is_none() {
            *guard = Some(id);
        }
    }

    /// Whether a caller has asked this session to wind down.
    pub fn interject_requested(&self) -> bool {
        self.interject_requested.load(Ordering::SeqCst)
    }

    fn request_interject(&self) {
        self.interject_requested.store(true, Ordering::SeqCst);
    }
}

/// Process-wide map of currently running sessions, keyed by agent name.
///
/// Entries are inserted on spawn and removed on exit or interjection.
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct SessionIndex {
    sessions: Arc<DashMap<String, AgentSession>>,
}

impl SessionIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly spawned session under its agent name,
    /// overwriting any stale prior entry for that name.
    pub fn insert(&self, session: AgentSession) {
        self.sessions.insert(session.agent_name.clone(), session);
    }

    /// Remove the entry for `agent_name`, if present.
    pub fn remove(&self, agent_name: &str) -> Option<AgentSession> {
        self.sessions.remove(agent_name).map(|(_, s)| s)
    }

    /// Snapshot the session currently registered for `agent_name`.
    pub fn get(&self, agent_name: &str) -> Option<AgentSession> {
        self.sessions.get(agent_name).map(|e| e.value().clone())
    }

    /// Flag the named session for graceful termination and return its
    /// descriptor, for the caller to act on (e.g. launch a human
    /// takeover pane). Returns `None` if no session is running under
    /// that name (the session already disappeared).
    pub fn request_interject(&self, agent_name: &str) -> Option<AgentSession> {
        let entry = self.sessions.get(agent_name)?;
        entry.value().request_interject();
        Some(entry.value().clone())
    }

    /// Number of currently tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
