//! [`AgentRuntime`]: the public entry point that ties the registry,
//! session index, process spawner, argv assembly, event decoding, and
//! rendering together into a single `run`/`interject` contract.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bloom_bus::{BloomEvent, EventBus};
use bloom_types::AgentSpec;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::argv::{build_argv, build_env};
use crate::event::{extract_session_id, normalize, NormalizedEvent};
use crate::process::{ChildLine, ProcessHandle, ProcessSpawner, TokioProcessSpawner};
use crate::registry::AgentRegistry;
use crate::render::{render_event, render_heartbeat, render_timeout};
use crate::session::{AgentSession, SessionIndex};
use crate::{
    AgentRuntimeError, DEFAULT_ACTIVITY_TIMEOUT, DEFAULT_HARD_KILL_GRACE, DEFAULT_HEARTBEAT_INTERVAL,
};

/// Which of the two invocation shapes a run should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Subprocess inherits the parent's stdio; no event parsing.
    Interactive,
    /// Subprocess stdio is piped and parsed line-by-line as JSON.
    Streaming,
}

/// A callback invoked once per decoded event.
pub type OnEvent = Arc<dyn Fn(&NormalizedEvent) + Send + Sync>;
/// A callback invoked on each heartbeat tick, with elapsed idle time.
pub type OnHeartbeat = Arc<dyn Fn(Duration) + Send + Sync>;
/// A callback invoked once, when the activity timeout fires.
pub type OnTimeout = Arc<dyn Fn() + Send + Sync>;
/// A sink for the rendered human-readable text. Defaults
/// to the real process stdout; tests substitute a capturing sink.
pub type StdoutSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-run configuration: the core options (task, repo, branch, model,
/// session id, ...) plus the ambient knobs (`heartbeat_interval`,
/// `activity_timeout`, `hard_kill_grace`, `verbose`, `stdout_sink`) a
/// complete implementation needs to be testable and configurable.
#[derive(Clone)]
pub struct RunOptions {
    /// System prompt text.
    pub system_prompt: String,
    /// User prompt text.
    pub user_prompt: String,
    /// Directory to spawn the subprocess in.
    pub working_directory: PathBuf,
    /// Name to register this session under; defaults to `spec.name` if
    /// not set (lets several concurrent instances of the same CLI run
    /// under distinct names).
    pub agent_name: Option<String>,
    /// Task this run is working, if any.
    pub task_id: Option<String>,
    /// Session id to resume, if any.
    pub session_id: Option<String>,
    /// Model to pass, if the spec supports one.
    pub model: Option<String>,
    /// Extra environment overlaid on top of `spec.env.inject` (e.g.
    /// `agent.<name>.env` from configuration).
    pub env_overlay: BTreeMap<String, String>,
    /// Heartbeat tick interval.
    pub heartbeat_interval: Duration,
    /// Activity timeout before the run is declared stuck.
    pub activity_timeout: Duration,
    /// Grace period between graceful termination and a forceful kill.
    pub hard_kill_grace: Duration,
    /// Whether tool results render their (truncated) content.
    pub verbose: bool,
    /// Invoked once per decoded event.
    pub on_event: Option<OnEvent>,
    /// Invoked on each heartbeat tick that doesn't also time out.
    pub on_heartbeat: Option<OnHeartbeat>,
    /// Invoked once if the activity timeout fires.
    pub on_timeout: Option<OnTimeout>,
    /// Where rendered text is written. `None` writes to the real
    /// process stdout.
    pub stdout_sink: Option<StdoutSink>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            user_prompt: String::new(),
            working_directory: PathBuf::from("."),
            agent_name: None,
            task_id: None,
            session_id: None,
            model: None,
            env_overlay: BTreeMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            hard_kill_grace: DEFAULT_HARD_KILL_GRACE,
            verbose: false,
            on_event: None,
            on_heartbeat: None,
            on_timeout: None,
            stdout_sink: None,
        }
    }
}

/// The outcome of one `AgentRuntime::run` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentResult {
    /// Whether the run is considered successful.
    pub success: bool,
    /// Accumulated assistant text and raw non-JSON output.
    pub output: String,
    /// Session id observed during the run, if any.
    pub session_id: Option<String>,
    /// `"timed out"`, the error accumulator, `"exit code N"`, or absent.
    pub error: Option<String>,
}

/// Spawns external CLIs per an [`AgentSpec`] and normalizes their event
/// streams. See the module docs for the overall shape.
#[derive(Clone)]
pub struct AgentRuntime {
    registry: Arc<AgentRegistry>,
    sessions: SessionIndex,
    spawner: Arc<dyn ProcessSpawner>,
    bus: Option<Arc<dyn EventBus>>,
}

impl AgentRuntime {
    /// Build a runtime around the given registry, using the real
    /// `tokio::process`-backed spawner.
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            sessions: SessionIndex::new(),
            spawner: Arc::new(TokioProcessSpawner),
            bus: None,
        }
    }

    /// Override the process spawner — used by tests to inject a fake
    /// subprocess.
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Attach an event bus; process lifecycle events are published to it.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// The backing registry.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The session index, shared with anything that needs to observe or
    /// interject running sessions.
    pub fn sessions(&self) -> &SessionIndex {
        &self.sessions
    }

    /// Resolve `name` from the registry and run it.
    pub async fn run_agent(&self, name: &str, mode: RunMode, options: RunOptions) -> AgentResult {
        let Some(spec) = self.registry.get(name).cloned() else {
            return AgentResult {
                success: false,
                output: String::new(),
                session_id: None,
                error: Some(format!("no AgentSpec registered under {name}")),
            };
        };
        self.run(&spec, mode, options).await
    }

    /// Spawn `spec` in `mode` and drive it to completion.
    #[instrument(skip(self, spec, options), fields(agent = %spec.name, mode = ?mode))]
    pub async fn run(&self, spec: &AgentSpec, mode: RunMode, options: RunOptions) -> AgentResult {
        let plan = match build_argv(
            spec,
            mode,
            options.model.as_deref(),
            options.session_id.as_deref(),
            &options.system_prompt,
            &options.user_prompt,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "argv assembly failed");
                return AgentResult {
                    success: false,
                    output: String::new(),
                    session_id: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let env = build_env(spec, &options.env_overlay);
        let piped = mode == RunMode::Streaming;
        let mut handle = match self
            .spawner
            .spawn(&spec.command, &plan.argv[1..], &options.working_directory, &env, piped)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "failed to spawn agent subprocess");
                return AgentResult {
                    success: false,
                    output: String::new(),
                    session_id: None,
                    error: Some(format!("{e} ({})", spec.docs)),
                };
            }
        };

        let agent_name = options.agent_name.clone().unwrap_or_else(|| spec.name.clone());
        let pid = handle.pid();
        let session = AgentSession::new(
            agent_name.clone(),
            options.task_id.clone(),
            options.working_directory.display().to_string(),
            pid,
        );
        self.sessions.insert(session.clone());

        if let Some(bus) = &self.bus {
            bus.publish(BloomEvent::AgentProcessStarted {
                agent_name: agent_name.clone(),
                pid: pid.unwrap_or(0),
                command: plan.argv.join(" "),
            });
        }

        let result = match mode {
            RunMode::Streaming => {
                self.run_streaming(spec, handle.as_mut(), session.clone(), &options).await
            }
            RunMode::Interactive => self.run_interactive(handle.as_mut(), session.clone()).await,
        };

        self.sessions.remove(&agent_name);
        if let Some(bus) = &self.bus {
            bus.publish(BloomEvent::AgentProcessEnded {
                agent_name,
                pid: pid.unwrap_or(0),
                exit_code: exit_code_from_result(&result),
            });
        }

        result
    }

    /// Look up the session for `agent_name`, request graceful
    /// termination, and remove it from the index. Returns `None` if no
    /// session is running under that name (the `SessionDisappeared`
    /// case).
    pub fn interject(&self, agent_name: &str) -> Option<AgentSession> {
        let session = self.sessions.request_interject(agent_name)?;
        self.sessions.remove(agent_name);
        Some(session)
    }

    async fn run_streaming(
        &self,
        spec: &AgentSpec,
        handle: &mut dyn ProcessHandle,
        session: AgentSession,
        options: &RunOptions,
    ) -> AgentResult {
        let write: Box<dyn Fn(&str)> = match &options.stdout_sink {
            Some(sink) => {
                let sink = sink.clone();
                Box::new(move |s: &str| sink(s))
            }
            None => Box::new(|s: &str| {
                print!("{s}");
            }),
        };

        let mut output_acc = String::new();
        let mut error_acc = String::new();
        let mut timed_out = false;

        let mut heartbeat_timer = tokio::time::interval(options.heartbeat_interval);
        heartbeat_timer.tick().await;

        'outer: loop {
            tokio::select! {
                line = handle.next_line() => {
                    match line {
                        Ok(Some(ChildLine::Stdout(raw))) => {
                            session.touch();
                            handle_stdout_line(&raw, spec, &session, &mut output_acc, &mut error_acc, options, write.as_ref());
                        }
                        Ok(Some(ChildLine::Stderr(raw))) => {
                            session.touch();
                            debug!(agent = %spec.name, line = %raw, "stderr");
                        }
                        Ok(None) => break 'outer,
                        Err(e) => {
                            warn!(error = %e, "error reading child output");
                            break 'outer;
                        }
                    }
                }
                _ = heartbeat_timer.tick() => {
                    let idle = session.idle_secs();
                    if idle >= options.activity_timeout.as_secs() {
                        timed_out = true;
                        if let Some(cb) = &options.on_timeout {
                            cb();
                        }
                        write(&render_timeout(idle));
                        handle.terminate();
                        break 'outer;
                    } else if idle >= options.heartbeat_interval.as_secs() {
                        if let Some(cb) = &options.on_heartbeat {
                            cb(Duration::from_secs(idle));
                        }
                        write(&render_heartbeat(idle));
                    }
                }
            }

            if session.interject_requested() {
                handle.terminate();
                break 'outer;
            }
        }

        let exit_code = if timed_out || session.interject_requested() {
            drain_until_grace(handle, &session, spec, &mut output_acc, &mut error_acc, options, write.as_ref(), options.hard_kill_grace).await
        } else {
            handle.wait().await.unwrap_or(-1)
        };

        let success = !timed_out && exit_code == 0 && error_acc.is_empty();
        let error = if timed_out {
            Some("timed out".to_string())
        } else if !error_acc.is_empty() {
            Some(error_acc)
        } else if exit_code != 0 {
            Some(format!("exit code {exit_code}"))
        } else {
            None
        };

        AgentResult {
            success,
            output: output_acc,
            session_id: session.session_id(),
            error,
        }
    }

    async fn run_interactive(&self, handle: &mut dyn ProcessHandle, session: AgentSession) -> AgentResult {
        let exit_code = loop {
            tokio::select! {
                result = handle.wait() => break result.unwrap_or(-1),
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if session.interject_requested() {
                        handle.terminate();
                    }
                }
            }
        };

        AgentResult {
            success: exit_code == 0,
            output: String::new(),
            session_id: session.session_id(),
            error: if exit_code == 0 {
                None
            } else {
                Some(format!("exit code {exit_code}"))
            },
        }
    }
}

fn exit_code_from_result(result: &AgentResult) -> Option<i32> {
    match &result.error {
        None => Some(0),
        Some(msg) if msg.starts_with("exit code ") => msg.trim_start_matches("exit code ").parse().ok(),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_until_grace(
    handle: &mut dyn ProcessHandle,
    session: &AgentSession,
    spec: &AgentSpec,
    output_acc: &mut String,
    error_acc: &mut String,
    options: &RunOptions,
    write: &dyn Fn(&str),
    grace: Duration,
) -> i32 {
    let sleep = tokio::time::sleep(grace);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            line = handle.next_line() => {
                match line {
                    Ok(Some(ChildLine::Stdout(raw))) => {
                        session.touch();
                        handle_stdout_line(&raw, spec, session, output_acc, error_acc, options, write);
                    }
                    Ok(Some(ChildLine::Stderr(_))) => session.touch(),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            _ = &mut sleep => {
                handle.kill().await;
                break;
            }
        }
    }
    handle.wait().await.unwrap_or(-1)
}

fn handle_stdout_line(
    raw: &str,
    spec: &AgentSpec,
    session: &AgentSession,
    output_acc: &mut String,
    error_acc: &mut String,
    options: &RunOptions,
    write: &dyn Fn(&str),
) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
            if let Some(id) = extract_session_id(&spec.output, &value) {
                session.set_session_id_if_absent(id);
            }
            let normalized = normalize(&value);
            match &normalized {
                NormalizedEvent::AssistantText(text) => output_acc.push_str(text),
                NormalizedEvent::Error { message } => {
                    if !error_acc.is_empty() {
                        error_acc.push_str("; ");
                    }
                    error_acc.push_str(message);
                }
                _ => {}
            }
            if let Some(cb) = &options.on_event {
                cb(&normalized);
            }
            if let Some(rendered) = render_event(&normalized, options.verbose) {
                write(&rendered);
            }
        }
        Err(_) => {
            output_acc.push_str(raw);
            output_acc.push('\n');
            write(raw);
            write("\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeProcessSpawner;
    use std::sync::Mutex as StdMutex;

    fn capture_sink() -> (StdoutSink, Arc<StdMutex<String>>) {
        let buf = Arc::new(StdMutex::new(String::new()));
        let buf2 = buf.clone();
        let sink: StdoutSink = Arc::new(move |s: &str| buf2.lock().unwrap().push_str(s));
        (sink, buf)
    }

    #[tokio::test]
    async fn happy_path_streams_text_cost_and_duration() {
        let registry = AgentRegistry::with_builtins();
        let spec = registry.get("claude-code").unwrap().clone();
        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"system","subtype":"init","session_id":"s1","model":"m"}"#.to_string(),
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}"#.to_string(),
            r#"{"type":"result","total_cost_usd":0.01,"duration_ms":1200}"#.to_string(),
        ]));
        let runtime = AgentRuntime::new(registry).with_spawner(spawner);

        let (sink, buf) = capture_sink();
        let options = RunOptions {
            stdout_sink: Some(sink),
            ..Default::default()
        };

        let result = runtime.run(&spec, RunMode::Streaming, options).await;
        assert!(result.success);
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.output, "ok");

        let rendered = buf.lock().unwrap().clone();
        assert!(rendered.contains("ok"));
        assert!(rendered.contains("$0.0100"));
        assert!(rendered.contains("1.2s"));
    }

    #[tokio::test]
    async fn error_event_marks_failure() {
        let registry = AgentRegistry::with_builtins();
        let spec = registry.get("claude-code").unwrap().clone();
        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"error","error":{"message":"boom"}}"#.to_string(),
        ]));
        let runtime = AgentRuntime::new(registry).with_spawner(spawner);

        let result = runtime.run(&spec, RunMode::Streaming, RunOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn timeout_fires_when_no_activity() {
        let registry = AgentRegistry::with_builtins();
        let spec = registry.get("claude-code").unwrap().clone();
        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![
            r#"{"type":"system","subtype":"init","session_id":"s1"}"#.to_string(),
        ]));
        let runtime = AgentRuntime::new(registry).with_spawner(spawner);

        let options = RunOptions {
            heartbeat_interval: Duration::from_millis(5),
            activity_timeout: Duration::from_millis(20),
            hard_kill_grace: Duration::from_millis(20),
            ..Default::default()
        };

        let result = runtime.run(&spec, RunMode::Streaming, options).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn interject_on_unknown_agent_returns_none() {
        let runtime = AgentRuntime::new(AgentRegistry::with_builtins());
        assert!(runtime.interject("ghost").is_none());
    }

    #[tokio::test]
    async fn missing_model_fails_fast_without_spawning() {
        let registry = AgentRegistry::with_builtins();
        let spec = registry.get("aider").unwrap().clone(); // model_required_for_streaming = true
        let spawner = Arc::new(FakeProcessSpawner::with_lines(vec![]));
        let runtime = AgentRuntime::new(registry).with_spawner(spawner.clone());

        let result = runtime.run(&spec, RunMode::Streaming, RunOptions::default()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("model is required"));
        assert_eq!(spawner.spawn_count(), 0);
    }
}
