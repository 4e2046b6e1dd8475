//! Fakes for [`crate::process::ProcessSpawner`]/[`crate::process::ProcessHandle`]
//! so [`crate::runtime::AgentRuntime`] can be exercised against canned
//! event streams without spawning a real subprocess.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::process::{ChildLine, ProcessHandle, ProcessSpawner};
use crate::AgentRuntimeError;

/// A [`ProcessSpawner`] that ignores the command/args/cwd/env it's given
/// and hands back a [`FakeProcessHandle`] that replays a canned sequence
/// of stdout lines, then reports an exit code.
pub struct FakeProcessSpawner {
    lines: Vec<String>,
    exit_code: i32,
    spawn_count: Arc<AtomicUsize>,
}

impl FakeProcessSpawner {
    /// Replay `lines` as stdout, one JSON (or raw) line each, then exit 0.
    pub fn with_lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            exit_code: 0,
            spawn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Like [`Self::with_lines`] but exits with `code` instead of 0.
    pub fn with_lines_and_exit_code(lines: Vec<String>, code: i32) -> Self {
        Self {
            lines,
            exit_code: code,
            spawn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times [`ProcessSpawner::spawn`] has been called — lets
    /// tests assert a spawn never happened (e.g. `MissingModel` failing
    /// fast).
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessSpawner for FakeProcessSpawner {
    async fn spawn(
        &self,
        _command: &str,
        _args: &[String],
        _cwd: &Path,
        _env: &BTreeMap<String, String>,
        _piped: bool,
    ) -> Result<Box<dyn ProcessHandle>, AgentRuntimeError> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcessHandle {
            remaining: Arc::new(Mutex::new(self.lines.clone().into_iter().collect())),
            exit_code: self.exit_code,
            terminated: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }))
    }
}

struct FakeProcessHandle {
    remaining: Arc<Mutex<std::collections::VecDeque<String>>>,
    exit_code: i32,
    terminated: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl ProcessHandle for FakeProcessHandle {
    async fn next_line(&mut self) -> std::io::Result<Option<ChildLine>> {
        if self.terminated.load(Ordering::SeqCst) {
            // A terminated fake never produces more output; pending
            // so the caller's select! doesn't busy-loop forever.
            std::future::pending::<()>().await;
        }
        let mut guard = self.remaining.lock().await;
        Ok(guard.pop_front().map(ChildLine::Stdout))
    }

    async fn wait(&mut self) -> std::io::Result<i32> {
        Ok(self.exit_code)
    }

    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    async fn kill(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}
