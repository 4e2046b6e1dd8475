//! The subprocess abstraction: [`ProcessHandle`] + [`ProcessSpawner`],
//! and [`TokioProcessSpawner`], the real `tokio::process`-backed
//! implementation.
//!
//! Grounding: the process-group + `SIGTERM` → grace → `SIGKILL`
//! escalation below follows the same shape used for local command
//! execution elsewhere in the retrieved corpus (a local execution
//! environment that puts the child in its own process group, arms
//! `kill_on_drop`, and signals the whole group rather than the single
//! pid so subprocess-spawned grandchildren die too).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::AgentRuntimeError;

/// One line of output from a child process, tagged by which stream it
/// came from. Only `Stdout` lines are parsed as JSON; `Stderr` lines
/// count as activity but are never accumulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildLine {
    /// A line read from the child's stdout.
    Stdout(String),
    /// A line read from the child's stderr.
    Stderr(String),
}

/// A running (or exited) child process, abstracted so tests can supply
/// a fake subprocess in place of a real OS process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the next stdout or stderr line. Returns `Ok(None)` once
    /// both streams have reached EOF.
    async fn next_line(&mut self) -> std::io::Result<Option<ChildLine>>;

    /// Block until the process exits, reaping it.
    async fn wait(&mut self) -> std::io::Result<i32>;

    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Send a graceful termination request (SIGTERM-equivalent). Never
    /// blocks.
    fn terminate(&self);

    /// Forcefully kill the process (SIGKILL-equivalent) and reap it.
    async fn kill(&mut self);
}

/// Spawns [`ProcessHandle`]s. The real implementation is
/// [`TokioProcessSpawner`]; `testkit` provides a fake that replays
/// canned lines under test control.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn `command` with `args` in `cwd`, with `env` as the full
    /// environment. `piped` selects streaming mode (stdout/stderr
    /// captured) versus interactive mode (stdio inherited from the
    /// parent, `ProcessHandle::next_line` never yields anything).
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        piped: bool,
    ) -> Result<Box<dyn ProcessHandle>, AgentRuntimeError>;
}

/// Real subprocess spawner, backed by `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessSpawner;

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        piped: bool,
    ) -> Result<Box<dyn ProcessHandle>, AgentRuntimeError> {
        let mut cmd = Command::new(command);
        cmd.args(args).current_dir(cwd);
        cmd.env_clear();
        for (k, v) in env {
            cmd.env(k, v);
        }

        if piped {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            cmd.stdin(Stdio::null());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
            cmd.stdin(Stdio::inherit());
        }

        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| AgentRuntimeError::SpawnError {
            command: command.to_string(),
            docs: String::new(),
            source: e,
        })?;

        let pid = child.id();
        let (tx, rx) = mpsc::unbounded_channel::<std::io::Result<ChildLine>>();

        if piped {
            if let Some(stdout) = child.stdout.take() {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    loop {
                        match lines.next_line().await {
                            Ok(Some(line)) => {
                                if tx.send(Ok(ChildLine::Stdout(line))).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                let _ = tx.send(Err(e));
                                break;
                            }
                        }
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(Ok(ChildLine::Stderr(line))).is_err() {
                            break;
                        }
                    }
                });
            }
        }
        drop(tx);

        Ok(Box::new(TokioProcessHandle { child, pid, rx }))
    }
}

struct TokioProcessHandle {
    child: tokio::process::Child,
    pid: Option<u32>,
    rx: mpsc::UnboundedReceiver<std::io::Result<ChildLine>>,
}

#[async_trait]
impl ProcessHandle for TokioProcessHandle {
    async fn next_line(&mut self) -> std::io::Result<Option<ChildLine>> {
        match self.rx.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            sigterm_process_group(pid);
        }
        #[cfg(not(unix))]
        {
            // start_kill requires &mut; nothing graceful is available on
            // non-unix, so terminate() is a no-op and the caller's
            // `hardKillGrace` escalation to kill() takes over.
        }
    }

    async fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            sigkill_process_group(pid);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
    }
}

/// Send `SIGTERM` to every process in `pid`'s process group.
///
/// # Safety contract
/// `libc::kill(-pid, sig)` is a thin syscall wrapper; calling it with a
/// pid this process just spawned (and placed in its own group via
/// `process_group(0)`) is the documented way to signal a whole group
/// per POSIX `kill(2)`.
#[cfg(unix)]
fn sigterm_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(unix)]
fn sigkill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}
