#![deny(missing_docs)]

//! **bloom-agent-runtime** – spawns an external coding-assistant CLI per
//! an [`AgentSpec`](bloom_types::AgentSpec) and translates its
//! proprietary event stream into the uniform [`NormalizedEvent`] shape.
//!
//! The crate is split into:
//!
//! - [`registry`] — the static table of built-in [`AgentSpec`]s.
//! - [`session`] — [`AgentSession`] and the process-wide [`SessionIndex`].
//! - [`event`] — JSON event decoding into [`NormalizedEvent`].
//! - [`render`] — the bit-exact rendered-stdout format.
//! - [`argv`] — argv/env assembly from an [`AgentSpec`].
//! - [`process`] — the subprocess abstraction ([`process::ProcessHandle`],
//!   [`process::ProcessSpawner`]) and its real, `tokio::process`-backed
//!   implementation.
//! - [`runtime`] — [`AgentRuntime`], the public entry point.
//!
//! No module here performs LLM inference itself — every agent is an
//! external subprocess.

pub mod argv;
pub mod event;
pub mod process;
pub mod registry;
pub mod render;
pub mod runtime;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testkit;

pub use bloom_types::AgentSpec;
pub use event::NormalizedEvent;
pub use registry::AgentRegistry;
pub use runtime::{AgentResult, AgentRuntime, RunMode, RunOptions};
pub use session::{AgentSession, SessionIndex};

use std::time::Duration;

/// Default heartbeat tick interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Default activity timeout before a run is declared stuck.
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);
/// Default grace period between graceful termination and a forceful kill.
pub const DEFAULT_HARD_KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors this crate's public operations can surface.
///
/// `AgentRuntime` never panics or propagates an error
/// across `run`'s boundary: every failure mode below ends up folded into
/// [`runtime::AgentResult::error`] rather than an `Err` from `run` itself.
/// This enum exists for the handful of calls (argv assembly, spawn) that
/// *do* need to fail fast before a session even exists.
#[derive(Debug, thiserror::Error)]
pub enum AgentRuntimeError {
    /// Streaming mode was requested for a spec that requires a model, and
    /// none was supplied.
    #[error("model is required for streaming mode with agent {agent}")]
    MissingModel {
        /// Name of the agent spec.
        agent: String,
    },

    /// The child process could not be started (missing binary, permission
    /// denied, ...).
    #[error("failed to spawn {command}: {source}")]
    SpawnError {
        /// The command that failed to start.
        command: String,
        /// Installation hint from the spec's `docs` field, if any.
        docs: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An interjection targeted a session that had already exited.
    #[error("session {0} is no longer active")]
    SessionDisappeared(String),

    /// Generic I/O failure while talking to a child process.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
