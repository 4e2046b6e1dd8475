//! Static description of an external coding-assistant CLI.
//!
//! An [`AgentSpec`] is pure data: it describes how to build argv, which
//! environment variables to inject, and how to interpret the CLI's
//! output. `bloom-agent-runtime` is the single generic interpreter that
//! walks this data — adding a new supported CLI means writing a new
//! `AgentSpec` value, never new runtime code.

use serde::{Deserialize, Serialize};

/// How the runtime should invoke the CLI in a given mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSpec {
    /// Subcommand to insert right after the binary name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
    /// Arguments always present for this mode.
    #[serde(default)]
    pub base_args: Vec<String>,
    /// How the prompt text is attached to argv.
    pub prompt_style: PromptStyle,
    /// Whether the system prompt should be prepended to the user
    /// prompt rather than passed via a dedicated flag.
    pub prepend_system_prompt: bool,
}

/// How the assembled prompt text is attached to argv.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptStyle {
    /// Appended as a bare positional argument.
    Positional,
    /// Appended as `<flag> <value>`.
    Flag {
        /// The flag name, e.g. `--message`.
        flag: String,
    },
}

/// Argv-prefix flags the runtime may need to append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagsSpec {
    /// Flag used to select a model, e.g. `--model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Flag used to resume a previous session, e.g. `--resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    /// Flag that bypasses interactive approval prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_bypass: Option<String>,
    /// Flag used to pass a dedicated system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Environment variables injected into, or required by, the subprocess.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvSpec {
    /// Overlaid on the parent environment unconditionally.
    #[serde(default)]
    pub inject: std::collections::BTreeMap<String, String>,
    /// Names external probes expect to be present (not enforced by the
    /// runtime itself).
    #[serde(default)]
    pub required: Vec<String>,
}

/// Shape of the CLI's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Newline-delimited JSON events.
    StreamJson,
    /// A single JSON document on exit.
    Json,
    /// Unstructured text.
    Plain,
}

/// How to interpret the CLI's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Output shape.
    pub format: OutputFormat,
    /// JSON field carrying the session id.
    pub session_id_field: String,
    /// Alternate field name some event kinds use instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id_field_alt: Option<String>,
}

/// Static description of one supported external CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Name this spec is registered under (also the argv[0] basename
    /// unless `command` overrides it).
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments used to probe the CLI's version (diagnostics only).
    #[serde(default)]
    pub version_args: Vec<String>,
    /// Non-streaming invocation: inherits the parent's stdio.
    pub interactive: ModeSpec,
    /// Streaming invocation: stdio is piped and parsed.
    pub streaming: ModeSpec,
    /// Argv-prefix flags.
    #[serde(default)]
    pub flags: FlagsSpec,
    /// Environment variable handling.
    #[serde(default)]
    pub env: EnvSpec,
    /// Output stream shape and session-id field mapping.
    pub output: OutputSpec,
    /// Command used to list available models, if supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_command: Option<Vec<String>>,
    /// Whether streaming mode requires an explicit model to be set.
    #[serde(default)]
    pub model_required_for_streaming: bool,
    /// Human-readable installation hint surfaced on `SpawnError`.
    #[serde(default)]
    pub docs: String,
}
