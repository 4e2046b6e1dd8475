//! The static table of built-in [`AgentSpec`]s.
//!
//! New CLIs are added as data, not code — this module is that data. It
//! ships three archetypal specs so the data-driven design has concrete,
//! testable instances: a streaming-JSON assistant in the style of
//! Claude Code, a second streaming-JSON assistant with a
//! differently-named session-id field (to exercise `session_id_field_alt`),
//! and a plain-output pair-programming CLI in the style of Aider. None of
//! these are meant to byte-match a real vendor's CLI; they're fixtures
//! that satisfy the shape in `bloom_types::AgentSpec`.

use std::collections::BTreeMap;

use bloom_types::{AgentSpec, EnvSpec, FlagsSpec, ModeSpec, OutputFormat, OutputSpec, PromptStyle};

/// An in-memory, name-keyed table of [`AgentSpec`]s.
///
/// Registering a new supported CLI is a matter of constructing an
/// `AgentSpec` value and calling [`AgentRegistry::register`] — no change
/// to `bloom-agent-runtime`'s execution code is required.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    specs: BTreeMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the three built-in archetypal specs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for spec in builtin_specs() {
            registry.register(spec);
        }
        registry
    }

    /// Add or replace a spec under its own `name`.
    pub fn register(&mut self, spec: AgentSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Look up a spec by name.
    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.specs.get(name)
    }

    /// All registered names, in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }
}

/// The built-in seed specs, in the order Claude-style, aider-style,
/// alt-session-field streaming style.
pub fn builtin_specs() -> Vec<AgentSpec> {
    vec![claude_code_style(), aider_style(), second_streaming_style()]
}

/// A streaming-JSON assistant in the style of Claude Code: a single
/// `--print` streaming mode, `--resume <id>` for session continuation, a
/// `--dangerously-skip-permissions`-equivalent approval bypass, and
/// `session_id` as the wire field for session identity.
fn claude_code_style() -> AgentSpec {
    AgentSpec {
        name: "claude-code".to_string(),
        command: "claude".to_string(),
        version_args: vec!["--version".to_string()],
        interactive: ModeSpec {
            subcommand: None,
            base_args: vec![],
            prompt_style: PromptStyle::Positional,
            prepend_system_prompt: true,
        },
        streaming: ModeSpec {
            subcommand: None,
            base_args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            prompt_style: PromptStyle::Positional,
            prepend_system_prompt: false,
        },
        flags: FlagsSpec {
            model: Some("--model".to_string()),
            resume: Some("--resume".to_string()),
            approval_bypass: Some("--dangerously-skip-permissions".to_string()),
            system_prompt: Some("--append-system-prompt".to_string()),
        },
        env: EnvSpec {
            inject: BTreeMap::new(),
            required: vec!["ANTHROPIC_API_KEY".to_string()],
        },
        output: OutputSpec {
            format: OutputFormat::StreamJson,
            session_id_field: "session_id".to_string(),
            session_id_field_alt: None,
        },
        models_command: Some(vec!["claude".to_string(), "models".to_string()]),
        model_required_for_streaming: false,
        docs: "install the CLI and ensure ANTHROPIC_API_KEY is set".to_string(),
    }
}

/// A plain-output pair-programming CLI in the style of Aider: no
/// streaming-JSON mode at all, so `streaming` degrades to the same
/// inherited-stdio shape as `interactive` but with `--yes` for
/// unattended approval. Used to exercise `OutputFormat::Plain`.
fn aider_style() -> AgentSpec {
    AgentSpec {
        name: "aider".to_string(),
        command: "aider".to_string(),
        version_args: vec!["--version".to_string()],
        interactive: ModeSpec {
            subcommand: None,
            base_args: vec![],
            prompt_style: PromptStyle::Flag {
                flag: "--message".to_string(),
            },
            prepend_system_prompt: true,
        },
        streaming: ModeSpec {
            subcommand: None,
            base_args: vec!["--yes".to_string()],
            prompt_style: PromptStyle::Flag {
                flag: "--message".to_string(),
            },
            prepend_system_prompt: true,
        },
        flags: FlagsSpec {
            model: Some("--model".to_string()),
            resume: None,
            approval_bypass: Some("--yes".to_string()),
            system_prompt: None,
        },
        env: EnvSpec {
            inject: BTreeMap::new(),
            required: vec![],
        },
        output: OutputSpec {
            format: OutputFormat::Plain,
            session_id_field: "session_id".to_string(),
            session_id_field_alt: None,
        },
        models_command: None,
        model_required_for_streaming: true,
        docs: "pip install aider-chat".to_string(),
    }
}

/// A second streaming-JSON assistant whose wire format names the
/// session-id field `sessionID` on most events but falls back to
/// `conversation_id` on a few — the reason `AgentSpec::output` carries
/// `session_id_field_alt` at all.
fn second_streaming_style() -> AgentSpec {
    AgentSpec {
        name: "codex-cli".to_string(),
        command: "codex".to_string(),
        version_args: vec!["--version".to_string()],
        interactive: ModeSpec {
            subcommand: Some("chat".to_string()),
            base_args: vec![],
            prompt_style: PromptStyle::Positional,
            prepend_system_prompt: true,
        },
        streaming: ModeSpec {
            subcommand: Some("exec".to_string()),
            base_args: vec!["--json".to_string()],
            prompt_style: PromptStyle::Positional,
            prepend_system_prompt: false,
        },
        flags: FlagsSpec {
            model: Some("--model".to_string()),
            resume: Some("--continue".to_string()),
            approval_bypass: Some("--full-auto".to_string()),
            system_prompt: Some("--system".to_string()),
        },
        env: EnvSpec {
            inject: BTreeMap::new(),
            required: vec!["OPENAI_API_KEY".to_string()],
        },
        output: OutputSpec {
            format: OutputFormat::StreamJson,
            session_id_field: "sessionID".to_string(),
            session_id_field_alt: Some("conversation_id".to_string()),
        },
        models_command: Some(vec!["codex".to_string(), "models".to_string()]),
        model_required_for_streaming: true,
        docs: "npm install -g @openai/codex-cli".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_register_under_their_own_names() {
        let registry = AgentRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["aider", "claude-code", "codex-cli"]
        );
    }

    #[test]
    fn register_replaces_existing_entry() {
        let mut registry = AgentRegistry::new();
        let mut spec = claude_code_style();
        registry.register(spec.clone());
        spec.command = "claude-beta".to_string();
        registry.register(spec);
        assert_eq!(registry.get("claude-code").unwrap().command, "claude-beta");
    }
}
