//! Argv and environment assembly from an [`AgentSpec`], following a
//! generic six-step algorithm any registered CLI's spec can drive.

use std::collections::BTreeMap;

use bloom_types::{AgentSpec, PromptStyle};

use crate::runtime::RunMode;
use crate::AgentRuntimeError;

/// A fully assembled invocation plan: the argv vector and the prompt
/// text it already embeds (for `promptStyle: Positional` this duplicates
/// the last argv entry; kept separately so callers can log the prompt
/// without re-deriving it from argv).
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPlan {
    /// Full argv, including argv[0] (the command itself).
    pub argv: Vec<String>,
    /// The prompt text threaded onto argv per `promptStyle`.
    pub prompt_text: String,
}

/// Assemble argv for `spec` in `mode`, following the six-step algorithm
/// below: subcommand/base args, approval bypass, model flag, resume
/// flag, prompt text, then the prompt attached per `promptStyle`.
#[allow(clippy::too_many_arguments)]
pub fn build_argv(
    spec: &AgentSpec,
    mode: RunMode,
    model: Option<&str>,
    session_id: Option<&str>,
    system_prompt: &str,
    user_prompt: &str,
) -> Result<SpawnPlan, AgentRuntimeError> {
    let mode_spec = match mode {
        RunMode::Interactive => &spec.interactive,
        RunMode::Streaming => &spec.streaming,
    };

    let mut argv = vec![spec.command.clone()];
    if let Some(subcommand) = &mode_spec.subcommand {
        argv.push(subcommand.clone());
    }
    argv.extend(mode_spec.base_args.iter().cloned());

    // Step 2: approval bypass only applies in streaming mode.
    if mode == RunMode::Streaming {
        if let Some(bypass) = &spec.flags.approval_bypass {
            argv.push(bypass.clone());
        }
    }

    // Step 3: model flag, or fail fast if streaming requires one.
    match (model, &spec.flags.model) {
        (Some(model), Some(flag)) => {
            argv.push(flag.clone());
            argv.push(model.to_string());
        }
        (None, _) if spec.model_required_for_streaming && mode == RunMode::Streaming => {
            return Err(AgentRuntimeError::MissingModel {
                agent: spec.name.clone(),
            });
        }
        _ => {}
    }

    // Step 4: resume flag.
    if let (Some(session_id), Some(flag)) = (session_id, &spec.flags.resume) {
        argv.push(flag.clone());
        argv.push(session_id.to_string());
    }

    // Step 5: prompt text, with the dedicated system-prompt flag when
    // the mode doesn't prepend.
    let prompt_text = if mode_spec.prepend_system_prompt {
        if system_prompt.is_empty() {
            user_prompt.to_string()
        } else {
            format!("{system_prompt}\n\n{user_prompt}")
        }
    } else {
        if let Some(flag) = &spec.flags.system_prompt {
            if !system_prompt.is_empty() {
                argv.push(flag.clone());
                argv.push(system_prompt.to_string());
            }
        }
        user_prompt.to_string()
    };

    // Step 6: attach the prompt per its style.
    match &mode_spec.prompt_style {
        PromptStyle::Positional => argv.push(prompt_text.clone()),
        PromptStyle::Flag { flag } => {
            argv.push(flag.clone());
            argv.push(prompt_text.clone());
        }
    }

    Ok(SpawnPlan { argv, prompt_text })
}

/// The child's environment: the parent's environment with `spec.env.inject`
/// (and any caller-supplied overlay, e.g. `agent.<name>.env` from
/// configuration) layered on top. `spec.env.required` is intentionally
/// not consulted here — it's reserved for external probes, not enforced
/// by the runtime itself.
pub fn build_env(spec: &AgentSpec, overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (k, v) in &spec.env.inject {
        env.insert(k.clone(), v.clone());
    }
    for (k, v) in overlay {
        env.insert(k.clone(), v.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;

    fn claude() -> AgentSpec {
        AgentRegistry::with_builtins().get("claude-code").unwrap().clone()
    }

    #[test]
    fn streaming_appends_approval_bypass_and_model_and_prompt_positionally() {
        let spec = claude();
        let plan = build_argv(&spec, RunMode::Streaming, Some("opus"), None, "sys", "do the thing").unwrap();
        assert_eq!(
            plan.argv,
            vec![
                "claude",
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
                "--model",
                "opus",
                "--append-system-prompt",
                "sys",
                "do the thing",
            ]
        );
        assert_eq!(plan.prompt_text, "do the thing");
    }

    #[test]
    fn streaming_with_resume_appends_resume_flag() {
        let spec = claude();
        let plan = build_argv(&spec, RunMode::Streaming, None, Some("s1"), "", "go").unwrap();
        assert!(plan.argv.windows(2).any(|w| w == ["--resume", "s1"]));
    }

    #[test]
    fn interactive_prepends_system_prompt_and_is_positional() {
        let spec = claude();
        let plan = build_argv(&spec, RunMode::Interactive, None, None, "sys", "go").unwrap();
        assert_eq!(plan.prompt_text, "sys\n\ngo");
        assert_eq!(plan.argv.last().unwrap(), "sys\n\ngo");
    }

    #[test]
    fn missing_model_fails_when_required_for_streaming() {
        let mut spec = claude();
        spec.model_required_for_streaming = true;
        let err = build_argv(&spec, RunMode::Streaming, None, None, "", "go").unwrap_err();
        assert!(matches!(err, AgentRuntimeError::MissingModel { .. }));
    }

    #[test]
    fn flag_style_prompt_appends_flag_then_value() {
        let spec = AgentRegistry::with_builtins().get("aider").unwrap().clone();
        let plan = build_argv(&spec, RunMode::Interactive, None, None, "sys", "go").unwrap();
        assert!(plan.argv.windows(2).any(|w| w[0] == "--message" && w[1] == plan.prompt_text));
    }

    #[test]
    fn build_env_overlays_spec_inject_then_caller_overlay() {
        let mut spec = claude();
        spec.env.inject.insert("FOO".to_string(), "from_spec".to_string());
        let mut overlay = BTreeMap::new();
        overlay.insert("FOO".to_string(), "from_config".to_string());
        let env = build_env(&spec, &overlay);
        assert_eq!(env.get("FOO").map(String::as_str), Some("from_config"));
    }
}
