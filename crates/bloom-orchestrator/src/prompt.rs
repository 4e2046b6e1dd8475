//! The `PromptAssembler` collaborator: resolves `(systemPrompt,
//! userPrompt)` for a task. [`TemplatePromptAssembler`]
//! is a minimal, format-string-based default — not the markdown
//! template engine a full deployment would use.

use async_trait::async_trait;
use bloom_types::Task;

use crate::OrchestratorError;

/// Resolves a task into the prompt text an [`bloom_agent_runtime::AgentRuntime`]
/// run needs.
#[async_trait]
pub trait PromptAssembler: Send + Sync {
    /// Build `(system_prompt, user_prompt)` for `task`.
    async fn assemble(&self, task: &Task) -> Result<(String, String), OrchestratorError>;
}

/// Builds a fixed system prompt and a user prompt assembled from the
/// task's own fields — title, instructions, acceptance criteria, and
/// any `aiNotes` left for the agent. No external template file is
/// read; a real deployment's markdown-template renderer is out of
/// scope here.
#[derive(Debug, Clone, Default)]
pub struct TemplatePromptAssembler {
    /// Prepended to every task's system prompt.
    pub system_preamble: String,
}

impl TemplatePromptAssembler {
    /// A prompt assembler with a fixed system preamble.
    pub fn new(system_preamble: impl Into<String>) -> Self {
        Self {
            system_preamble: system_preamble.into(),
        }
    }
}

#[async_trait]
impl PromptAssembler for TemplatePromptAssembler {
    async fn assemble(&self, task: &Task) -> Result<(String, String), OrchestratorError> {
        let system_prompt = self.system_preamble.clone();

        let mut user_prompt = format!("# {}\n\n{}", task.title, task.instructions);
        if !task.acceptance_criteria.is_empty() {
            user_prompt.push_str("\n\n## Acceptance criteria\n");
            for criterion in &task.acceptance_criteria {
                user_prompt.push_str(&format!("- {criterion}\n"));
            }
        }
        if !task.ai_notes.is_empty() {
            user_prompt.push_str("\n## Notes\n");
            for note in &task.ai_notes {
                user_prompt.push_str(&format!("- {note}\n"));
            }
        }

        Ok((system_prompt, user_prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assembles_title_instructions_and_criteria() {
        let mut task = Task::new("a".to_string(), "Add widget".to_string());
        task.instructions = "Build the thing.".to_string();
        task.acceptance_criteria = vec!["compiles".to_string(), "has tests".to_string()];

        let assembler = TemplatePromptAssembler::new("be careful");
        let (system, user) = assembler.assemble(&task).await.unwrap();

        assert_eq!(system, "be careful");
        assert!(user.contains("# Add widget"));
        assert!(user.contains("Build the thing."));
        assert!(user.contains("- compiles"));
        assert!(user.contains("- has tests"));
    }

    #[tokio::test]
    async fn omits_sections_with_no_content() {
        let task = Task::new("a".to_string(), "Bare task".to_string());
        let assembler = TemplatePromptAssembler::default();
        let (_, user) = assembler.assemble(&task).await.unwrap();
        assert!(!user.contains("Acceptance criteria"));
        assert!(!user.contains("Notes"));
    }
}
