//! Test-only helpers for downstream crates (`apps/bloom-cli`'s test
//! suite in particular) that need a fully-wired [`Scheduler`] without
//! standing up a real git checkout or prompt template store.

use std::sync::Arc;

use bloom_agent_runtime::AgentRuntime;
use bloom_config::BloomConfig;
use bloom_store::TaskStore;

use crate::prompt::TemplatePromptAssembler;
use crate::repo::FixedDirRepoManager;
use crate::Scheduler;

/// Build a [`Scheduler`] whose `RepoManager` always resolves to `work_dir`
/// and whose `PromptAssembler` is the built-in template assembler. Pair
/// with an [`AgentRuntime`] built on
/// [`bloom_agent_runtime::testkit::FakeProcessSpawner`] for deterministic
/// end-to-end scenarios that never spawn a real subprocess.
pub fn scheduler_with_fixed_dir(
    store: TaskStore,
    runtime: Arc<AgentRuntime>,
    config: BloomConfig,
    work_dir: impl Into<std::path::PathBuf>,
) -> Arc<Scheduler> {
    Scheduler::new(
        store,
        runtime,
        config,
        Arc::new(FixedDirRepoManager::new(work_dir.into())),
        Arc::new(TemplatePromptAssembler::default()),
    )
}
