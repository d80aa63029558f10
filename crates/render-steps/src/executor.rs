use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use render_types::{EngineError, PlanVersion, Run, SceneId, StepName};

/// What a successful step invocation produced: new or updated artifact
/// paths (relative to the run's artifact root), an opaque resume payload for
/// this step merged into `ResumeState::per_step_data` by the engine, and any
/// measured scene durations to write back onto the owning `PlanVersion`'s
/// `Scene` rows (e.g. `tts_generate` measuring actual narration length).
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    pub artifacts: HashMap<String, String>,
    pub resume_data: Value,
    pub scene_durations: Vec<(SceneId, f64)>,
}

/// The one capability the engine needs from the outside world: run a named
/// pipeline step. Implementations must be idempotent given `run`'s existing
/// resume state (re-invoking a step after partial completion either skips
/// completed sub-work or reproduces the same outputs) and must observe
/// `cancel` at I/O boundaries, returning `EngineError::Canceled` promptly
/// rather than completing unrelated work after cancellation is requested.
///
/// Step bodies never write `Run`/`Project` status; their side effects are
/// confined to files under `artifact_root` and the `StepResult` they return.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(
        &self,
        step: StepName,
        cancel: CancellationToken,
        run: &Run,
        plan: &PlanVersion,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError>;
}
