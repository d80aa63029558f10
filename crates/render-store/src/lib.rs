mod file_store;

use async_trait::async_trait;

use render_types::{PlanVersion, PlanVersionId, Project, ProjectId, Run, RunId};

pub use file_store::FileStore;

/// A mutation applied to a single `Run` inside one `Store::transition_run`
/// call. Boxed so the trait stays object-safe.
pub type RunMutation = Box<dyn FnOnce(&mut Run) + Send>;

/// Durable persistence for `Run`, `Project`, `PlanVersion`, and `Scene`
/// entities. Implementations must make `transition_run` atomic with respect
/// to concurrent `transition_run`/`find_*` calls on the same run, and must
/// never panic or return a parse error to the caller for malformed persisted
/// JSON — treat it as an empty default and let the caller log a warning
/// (`EngineError::Corrupt` is recoverable, not fatal).
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, project: Project) -> anyhow::Result<()>;
    async fn get_project(&self, id: ProjectId) -> anyhow::Result<Option<Project>>;
    async fn save_project(&self, project: Project) -> anyhow::Result<()>;
    async fn delete_project(&self, id: ProjectId) -> anyhow::Result<bool>;

    async fn create_plan_version(&self, plan: PlanVersion) -> anyhow::Result<()>;
    async fn get_plan_version(&self, id: PlanVersionId) -> anyhow::Result<Option<PlanVersion>>;

    /// Write scene durations back onto a `PlanVersion` in one transaction.
    async fn update_scene_durations(
        &self,
        plan_version_id: PlanVersionId,
        durations: &[(render_types::SceneId, f64)],
    ) -> anyhow::Result<()>;

    async fn create_run(&self, run: Run) -> anyhow::Result<()>;
    async fn get_run(&self, id: RunId) -> anyhow::Result<Option<Run>>;

    /// All runs belonging to one project, any status. Used to decide whether
    /// a project should move to `FAILED` after a stuck run is reaped.
    async fn list_runs_for_project(&self, project_id: ProjectId) -> anyhow::Result<Vec<Run>>;

    /// Apply `mutate` to the run and, if `project_update` is given, set the
    /// owning project's status in the same transaction. Returns the updated
    /// run. This is the engine's only way to change `Run.status`,
    /// `Run.progress`, `Run.current_step`, `Run.resume_state`, or
    /// `Run.artifacts` — every multi-row transition goes through here so the
    /// engine never leaves a Run updated without its Project, or vice versa.
    async fn transition_run(
        &self,
        run_id: RunId,
        mutate: RunMutation,
        project_update: Option<(ProjectId, render_types::ProjectStatus)>,
    ) -> anyhow::Result<Run>;

    /// Runs with `status = running`. On a clean restart these are the runs
    /// whose worker died with the process.
    async fn find_stuck_runs(&self) -> anyhow::Result<Vec<Run>>;

    /// Runs with `status = queued`, sorted by `created_at` ascending.
    async fn find_queued_runs(&self) -> anyhow::Result<Vec<Run>>;
}
