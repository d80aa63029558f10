use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use render_types::{
    PlanVersion, PlanVersionId, Project, ProjectId, ProjectStatus, Run, RunId, RunStatus, SceneId,
};

use crate::{RunMutation, Store};

/// In-process, file-backed `Store`. Each entity kind is kept as an
/// in-memory map guarded by its own `RwLock` and snapshotted to a single
/// JSON file on every write, mirroring the read-whole-map/write-whole-map
/// persistence style used elsewhere for small, infrequently-read state.
pub struct FileStore {
    base: PathBuf,
    projects: RwLock<HashMap<ProjectId, Project>>,
    plan_versions: RwLock<HashMap<PlanVersionId, PlanVersion>>,
    runs: RwLock<HashMap<RunId, Run>>,
}

const PROJECTS_FILE: &str = "projects.json";
const PLAN_VERSIONS_FILE: &str = "plan_versions.json";
const RUNS_FILE: &str = "runs.json";

async fn load_map<T>(path: &Path, kind: &str) -> HashMap<String, T>
where
    T: serde::de::DeserializeOwned,
{
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(kind, error = %err, "corrupt persisted state, treating as empty");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

impl FileStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;

        let projects: HashMap<String, Project> =
            load_map(&base.join(PROJECTS_FILE), "projects").await;
        let plan_versions: HashMap<String, PlanVersion> =
            load_map(&base.join(PLAN_VERSIONS_FILE), "plan_versions").await;
        let runs: HashMap<String, Run> = load_map(&base.join(RUNS_FILE), "runs").await;

        Ok(Self {
            base,
            projects: RwLock::new(
                projects
                    .into_values()
                    .map(|p| (p.id, p))
                    .collect(),
            ),
            plan_versions: RwLock::new(
                plan_versions
                    .into_values()
                    .map(|p| (p.id, p))
                    .collect(),
            ),
            runs: RwLock::new(runs.into_values().map(|r| (r.id, r)).collect()),
        })
    }

    async fn flush_projects(&self, projects: &HashMap<ProjectId, Project>) -> anyhow::Result<()> {
        let by_str: HashMap<String, &Project> =
            projects.iter().map(|(id, p)| (id.to_string(), p)).collect();
        let payload = serde_json::to_vec_pretty(&by_str)?;
        fs::write(self.base.join(PROJECTS_FILE), payload).await?;
        Ok(())
    }

    async fn flush_plan_versions(
        &self,
        plan_versions: &HashMap<PlanVersionId, PlanVersion>,
    ) -> anyhow::Result<()> {
        let by_str: HashMap<String, &PlanVersion> = plan_versions
            .iter()
            .map(|(id, p)| (id.to_string(), p))
            .collect();
        let payload = serde_json::to_vec_pretty(&by_str)?;
        fs::write(self.base.join(PLAN_VERSIONS_FILE), payload).await?;
        Ok(())
    }

    async fn flush_runs(&self, runs: &HashMap<RunId, Run>) -> anyhow::Result<()> {
        let by_str: HashMap<String, &Run> =
            runs.iter().map(|(id, r)| (id.to_string(), r)).collect();
        let payload = serde_json::to_vec_pretty(&by_str)?;
        fs::write(self.base.join(RUNS_FILE), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_project(&self, project: Project) -> anyhow::Result<()> {
        let mut guard = self.projects.write().await;
        guard.insert(project.id, project);
        self.flush_projects(&guard).await
    }

    async fn get_project(&self, id: ProjectId) -> anyhow::Result<Option<Project>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn save_project(&self, project: Project) -> anyhow::Result<()> {
        let mut guard = self.projects.write().await;
        guard.insert(project.id, project);
        self.flush_projects(&guard).await
    }

    async fn delete_project(&self, id: ProjectId) -> anyhow::Result<bool> {
        let mut guard = self.projects.write().await;
        let removed = guard.remove(&id).is_some();
        if removed {
            self.flush_projects(&guard).await?;
        }
        Ok(removed)
    }

    async fn create_plan_version(&self, plan: PlanVersion) -> anyhow::Result<()> {
        let mut guard = self.plan_versions.write().await;
        guard.insert(plan.id, plan);
        self.flush_plan_versions(&guard).await
    }

    async fn get_plan_version(&self, id: PlanVersionId) -> anyhow::Result<Option<PlanVersion>> {
        Ok(self.plan_versions.read().await.get(&id).cloned())
    }

    async fn update_scene_durations(
        &self,
        plan_version_id: PlanVersionId,
        durations: &[(SceneId, f64)],
    ) -> anyhow::Result<()> {
        let mut guard = self.plan_versions.write().await;
        if let Some(plan) = guard.get_mut(&plan_version_id) {
            for (scene_id, duration) in durations {
                if let Some(scene) = plan.scenes.iter_mut().find(|s| s.id == *scene_id) {
                    scene.duration_sec = *duration;
                }
            }
        }
        self.flush_plan_versions(&guard).await
    }

    async fn create_run(&self, run: Run) -> anyhow::Result<()> {
        let mut guard = self.runs.write().await;
        guard.insert(run.id, run);
        self.flush_runs(&guard).await
    }

    async fn get_run(&self, id: RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs_for_project(&self, project_id: ProjectId) -> anyhow::Result<Vec<Run>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn transition_run(
        &self,
        run_id: RunId,
        mutate: RunMutation,
        project_update: Option<(ProjectId, ProjectStatus)>,
    ) -> anyhow::Result<Run> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
        mutate(run);
        run.updated_at = chrono::Utc::now();
        let updated = run.clone();
        self.flush_runs(&runs).await?;
        drop(runs);

        if let Some((project_id, status)) = project_update {
            let mut projects = self.projects.write().await;
            if let Some(project) = projects.get_mut(&project_id) {
                project.status = status;
                self.flush_projects(&projects).await?;
            }
        }

        Ok(updated)
    }

    async fn find_stuck_runs(&self) -> anyhow::Result<Vec<Run>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect())
    }

    async fn find_queued_runs(&self) -> anyhow::Result<Vec<Run>> {
        let mut queued: Vec<Run> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.status == RunStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|r| r.created_at);
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_types::{PlanVersionId, ProjectId};

    async fn store() -> FileStore {
        let dir = tempfile::tempdir().unwrap();
        FileStore::new(dir.path()).await.unwrap()
    }

    fn make_run() -> Run {
        Run::new(ProjectId::new(), PlanVersionId::new())
    }

    #[tokio::test]
    async fn round_trips_a_run() {
        let store = store().await;
        let run = make_run();
        store.create_run(run.clone()).await.unwrap();
        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn transition_run_updates_run_and_project_together() {
        let store = store().await;
        let project = Project {
            id: ProjectId::new(),
            status: ProjectStatus::Rendering,
            latest_plan_version_id: None,
        };
        store.create_project(project.clone()).await.unwrap();
        let mut run = make_run();
        run.project_id = project.id;
        store.create_run(run.clone()).await.unwrap();

        let updated = store
            .transition_run(
                run.id,
                Box::new(|r| r.status = RunStatus::Done),
                Some((project.id, ProjectStatus::Done)),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Done);

        let reloaded_project = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded_project.status, ProjectStatus::Done);
    }

    #[tokio::test]
    async fn find_queued_runs_orders_by_created_at() {
        let store = store().await;
        let mut first = make_run();
        first.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
        let second = make_run();
        store.create_run(second.clone()).await.unwrap();
        store.create_run(first.clone()).await.unwrap();

        let queued = store.find_queued_runs().await.unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, first.id);
        assert_eq!(queued[1].id, second.id);
    }

    #[tokio::test]
    async fn corrupt_persisted_json_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RUNS_FILE), b"not valid json")
            .await
            .unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();
        assert!(store.find_queued_runs().await.unwrap().is_empty());
    }
}
