use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{PlanVersionId, ProjectId, RunId, SceneId};
use crate::steps::{StepName, STEPS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    DraftPlan,
    PlanReady,
    Approved,
    Rendering,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub status: ProjectStatus,
    pub latest_plan_version_id: Option<PlanVersionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub plan_version_id: PlanVersionId,
    pub idx: u32,
    pub narration: String,
    pub visual_prompt: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanVersion {
    pub id: PlanVersionId,
    pub project_id: ProjectId,
    /// Dense, ordered 0..N-1 by `Scene::idx`.
    pub scenes: Vec<Scene>,
}

impl PlanVersion {
    /// Scenes in `idx` order. The store is expected to persist them densely;
    /// this just guards against an out-of-order read.
    pub fn ordered_scenes(&self) -> Vec<&Scene> {
        let mut scenes: Vec<&Scene> = self.scenes.iter().collect();
        scenes.sort_by_key(|s| s.idx);
        scenes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
    QaFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Done | RunStatus::Failed | RunStatus::Canceled | RunStatus::QaFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Per-step completion record plus each step's opaque resume payload.
/// Monotonic within one run attempt: steps are only ever added by the
/// worker's own progress, never removed, except by an explicit `Retry`
/// with `from_step`, which happens before the run is re-enqueued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    pub completed_steps: BTreeSet<StepName>,
    pub per_step_data: HashMap<StepName, Value>,
}

impl ResumeState {
    pub fn mark_completed(&mut self, step: StepName, data: Value) {
        self.completed_steps.insert(step);
        self.per_step_data.insert(step, data);
    }

    pub fn is_completed(&self, step: StepName) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Remove `from_step` and every step after it (in `STEPS` order) from
    /// `completed_steps` and `per_step_data`, so the next worker attempt
    /// re-runs `from_step` first among non-completed steps.
    pub fn rewind_to(&mut self, from_step: StepName) {
        let cutoff = from_step.order();
        for step in STEPS.iter().filter(|s| s.order() >= cutoff) {
            self.completed_steps.remove(step);
            self.per_step_data.remove(step);
        }
    }

    pub fn progress(&self) -> u8 {
        let total: u32 = self
            .completed_steps
            .iter()
            .map(|s| s.weight() as u32)
            .sum();
        total.min(100) as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub plan_version_id: PlanVersionId,
    pub status: RunStatus,
    /// 0..=100.
    pub progress: u8,
    /// The step name currently executing, or `"error"` after a restart
    /// forcibly fails a run that was `running` when the process died.
    pub current_step: Option<String>,
    pub logs: Vec<LogEntry>,
    pub artifacts: HashMap<String, String>,
    pub resume_state: ResumeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(project_id: ProjectId, plan_version_id: PlanVersionId) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            project_id,
            plan_version_id,
            status: RunStatus::Queued,
            progress: 0,
            current_step: None,
            logs: Vec::new(),
            artifacts: HashMap::new(),
            resume_state: ResumeState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_done_consistent(&self) -> bool {
        if self.status != RunStatus::Done {
            return true;
        }
        self.progress == 100 && STEPS.iter().all(|s| self.resume_state.is_completed(*s))
    }
}
