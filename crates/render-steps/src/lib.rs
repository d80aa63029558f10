mod config;
mod dry_run;
mod executor;

pub use config::DryRunConfig;
pub use dry_run::DryRunExecutor;
pub use executor::{StepExecutor, StepResult};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use render_types::{PlanVersion, PlanVersionId, ProjectId, Run, Scene, SceneId, StepName};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn plan_with_scenes(n: usize) -> PlanVersion {
        let plan_id = PlanVersionId::new();
        let project_id = ProjectId::new();
        let scenes = (0..n)
            .map(|idx| Scene {
                id: SceneId::new(),
                plan_version_id: plan_id,
                idx: idx as u32,
                narration: format!("scene number {idx} narration text"),
                visual_prompt: "a placeholder prompt".into(),
                duration_sec: 0.0,
            })
            .collect();
        PlanVersion {
            id: plan_id,
            project_id,
            scenes,
        }
    }

    #[tokio::test]
    async fn runs_every_step_successfully_with_zero_delay() {
        let executor = DryRunExecutor::new(DryRunConfig {
            fail_step: None,
            step_delay: Duration::ZERO,
            max_concurrent_image_generation: 3,
        });
        let plan = plan_with_scenes(2);
        let mut run = Run::new(plan.project_id, plan.id);
        let dir = tempfile::tempdir().unwrap();

        for step in render_types::STEPS {
            let result = executor
                .run(step, CancellationToken::new(), &run, &plan, dir.path())
                .await
                .expect("dry-run step succeeds");
            run.artifacts.extend(result.artifacts);
            run.resume_state.mark_completed(step, result.resume_data);
        }
        assert!(dir.path().join("export.json").exists());
        assert!(dir.path().join("images/scene_0000.png").exists());
    }

    #[tokio::test]
    async fn injects_failure_at_configured_step() {
        let executor = DryRunExecutor::new(DryRunConfig {
            fail_step: Some(StepName::CaptionsBuild),
            step_delay: Duration::ZERO,
            max_concurrent_image_generation: 3,
        });
        let plan = plan_with_scenes(1);
        let run = Run::new(plan.project_id, plan.id);
        let dir = tempfile::tempdir().unwrap();

        let err = executor
            .run(
                StepName::CaptionsBuild,
                CancellationToken::new(),
                &run,
                &plan,
                dir.path(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, render_types::EngineError::StepFailed(_)));
    }

    #[tokio::test]
    async fn observes_cancellation_before_starting_work() {
        let executor = DryRunExecutor::new(DryRunConfig {
            fail_step: None,
            step_delay: Duration::from_millis(50),
            max_concurrent_image_generation: 3,
        });
        let plan = plan_with_scenes(1);
        let run = Run::new(plan.project_id, plan.id);
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .run(StepName::TtsGenerate, cancel, &run, &plan, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, render_types::EngineError::Canceled));
    }
}
