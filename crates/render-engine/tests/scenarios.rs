use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use render_engine::{Config, Engine};
use render_steps::{DryRunConfig, DryRunExecutor};
use render_store::{FileStore, Store};
use render_types::{
    PlanVersion, PlanVersionId, Project, ProjectId, ProjectStatus, Run, RunStatus, Scene, SceneId,
    StepName,
};
use render_wire::ProgressEvent;

fn plan_with_scenes(project_id: ProjectId, n: usize) -> PlanVersion {
    let plan_id = PlanVersionId::new();
    let scenes = (0..n)
        .map(|idx| Scene {
            id: SceneId::new(),
            plan_version_id: plan_id,
            idx: idx as u32,
            narration: format!("scene {idx} narration text goes here"),
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

async fn engine_with(
    dry_run: DryRunConfig,
    max_concurrent_runs: usize,
) -> (Arc<Engine>, Arc<dyn Store>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path().join("store")).await.unwrap());
    let executor = Arc::new(DryRunExecutor::new(dry_run));
    let config = Config {
        max_concurrent_runs,
        max_queue_size: 100,
        max_subscribers_per_run: 100,
        heartbeat_interval: Duration::from_secs(25),
        artifact_root: dir.path().join("artifacts"),
        dry_run_enabled: true,
        dry_run: DryRunConfig::default(),
    };
    let engine = Engine::new(store.clone(), executor, config);
    (engine, store, dir)
}

async fn make_project(store: &Arc<dyn Store>, project_id: ProjectId) {
    store
        .create_project(Project {
            id: project_id,
            status: ProjectStatus::Approved,
            latest_plan_version_id: None,
        })
        .await
        .unwrap();
}

async fn wait_for_terminal(store: &Arc<dyn Store>, run_id: render_types::RunId) -> Run {
    for _ in 0..200 {
        let run = store.get_run(run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} did not reach a terminal state in time");
}

/// S1: a single dry-run plan runs every step and finishes at progress=100.
#[tokio::test]
async fn single_run_completes_all_seven_steps() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::ZERO,
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;

    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run = engine.enqueue(plan_with_scenes(project_id, 2)).await.unwrap();
    let done = wait_for_terminal(&store, run.id).await;

    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.progress, 100);
    for step in render_types::STEPS {
        assert!(done.resume_state.is_completed(step), "{step} should be completed");
    }

    let plan = store.get_plan_version(done.plan_version_id).await.unwrap().unwrap();
    for scene in plan.scenes {
        assert!(scene.duration_sec > 0.0, "tts_generate should measure a duration per scene");
    }
}

/// S2: with MAX_CONCURRENT_RUNS=1, a second enqueued run stays queued until
/// the first reaches a terminal state.
#[tokio::test]
async fn second_run_waits_for_the_first_under_one_concurrent_slot() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::from_millis(30),
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;

    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run_a = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    let run_b = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let b_while_a_running = store.get_run(run_b.id).await.unwrap().unwrap();
    assert_eq!(b_while_a_running.status, RunStatus::Queued);

    let done_a = wait_for_terminal(&store, run_a.id).await;
    assert_eq!(done_a.status, RunStatus::Done);
    let done_b = wait_for_terminal(&store, run_b.id).await;
    assert_eq!(done_b.status, RunStatus::Done);
}

/// S3: canceling mid-pipeline transitions the run to canceled with a
/// resume state that reflects only the steps that actually finished.
#[tokio::test]
async fn cancel_mid_pipeline_preserves_partial_resume_state() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::from_millis(80),
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;

    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.cancel(run.id).await.unwrap();

    let canceled = wait_for_terminal(&store, run.id).await;
    assert_eq!(canceled.status, RunStatus::Canceled);
    assert!(canceled.resume_state.completed_steps.len() < render_types::STEPS.len());
}

/// S4/S5: a run configured to fail at captions_build stops there with the
/// first two steps recorded complete; clearing the fail step and retrying
/// resumes at captions_build and reaches done.
#[tokio::test]
async fn fail_at_step_then_retry_resumes_from_that_step() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path().join("store")).await.unwrap());
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;

    let failing_executor = Arc::new(DryRunExecutor::new(DryRunConfig {
        fail_step: Some(StepName::CaptionsBuild),
        step_delay: Duration::ZERO,
        max_concurrent_image_generation: 3,
    }));
    let config = Config {
        max_concurrent_runs: 1,
        max_queue_size: 100,
        max_subscribers_per_run: 100,
        heartbeat_interval: Duration::from_secs(25),
        artifact_root: dir.path().join("artifacts"),
        dry_run_enabled: true,
        dry_run: DryRunConfig::default(),
    };
    let engine = Engine::new(store.clone(), failing_executor, config);
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    let failed = wait_for_terminal(&store, run.id).await;
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.resume_state.is_completed(StepName::TtsGenerate));
    assert!(failed.resume_state.is_completed(StepName::AsrAlign));
    assert!(failed.resume_state.is_completed(StepName::ImagesGenerate));
    assert!(!failed.resume_state.is_completed(StepName::CaptionsBuild));
    assert_eq!(
        failed.progress,
        StepName::TtsGenerate.weight() as u8
            + StepName::AsrAlign.weight() as u8
            + StepName::ImagesGenerate.weight() as u8
    );

    // A fresh engine over the same store, with the fail step cleared,
    // stands in for "unset APP_DRY_RUN_FAIL_STEP and restart/retry".
    let succeeding_executor = Arc::new(DryRunExecutor::new(DryRunConfig {
        fail_step: None,
        step_delay: Duration::ZERO,
        max_concurrent_image_generation: 3,
    }));
    let config = Config {
        max_concurrent_runs: 1,
        max_queue_size: 100,
        max_subscribers_per_run: 100,
        heartbeat_interval: Duration::from_secs(25),
        artifact_root: dir.path().join("artifacts"),
        dry_run_enabled: true,
        dry_run: DryRunConfig::default(),
    };
    let engine = Engine::new(store.clone(), succeeding_executor, config);
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    engine.retry(run.id, None).await.unwrap();
    let done = wait_for_terminal(&store, run.id).await;
    assert_eq!(done.status, RunStatus::Done);
    assert_eq!(done.progress, 100);
}

/// S6: 20 concurrent log appends to the same run all land, in submission order.
#[tokio::test]
async fn twenty_concurrent_log_appends_all_land_in_order() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::from_millis(5),
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    let run = Run::new(project_id, PlanVersionId::new());
    store.create_run(run.clone()).await.unwrap();

    let queue = Arc::new(render_engine::LogQueue::new(
        store.clone(),
        render_engine::Broadcaster::new(10, Duration::from_secs(25)),
    ));
    let mut handles = Vec::new();
    for i in 0..20 {
        let queue = queue.clone();
        let run_id = run.id;
        handles.push(tokio::spawn(async move {
            queue
                .append(
                    run_id,
                    render_types::LogEntry::new(render_types::LogLevel::Info, format!("entry {i}")),
                )
                .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    queue.drain_all().await;
    drop(engine);

    let reloaded = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(reloaded.logs.len(), 20);
    for i in 0..20 {
        assert!(reloaded.logs.iter().any(|l| l.message == format!("entry {i}")));
    }
}

/// S7: two subscribers to a running run both see an initial state snapshot
/// followed by the same subsequent events in the same order.
#[tokio::test]
async fn two_subscribers_see_the_same_event_sequence() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::from_millis(30),
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let mut sub1 = Box::pin(engine.subscribe(run.id).await.unwrap());
    let mut sub2 = Box::pin(engine.subscribe(run.id).await.unwrap());

    let first1 = sub1.next().await.unwrap();
    let first2 = sub2.next().await.unwrap();
    assert!(matches!(first1, ProgressEvent::State { .. }));
    assert!(matches!(first2, ProgressEvent::State { .. }));

    let next1 = sub1.next().await.unwrap();
    let next2 = sub2.next().await.unwrap();
    assert_eq!(
        std::mem::discriminant(&next1),
        std::mem::discriminant(&next2)
    );

    wait_for_terminal(&store, run.id).await;
}

/// Boundary: canceling an already-terminal run is a no-op error.
#[tokio::test]
async fn cancel_on_terminal_run_is_not_cancelable() {
    let (engine, store, _dir) = engine_with(
        DryRunConfig {
            fail_step: None,
            step_delay: Duration::ZERO,
            max_concurrent_image_generation: 3,
        },
        1,
    )
    .await;
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    engine.restore_after_restart().await.unwrap();
    engine.start().await;

    let run = engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    wait_for_terminal(&store, run.id).await;

    let err = engine.cancel(run.id).await.unwrap_err();
    assert!(matches!(err, render_types::EngineError::NotCancelable));
}

/// Boundary: the (MAX_QUEUE_SIZE+1)th queued run is rejected with QueueFull
/// and no Run row is created.
#[tokio::test]
async fn enqueue_past_queue_capacity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path().join("store")).await.unwrap());
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;
    let executor = Arc::new(DryRunExecutor::new(DryRunConfig {
        fail_step: None,
        step_delay: Duration::from_secs(60),
        max_concurrent_image_generation: 3,
    }));
    let config = Config {
        max_concurrent_runs: 1,
        max_queue_size: 1,
        max_subscribers_per_run: 100,
        heartbeat_interval: Duration::from_secs(25),
        artifact_root: dir.path().join("artifacts"),
        dry_run_enabled: true,
        dry_run: DryRunConfig::default(),
    };
    // Deliberately never call `start`: nothing drains the ready queue, so
    // the second enqueue is guaranteed to see the first run still queued.
    let engine = Engine::new(store.clone(), executor, config);
    engine.restore_after_restart().await.unwrap();

    engine.enqueue(plan_with_scenes(project_id, 1)).await.unwrap();
    let err = engine
        .enqueue(plan_with_scenes(project_id, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, render_types::EngineError::QueueFull));
}

/// Restart scenario: a run stranded `running` by a crashed process becomes
/// `failed` with currentStep="error" on the next `restore_after_restart`,
/// and its project moves to FAILED.
#[tokio::test]
async fn restart_reaps_a_stuck_running_run() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path().join("store")).await.unwrap());
    let project_id = ProjectId::new();
    make_project(&store, project_id).await;

    let mut stranded = Run::new(project_id, PlanVersionId::new());
    stranded.status = RunStatus::Running;
    stranded.current_step = Some(StepName::ImagesGenerate.to_string());
    store.create_run(stranded.clone()).await.unwrap();

    let executor = Arc::new(DryRunExecutor::new(DryRunConfig::default()));
    let config = Config::default();
    let engine = Engine::new(store.clone(), executor, config);
    engine.restore_after_restart().await.unwrap();

    let reaped = store.get_run(stranded.id).await.unwrap().unwrap();
    assert_eq!(reaped.status, RunStatus::Failed);
    assert_eq!(reaped.current_step.as_deref(), Some("error"));

    let project = store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
}
