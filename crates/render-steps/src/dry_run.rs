use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use render_types::{EngineError, PlanVersion, Run, StepName};

use crate::config::DryRunConfig;
use crate::executor::{StepExecutor, StepResult};

/// Replaces every external provider call with a deterministic sleep and
/// fixed artifacts. Used by tests and local development so the engine's
/// scheduling, resume, and cancellation behavior can be exercised without
/// TTS/ASR/image/ffmpeg providers configured.
pub struct DryRunExecutor {
    config: DryRunConfig,
}

impl DryRunExecutor {
    pub fn new(config: DryRunConfig) -> Self {
        Self { config }
    }

    /// Sleeps `step_delay`, bailing out early with `Canceled` if the token
    /// fires first. Every dry-run step calls this exactly once, which is
    /// this executor's one cancellation suspension point per step.
    async fn delay_or_cancel(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if self.config.step_delay.is_zero() {
            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.step_delay) => Ok(()),
            _ = cancel.cancelled() => Err(EngineError::Canceled),
        }
    }

    async fn write_placeholder(&self, path: &Path, contents: &[u8]) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::StepFailed(format!("create dir {parent:?}: {e}")))?;
        }
        fs::write(path, contents)
            .await
            .map_err(|e| EngineError::StepFailed(format!("write {path:?}: {e}")))
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn run(
        &self,
        step: StepName,
        cancel: CancellationToken,
        run: &Run,
        plan: &PlanVersion,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError> {
        self.delay_or_cancel(&cancel).await?;

        if self.config.fail_step == Some(step) {
            return Err(EngineError::StepFailed(format!(
                "dry-run failure injected at {step}"
            )));
        }

        match step {
            StepName::TtsGenerate => self.tts_generate(plan, artifact_root).await,
            StepName::AsrAlign => self.asr_align(run, plan).await,
            StepName::ImagesGenerate => {
                self.images_generate(plan, artifact_root, &cancel).await
            }
            StepName::CaptionsBuild => self.captions_build(plan, artifact_root).await,
            StepName::MusicBuild => self.music_build(artifact_root).await,
            StepName::FfmpegRender => self.ffmpeg_render(run, artifact_root).await,
            StepName::FinalizeArtifacts => self.finalize_artifacts(run, artifact_root).await,
        }
    }
}

impl DryRunExecutor {
    async fn tts_generate(
        &self,
        plan: &PlanVersion,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError> {
        let mut artifacts = HashMap::new();
        let mut durations = serde_json::Map::new();
        let mut scene_durations = Vec::new();
        for scene in plan.ordered_scenes() {
            let rel = format!("audio/scene_{:04}.wav", scene.idx);
            self.write_placeholder(&artifact_root.join(&rel), b"RIFF-dry-run-placeholder")
                .await?;
            let duration = (scene.narration.chars().count() as f64 / 15.0).max(1.0);
            durations.insert(scene.idx.to_string(), json!(duration));
            scene_durations.push((scene.id, duration));
            artifacts.insert(format!("audio:{}", scene.idx), rel);
        }
        Ok(StepResult {
            artifacts,
            resume_data: Value::Object(durations),
            scene_durations,
        })
    }

    async fn asr_align(&self, run: &Run, plan: &PlanVersion) -> Result<StepResult, EngineError> {
        let durations = run
            .resume_state
            .per_step_data
            .get(&StepName::TtsGenerate)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let mut words = serde_json::Map::new();
        for scene in plan.ordered_scenes() {
            let word_count = scene.narration.split_whitespace().count();
            words.insert(scene.idx.to_string(), json!(word_count));
        }
        Ok(StepResult {
            artifacts: HashMap::new(),
            resume_data: json!({"sceneDurations": durations, "wordCounts": words}),
            ..Default::default()
        })
    }

    async fn images_generate(
        &self,
        plan: &PlanVersion,
        artifact_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepResult, EngineError> {
        let permits = self.config.max_concurrent_image_generation.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks = Vec::new();
        for scene in plan.ordered_scenes() {
            let semaphore = semaphore.clone();
            let rel = format!("images/scene_{:04}.png", scene.idx);
            let path = artifact_root.join(&rel);
            let cancel = cancel.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                if cancel.is_cancelled() {
                    return Err(EngineError::Canceled);
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| EngineError::StepFailed(format!("create dir: {e}")))?;
                }
                fs::write(&path, b"PNG-dry-run-placeholder")
                    .await
                    .map_err(|e| EngineError::StepFailed(format!("write image: {e}")))?;
                Ok(rel)
            });
        }
        let results: Vec<Result<String, EngineError>> = futures::future::join_all(tasks).await;
        let mut artifacts = HashMap::new();
        for (scene, result) in plan.ordered_scenes().into_iter().zip(results) {
            artifacts.insert(format!("image:{}", scene.idx), result?);
        }
        let image_count = artifacts.len();
        Ok(StepResult {
            artifacts,
            resume_data: json!({"imageCount": image_count}),
            ..Default::default()
        })
    }

    async fn captions_build(
        &self,
        plan: &PlanVersion,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError> {
        let mut body = String::from("[Script Info]\nTitle: dry-run\n\n[Events]\n");
        for scene in plan.ordered_scenes() {
            body.push_str(&format!(
                "Dialogue: 0,scene {},{}\n",
                scene.idx, scene.narration
            ));
        }
        let rel = "captions.ass".to_string();
        self.write_placeholder(&artifact_root.join(&rel), body.as_bytes())
            .await?;
        let mut artifacts = HashMap::new();
        artifacts.insert("captions".to_string(), rel);
        Ok(StepResult {
            artifacts,
            resume_data: Value::Null,
            ..Default::default()
        })
    }

    async fn music_build(&self, artifact_root: &Path) -> Result<StepResult, EngineError> {
        let rel = "music.mp3".to_string();
        self.write_placeholder(&artifact_root.join(&rel), b"ID3-dry-run-placeholder")
            .await?;
        let mut artifacts = HashMap::new();
        artifacts.insert("music".to_string(), rel);
        Ok(StepResult {
            artifacts,
            resume_data: Value::Null,
            ..Default::default()
        })
    }

    async fn ffmpeg_render(
        &self,
        run: &Run,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError> {
        let manifest = json!({
            "runID": run.id.to_string(),
            "note": "ffmpeg invocation skipped in dry-run mode",
            "inputs": run.artifacts,
        });
        let rel = "dry-run-report.json".to_string();
        self.write_placeholder(
            &artifact_root.join(&rel),
            serde_json::to_vec_pretty(&manifest)
                .map_err(|e| EngineError::StepFailed(format!("serialize manifest: {e}")))?
                .as_slice(),
        )
        .await?;
        let mut artifacts = HashMap::new();
        artifacts.insert("render_manifest".to_string(), rel);
        Ok(StepResult {
            artifacts,
            resume_data: Value::Null,
            ..Default::default()
        })
    }

    async fn finalize_artifacts(
        &self,
        run: &Run,
        artifact_root: &Path,
    ) -> Result<StepResult, EngineError> {
        let export = json!({
            "runID": run.id.to_string(),
            "projectID": run.project_id.to_string(),
            "artifacts": run.artifacts,
        });
        let rel = "export.json".to_string();
        self.write_placeholder(
            &artifact_root.join(&rel),
            serde_json::to_vec_pretty(&export)
                .map_err(|e| EngineError::StepFailed(format!("serialize export: {e}")))?
                .as_slice(),
        )
        .await?;
        let mut artifacts = HashMap::new();
        artifacts.insert("export".to_string(), rel);
        Ok(StepResult {
            artifacts,
            resume_data: Value::Null,
            ..Default::default()
        })
    }
}
