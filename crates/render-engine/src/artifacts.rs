use std::path::{Component, Path, PathBuf};

use render_types::{EngineError, ProjectId, RunId};

/// Directory a run's step bodies write artifacts under:
/// `<root>/<projectId>/<runId>/`.
pub fn run_artifact_dir(root: &Path, project_id: ProjectId, run_id: RunId) -> PathBuf {
    root.join(project_id.to_string()).join(run_id.to_string())
}

/// Validates that `requested` resolves to a path under
/// `run_artifact_dir(root, project_id, run_id)`, rejecting absolute paths
/// and `..` components before any filesystem resolution, then confirming
/// containment against the canonicalized run directory so a symlink planted
/// under the run directory cannot be used to escape it.
pub fn resolve_artifact_path(
    root: &Path,
    project_id: ProjectId,
    run_id: RunId,
    requested: &Path,
) -> Result<PathBuf, EngineError> {
    if requested.is_absolute() {
        return Err(EngineError::Precondition(
            "artifact path must be relative".into(),
        ));
    }
    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(EngineError::Precondition(
            "artifact path must not contain '..'".into(),
        ));
    }

    let run_dir = run_artifact_dir(root, project_id, run_id);
    let joined = run_dir.join(requested);

    let canonical_run_dir = run_dir
        .canonicalize()
        .map_err(|_| EngineError::NotFound)?;

    let canonical_target = if joined.exists() {
        joined.canonicalize().map_err(|_| EngineError::NotFound)?
    } else {
        let parent = joined.parent().unwrap_or(&joined);
        let canonical_parent = parent.canonicalize().map_err(|_| EngineError::NotFound)?;
        let file_name = joined
            .file_name()
            .ok_or_else(|| EngineError::Precondition("artifact path must name a file".into()))?;
        canonical_parent.join(file_name)
    };

    if !canonical_target.starts_with(&canonical_run_dir) {
        return Err(EngineError::Precondition(
            "artifact path escapes the run's artifact root".into(),
        ));
    }

    Ok(canonical_target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_a_path_inside_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let project_id = ProjectId::new();
        let run_id = RunId::new();
        let run_dir = run_artifact_dir(dir.path(), project_id, run_id);
        tokio::fs::create_dir_all(run_dir.join("images"))
            .await
            .unwrap();
        tokio::fs::write(run_dir.join("images/scene_0000.png"), b"x")
            .await
            .unwrap();

        let resolved = resolve_artifact_path(
            dir.path(),
            project_id,
            run_id,
            Path::new("images/scene_0000.png"),
        )
        .unwrap();
        assert!(resolved.starts_with(run_dir.canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let project_id = ProjectId::new();
        let run_id = RunId::new();
        tokio::fs::create_dir_all(run_artifact_dir(dir.path(), project_id, run_id))
            .await
            .unwrap();

        let err = resolve_artifact_path(
            dir.path(),
            project_id,
            run_id,
            Path::new("../../etc/passwd"),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }

    #[tokio::test]
    async fn rejects_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let project_id = ProjectId::new();
        let run_id = RunId::new();
        tokio::fs::create_dir_all(run_artifact_dir(dir.path(), project_id, run_id))
            .await
            .unwrap();

        let err =
            resolve_artifact_path(dir.path(), project_id, run_id, Path::new("/etc/passwd"))
                .unwrap_err();
        assert!(matches!(err, EngineError::Precondition(_)));
    }
}
