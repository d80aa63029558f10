use std::time::Duration;

use render_steps::DryRunConfig;
use render_types::StepName;

/// Immutable snapshot of the engine's environment knobs, captured once at
/// startup. Never re-read from `std::env` inside the engine's hot paths —
/// per the source system's own drift away from "environment variables as
/// live globals", every tunable is threaded through this struct instead.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_runs: usize,
    pub max_queue_size: usize,
    pub max_subscribers_per_run: usize,
    pub heartbeat_interval: Duration,
    pub artifact_root: std::path::PathBuf,
    pub dry_run_enabled: bool,
    pub dry_run: DryRunConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let max_concurrent_runs = env_usize("MAX_CONCURRENT_RUNS", 1).max(1);
        let max_queue_size = env_usize("MAX_QUEUE_SIZE", 100);
        let max_subscribers_per_run = env_usize("MAX_SUBSCRIBERS_PER_RUN", 100);
        let heartbeat_interval =
            Duration::from_millis(env_u64("HEARTBEAT_INTERVAL_MS", 25_000));
        let artifact_root = std::env::var("ARTIFACT_ROOT")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("./artifacts"));

        let max_concurrent_image_generation = env_usize("MAX_CONCURRENT_IMAGE_GENERATION", 3);
        let max_concurrent_image_generation = if max_concurrent_image_generation == 0 {
            3
        } else {
            max_concurrent_image_generation
        };

        let fail_step = std::env::var("APP_DRY_RUN_FAIL_STEP")
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<StepName>().ok());
        let step_delay_ms = env_u64("APP_DRY_RUN_STEP_DELAY_MS", 0).min(5000);

        Self {
            max_concurrent_runs,
            max_queue_size,
            max_subscribers_per_run,
            heartbeat_interval,
            artifact_root,
            dry_run_enabled: std::env::var("APP_RENDER_DRY_RUN")
                .map(|v| v == "1")
                .unwrap_or(false),
            dry_run: DryRunConfig {
                fail_step,
                step_delay: Duration::from_millis(step_delay_ms),
                max_concurrent_image_generation,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 1,
            max_queue_size: 100,
            max_subscribers_per_run: 100,
            heartbeat_interval: Duration::from_millis(25_000),
            artifact_root: std::path::PathBuf::from("./artifacts"),
            dry_run_enabled: false,
            dry_run: DryRunConfig {
                fail_step: None,
                step_delay: Duration::ZERO,
                max_concurrent_image_generation: 3,
            },
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_runs, 1);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.dry_run.max_concurrent_image_generation, 3);
    }
}
