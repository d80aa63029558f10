use std::time::Duration;

use render_types::StepName;

/// Dry-run behavior, read from the `APP_RENDER_DRY_RUN` / `APP_DRY_RUN_*`
/// environment knobs by the caller and handed to `DryRunExecutor` at
/// construction. Never read through ambient `std::env::var` calls inside
/// the executor itself.
#[derive(Debug, Clone, Default)]
pub struct DryRunConfig {
    /// Step to fail at, if any (`APP_DRY_RUN_FAIL_STEP`).
    pub fail_step: Option<StepName>,
    /// Sleep before each step, simulating provider latency
    /// (`APP_DRY_RUN_STEP_DELAY_MS`, clamped to 0..=5000).
    pub step_delay: Duration,
    /// Bound on concurrent scene image generation within `images_generate`
    /// (`MAX_CONCURRENT_IMAGE_GENERATION`).
    pub max_concurrent_image_generation: usize,
}
