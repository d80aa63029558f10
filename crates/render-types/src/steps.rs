use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The fixed, ordered pipeline stages. Order here is the order the engine
/// drives them in; it is never reordered per-run. Declaration order doubles
/// as `Ord` so `BTreeSet<StepName>` iterates in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    TtsGenerate,
    AsrAlign,
    ImagesGenerate,
    CaptionsBuild,
    MusicBuild,
    FfmpegRender,
    FinalizeArtifacts,
}

pub const STEPS: [StepName; 7] = [
    StepName::TtsGenerate,
    StepName::AsrAlign,
    StepName::ImagesGenerate,
    StepName::CaptionsBuild,
    StepName::MusicBuild,
    StepName::FfmpegRender,
    StepName::FinalizeArtifacts,
];

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::TtsGenerate => "tts_generate",
            StepName::AsrAlign => "asr_align",
            StepName::ImagesGenerate => "images_generate",
            StepName::CaptionsBuild => "captions_build",
            StepName::MusicBuild => "music_build",
            StepName::FfmpegRender => "ffmpeg_render",
            StepName::FinalizeArtifacts => "finalize_artifacts",
        }
    }

    /// Progress weight for this step. Nonnegative; all weights sum to 100.
    pub fn weight(self) -> u8 {
        match self {
            StepName::TtsGenerate => 15,
            StepName::AsrAlign => 10,
            StepName::ImagesGenerate => 35,
            StepName::CaptionsBuild => 10,
            StepName::MusicBuild => 5,
            StepName::FfmpegRender => 15,
            StepName::FinalizeArtifacts => 10,
        }
    }

    /// Index of this step within `STEPS`, used by retry-from-step and resume logic.
    pub fn order(self) -> usize {
        STEPS.iter().position(|s| *s == self).expect("step in STEPS")
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        STEPS.iter().copied().find(|step| step.as_str() == s).ok_or(())
    }
}

/// Sum of weights for every step in `STEPS`. Always 100; asserted in tests.
pub fn total_weight() -> u32 {
    STEPS.iter().map(|s| s.weight() as u32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_100() {
        assert_eq!(total_weight(), 100);
    }

    #[test]
    fn round_trips_through_str() {
        for step in STEPS {
            assert_eq!(StepName::from_str(step.as_str()), Ok(step));
        }
    }
}
