//! Transport-agnostic progress event shapes for `Engine::Subscribe`.
//!
//! Kept as a separate crate from `render-types` so the wire shapes (camelCase
//! fields, tagged variants) can evolve independently of the engine's
//! internal entity representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use render_types::{LogLevel, RunStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryWire {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    State {
        #[serde(rename = "runID")]
        run_id: String,
        status: RunStatus,
        progress: u8,
        #[serde(rename = "currentStep")]
        current_step: Option<String>,
        logs: Vec<LogEntryWire>,
    },
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    StepStart {
        step: String,
    },
    StepEnd {
        step: String,
        progress: u8,
    },
    Transition {
        from: String,
        to: String,
    },
    Heartbeat {},
}
