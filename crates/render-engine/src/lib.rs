mod artifacts;
mod broadcaster;
mod cancellation;
mod config;
mod engine;
mod log_queue;

pub use artifacts::{resolve_artifact_path, run_artifact_dir};
pub use broadcaster::Broadcaster;
pub use cancellation::CancellationRegistry;
pub use config::Config;
pub use engine::Engine;
pub use log_queue::LogQueue;
