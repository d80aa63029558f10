use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use render_types::RunId;

/// One cancellation token per active run, threaded as the first positional
/// argument through `StepExecutor::run`. Replaces cancellation flags
/// scattered across call sites with a single source of truth per run.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<RunId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns the existing) token for `run_id`. Called once by
    /// the worker before it starts the step loop.
    pub async fn create(&self, run_id: RunId) -> CancellationToken {
        let mut guard = self.tokens.write().await;
        guard.entry(run_id).or_insert_with(CancellationToken::new).clone()
    }

    /// Signals the run's token, if one is registered. Returns `true` if a
    /// running worker was actually signaled.
    pub async fn cancel(&self, run_id: RunId) -> bool {
        if let Some(token) = self.tokens.read().await.get(&run_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Signals every currently-registered token. Used by `Shutdown`.
    pub async fn cancel_all(&self) {
        for token in self.tokens.read().await.values() {
            token.cancel();
        }
    }

    /// Drops the token once the worker reaches a terminal state.
    pub async fn remove(&self, run_id: RunId) {
        self.tokens.write().await.remove(&run_id);
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signals_an_existing_token() {
        let registry = CancellationRegistry::new();
        let run_id = RunId::new();
        let token = registry.create(run_id).await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel(run_id).await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_on_unknown_run_is_a_no_op() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(RunId::new()).await);
    }
}
