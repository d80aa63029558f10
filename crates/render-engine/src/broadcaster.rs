use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use render_types::{EngineError, RunId};
use render_wire::ProgressEvent;

const CHANNEL_CAPACITY: usize = 1024;

struct RunChannel {
    sender: broadcast::Sender<ProgressEvent>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Per-run set of subscriber sinks (SSE-style), bounded in size, with
/// heartbeats. A subscriber that reports closed or errors is simply dropped
/// by `tokio::sync::broadcast`'s own slow-receiver/closed-receiver handling;
/// this wraps it with a subscriber cap and a heartbeat loop that owns itself
/// per run rather than living in the transport handler.
#[derive(Clone)]
pub struct Broadcaster {
    channels: Arc<RwLock<HashMap<RunId, RunChannel>>>,
    max_subscribers_per_run: usize,
    heartbeat_interval: Duration,
}

impl Broadcaster {
    pub fn new(max_subscribers_per_run: usize, heartbeat_interval: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            max_subscribers_per_run,
            heartbeat_interval,
        }
    }

    /// Registers a new subscriber for `run_id`, spawning the run's heartbeat
    /// loop on first registration. Rejects once `receiver_count()` would
    /// exceed `max_subscribers_per_run`.
    pub async fn register(
        &self,
        run_id: RunId,
    ) -> Result<broadcast::Receiver<ProgressEvent>, EngineError> {
        let mut guard = self.channels.write().await;
        let entry = guard.entry(run_id).or_insert_with(|| RunChannel {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            heartbeat: None,
        });

        if entry.sender.receiver_count() >= self.max_subscribers_per_run {
            return Err(EngineError::TooManySubscribers);
        }

        let receiver = entry.sender.subscribe();

        if entry.heartbeat.is_none() {
            let sender = entry.sender.clone();
            let channels = self.channels.clone();
            let interval = self.heartbeat_interval;
            entry.heartbeat = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    if sender.receiver_count() == 0 {
                        channels.write().await.remove(&run_id);
                        return;
                    }
                    let _ = sender.send(ProgressEvent::Heartbeat {});
                }
            }));
        }

        Ok(receiver)
    }

    /// Fans `event` out to every current subscriber of `run_id`. A no-op if
    /// nobody has ever subscribed and nobody is currently subscribed.
    pub async fn emit(&self, run_id: RunId, event: ProgressEvent) {
        let guard = self.channels.read().await;
        if let Some(channel) = guard.get(&run_id) {
            let _ = channel.sender.send(event);
        }
    }

    pub async fn subscriber_count(&self, run_id: RunId) -> usize {
        self.channels
            .read()
            .await
            .get(&run_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Terminates every subscriber across every run. Used by `Shutdown`.
    pub async fn drain_all(&self) {
        let mut guard = self.channels.write().await;
        for (_, channel) in guard.drain() {
            if let Some(handle) = channel.heartbeat {
                handle.abort();
            }
        }
    }
}
