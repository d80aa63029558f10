use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use render_store::Store;
use render_types::{LogEntry, RunId};
use render_wire::ProgressEvent;

use crate::broadcaster::Broadcaster;

/// How long an appender waits for the next entry before it decides the run
/// is idle and terminates. The next `append` call starts a fresh appender.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Once the first entry of a batch arrives, how long to keep draining the
/// channel before writing the batch back, so a burst of concurrent appends
/// lands in one Store transaction instead of one per entry.
const BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Serializes concurrent log appends to the same run. At most one appender
/// task owns a run's `logs` field at a time; all other callers hand entries
/// off through an unbounded channel instead of racing a read-modify-write
/// against each other.
pub struct LogQueue {
    store: Arc<dyn Store>,
    broadcaster: Broadcaster,
    appenders: Arc<Mutex<HashMap<RunId, mpsc::UnboundedSender<LogEntry>>>>,
    handles: Arc<Mutex<HashMap<RunId, JoinHandle<()>>>>,
}

impl LogQueue {
    pub fn new(store: Arc<dyn Store>, broadcaster: Broadcaster) -> Self {
        Self {
            store,
            broadcaster,
            appenders: Arc::new(Mutex::new(HashMap::new())),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Hands `entry` to the run's appender, spawning one if none is active.
    pub async fn append(&self, run_id: RunId, entry: LogEntry) {
        let mut guard = self.appenders.lock().await;

        let entry = match guard.get(&run_id) {
            Some(sender) => match sender.send(entry) {
                Ok(()) => return,
                Err(err) => err.0,
            },
            None => entry,
        };

        guard.remove(&run_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(entry);
        guard.insert(run_id, tx);
        drop(guard);

        let handle = tokio::spawn(run_appender(
            run_id,
            rx,
            self.store.clone(),
            self.broadcaster.clone(),
            self.appenders.clone(),
        ));
        self.handles.lock().await.insert(run_id, handle);
    }

    /// Closes every run's channel and waits for its appender to flush any
    /// batch it already holds and exit. Used by `Shutdown` to guarantee no
    /// in-flight log writes remain once it returns.
    pub async fn drain_all(&self) {
        self.appenders.lock().await.clear();
        let handles: Vec<JoinHandle<()>> =
            self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_appender(
    run_id: RunId,
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    store: Arc<dyn Store>,
    broadcaster: Broadcaster,
    appenders: Arc<Mutex<HashMap<RunId, mpsc::UnboundedSender<LogEntry>>>>,
) {
    loop {
        let mut batch = match timeout(IDLE_TIMEOUT, rx.recv()).await {
            Ok(Some(first)) => vec![first],
            Ok(None) | Err(_) => {
                // `None` (sender dropped, e.g. by `drain_all`) or timeout
                // elapsed. `append` only sends while holding `appenders`'
                // lock, so take it here before deciding to exit: a send that
                // raced the timeout is sitting in the channel and must be
                // drained before we remove ourselves, or it is lost for good
                // once the fresh appender that loses the race never gets
                // spawned (`append` saw a live sender and returned early).
                let mut guard = appenders.lock().await;
                match rx.try_recv() {
                    Ok(entry) => vec![entry],
                    Err(_) => {
                        guard.remove(&run_id);
                        return;
                    }
                }
            }
        };

        let drain_until = Instant::now() + BATCH_WINDOW;
        while Instant::now() < drain_until {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        let for_store = batch.clone();
        let result = store
            .transition_run(run_id, Box::new(move |run| run.logs.extend(for_store)), None)
            .await;

        match result {
            Ok(_) => {
                for entry in &batch {
                    broadcaster
                        .emit(
                            run_id,
                            ProgressEvent::Log {
                                level: entry.level,
                                message: entry.message.clone(),
                                timestamp: entry.timestamp,
                            },
                        )
                        .await;
                }
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %run_id,
                    error = %err,
                    batch_size = batch.len(),
                    "log append batch failed to persist"
                );
            }
        }
    }
}
