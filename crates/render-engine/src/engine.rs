use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::Level;

use render_observability::{emit_event, ObservabilityEvent, ProcessKind};
use render_steps::StepExecutor;
use render_store::Store;
use render_types::{
    EngineError, EngineResult, LogEntry, LogLevel, PlanVersion, ProjectStatus, Run, RunId,
    RunStatus, StepName, STEPS,
};
use render_wire::{LogEntryWire, ProgressEvent};

use crate::artifacts::run_artifact_dir;
use crate::broadcaster::Broadcaster;
use crate::cancellation::CancellationRegistry;
use crate::config::Config;
use crate::log_queue::LogQueue;

/// Bound on how long `shutdown` waits for active workers to reach a
/// terminal state before it stops waiting and tears the rest down anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn internal(err: anyhow::Error) -> EngineError {
    EngineError::IntegrityViolation(err.to_string())
}

fn to_wire_log(entry: &LogEntry) -> LogEntryWire {
    LogEntryWire {
        level: entry.level,
        message: entry.message.clone(),
        timestamp: entry.timestamp,
    }
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::Running => "running",
        RunStatus::Done => "done",
        RunStatus::Failed => "failed",
        RunStatus::Canceled => "canceled",
        RunStatus::QaFailed => "qa_failed",
    }
}

/// The scheduler and state machine. Owns the ready queue, the active-run
/// set, the cancellation registry, and the restart/shutdown protocol. Every
/// Run/Project status transition in the system goes through one of this
/// type's methods; nothing outside `Engine` writes `Run.status`.
pub struct Engine {
    store: Arc<dyn Store>,
    executor: Arc<dyn StepExecutor>,
    broadcaster: Broadcaster,
    log_queue: Arc<LogQueue>,
    cancellations: CancellationRegistry,
    config: Config,
    ready_queue: Mutex<VecDeque<RunId>>,
    active_runs: Mutex<HashSet<RunId>>,
    concurrency: Arc<Semaphore>,
    admission_notify: Notify,
    shutting_down: AtomicBool,
    admission_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, executor: Arc<dyn StepExecutor>, config: Config) -> Arc<Self> {
        let broadcaster = Broadcaster::new(config.max_subscribers_per_run, config.heartbeat_interval);
        let log_queue = Arc::new(LogQueue::new(store.clone(), broadcaster.clone()));
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Arc::new(Self {
            store,
            executor,
            broadcaster,
            log_queue,
            cancellations: CancellationRegistry::new(),
            ready_queue: Mutex::new(VecDeque::new()),
            active_runs: Mutex::new(HashSet::new()),
            concurrency,
            admission_notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            admission_handle: Mutex::new(None),
            config,
        })
    }

    /// Spawns the admission loop. Callers invoke `restore_after_restart`
    /// first so queued runs from a prior process are back in the ready
    /// queue before admission starts pulling from it.
    pub async fn start(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.admission_loop().await });
        *self.admission_handle.lock().await = Some(handle);
    }

    /// Persists a new `Run(status=queued)` for `plan` and offers it to the
    /// ready queue in FIFO order.
    pub async fn enqueue(self: &Arc<Self>, plan: PlanVersion) -> EngineResult<Run> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::Precondition(
                "engine is shutting down, not accepting new runs".into(),
            ));
        }
        if plan.scenes.is_empty() {
            return Err(EngineError::Precondition(
                "plan version has no scenes".into(),
            ));
        }

        let mut queue = self.ready_queue.lock().await;
        if queue.len() >= self.config.max_queue_size {
            return Err(EngineError::QueueFull);
        }

        self.store
            .create_plan_version(plan.clone())
            .await
            .map_err(internal)?;
        let run = Run::new(plan.project_id, plan.id);
        self.store.create_run(run.clone()).await.map_err(internal)?;
        queue.push_back(run.id);
        drop(queue);

        self.broadcaster
            .emit(
                run.id,
                ProgressEvent::Transition {
                    from: "".into(),
                    to: "queued".into(),
                },
            )
            .await;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.enqueued",
                component: "engine",
                run_id: Some(&run.id.to_string()),
                project_id: Some(&run.project_id.to_string()),
                step: None,
                status: Some("queued"),
                error_code: None,
                detail: None,
            },
        );
        self.admission_notify.notify_one();
        Ok(run)
    }

    /// Re-queues a terminal run, optionally rewinding its resume state to
    /// `from_step`. Only legal from `failed`, `canceled`, or `qa_failed`.
    pub async fn retry(self: &Arc<Self>, run_id: RunId, from_step: Option<StepName>) -> EngineResult<Run> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;
        if !matches!(
            run.status,
            RunStatus::Failed | RunStatus::Canceled | RunStatus::QaFailed
        ) {
            return Err(EngineError::NotRetryable);
        }

        let mut queue = self.ready_queue.lock().await;
        if queue.len() >= self.config.max_queue_size {
            return Err(EngineError::QueueFull);
        }

        let previous_status = status_str(run.status);
        let updated = self
            .store
            .transition_run(
                run_id,
                Box::new(move |r| {
                    if let Some(step) = from_step {
                        r.resume_state.rewind_to(step);
                        r.progress = r.resume_state.progress();
                    }
                    r.status = RunStatus::Queued;
                    r.current_step = None;
                }),
                None,
            )
            .await
            .map_err(internal)?;
        queue.push_back(run_id);
        drop(queue);

        self.log_queue
            .append(run_id, LogEntry::new(LogLevel::Info, "retry requested"))
            .await;
        self.broadcaster
            .emit(
                run_id,
                ProgressEvent::Transition {
                    from: previous_status.into(),
                    to: "queued".into(),
                },
            )
            .await;
        self.admission_notify.notify_one();
        Ok(updated)
    }

    /// Cancels a queued or running run. A no-op error (`NotCancelable`) for
    /// any run already in a terminal state.
    pub async fn cancel(&self, run_id: RunId) -> EngineResult<()> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;

        match run.status {
            RunStatus::Queued => {
                let mut queue = self.ready_queue.lock().await;
                queue.retain(|id| *id != run_id);
                drop(queue);

                self.store
                    .transition_run(run_id, Box::new(|r| r.status = RunStatus::Canceled), None)
                    .await
                    .map_err(internal)?;
                self.broadcaster
                    .emit(
                        run_id,
                        ProgressEvent::Transition {
                            from: "queued".into(),
                            to: "canceled".into(),
                        },
                    )
                    .await;
                Ok(())
            }
            RunStatus::Running => {
                if self.cancellations.cancel(run_id).await {
                    Ok(())
                } else {
                    Err(EngineError::NotCancelable)
                }
            }
            _ => Err(EngineError::NotCancelable),
        }
    }

    /// Registers a subscriber for `run_id` and returns a stream that first
    /// yields a `state` snapshot, then live progress events, then periodic
    /// heartbeats.
    pub async fn subscribe(
        &self,
        run_id: RunId,
    ) -> EngineResult<impl Stream<Item = ProgressEvent> + Send> {
        // Confirm the run exists before registering a subscriber for it, but
        // take the snapshot itself from a read taken *after* registration:
        // otherwise an event emitted between this existence check and
        // `register` would reach neither the snapshot nor the new receiver.
        self.store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;
        let receiver = self.broadcaster.register(run_id).await?;
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;

        let initial = ProgressEvent::State {
            run_id: run.id.to_string(),
            status: run.status,
            progress: run.progress,
            current_step: run.current_step.clone(),
            logs: run.logs.iter().rev().take(50).rev().map(to_wire_log).collect(),
        };

        let live = BroadcastStream::new(receiver).filter_map(|msg| msg.ok());
        Ok(tokio_stream::once(initial).chain(live))
    }

    /// Scans for runs stranded `running` by a prior process and fails them;
    /// re-admits still-`queued` runs into the in-memory ready queue. Must be
    /// called once, before `start`, and before any caller can reach `Enqueue`.
    pub async fn restore_after_restart(&self) -> EngineResult<()> {
        for run in self.store.find_stuck_runs().await.map_err(internal)? {
            let run_id = run.id;
            let project_id = run.project_id;

            let siblings = self
                .store
                .list_runs_for_project(project_id)
                .await
                .map_err(internal)?;
            let has_newer_success = siblings
                .iter()
                .any(|r| r.id != run_id && r.status == RunStatus::Done && r.created_at > run.created_at);
            let project_update = if has_newer_success {
                None
            } else {
                Some((project_id, ProjectStatus::Failed))
            };

            self.store
                .transition_run(
                    run_id,
                    Box::new(|r| {
                        r.status = RunStatus::Failed;
                        r.current_step = Some("error".to_string());
                    }),
                    project_update,
                )
                .await
                .map_err(internal)?;
            self.log_queue
                .append(
                    run_id,
                    LogEntry::new(LogLevel::Warn, "marked as failed after restart"),
                )
                .await;
            self.broadcaster
                .emit(
                    run_id,
                    ProgressEvent::Transition {
                        from: "running".into(),
                        to: "failed".into(),
                    },
                )
                .await;
        }

        let mut queue = self.ready_queue.lock().await;
        for run in self.store.find_queued_runs().await.map_err(internal)? {
            if let Ok(Some(fresh)) = self.store.get_run(run.id).await {
                if fresh.status == RunStatus::Queued {
                    queue.push_back(run.id);
                }
            }
        }
        drop(queue);
        self.admission_notify.notify_one();
        Ok(())
    }

    /// Stops accepting new `Enqueue` calls, signals every active run's
    /// cancellation token, waits up to `SHUTDOWN_GRACE` for workers to reach
    /// a terminal state, then drains the log appenders and subscribers.
    pub async fn shutdown(self: &Arc<Self>) -> EngineResult<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancellations.cancel_all().await;
        self.admission_notify.notify_waiters();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            if self.active_runs.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if let Some(handle) = self.admission_handle.lock().await.take() {
            handle.abort();
        }

        self.log_queue.drain_all().await;
        self.broadcaster.drain_all().await;
        Ok(())
    }

    async fn admission_loop(self: Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let permit = match self.concurrency.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let run_id = loop {
                if self.shutting_down.load(Ordering::SeqCst) {
                    break None;
                }
                if let Some(id) = self.ready_queue.lock().await.pop_front() {
                    break Some(id);
                }
                self.admission_notify.notified().await;
            };

            let run_id = match run_id {
                Some(id) => id,
                None => {
                    drop(permit);
                    return;
                }
            };

            match self.store.get_run(run_id).await {
                Ok(Some(run)) if run.status == RunStatus::Queued => {
                    self.active_runs.lock().await.insert(run_id);
                    let engine = self.clone();
                    tokio::spawn(async move { engine.run_worker(run_id, permit).await });
                }
                _ => drop(permit),
            }
        }
    }

    async fn run_worker(self: Arc<Self>, run_id: RunId, permit: OwnedSemaphorePermit) {
        let cancel = self.cancellations.create(run_id).await;

        let outcome = self.drive_run(run_id, &cancel).await;
        if let Err(err) = outcome {
            tracing::warn!(run_id = %run_id, error = %err, "worker aborted before reaching a terminal state");
        }

        self.active_runs.lock().await.remove(&run_id);
        self.cancellations.remove(run_id).await;
        drop(permit);
    }

    /// Drives one run through the step loop to a terminal state. Internal
    /// Store/executor failures not covered by the step contract (e.g. the
    /// plan version having vanished) are returned as `Err` purely for the
    /// caller to log; they are never surfaced to a subscriber as anything
    /// other than the run staying in its last durable state.
    async fn drive_run(
        &self,
        run_id: RunId,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> EngineResult<()> {
        let queued_run = self
            .store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;
        let plan = self
            .store
            .get_plan_version(queued_run.plan_version_id)
            .await
            .map_err(internal)?
            .ok_or(EngineError::NotFound)?;

        let mut run = self
            .store
            .transition_run(
                run_id,
                Box::new(|r| r.status = RunStatus::Running),
                Some((queued_run.project_id, ProjectStatus::Rendering)),
            )
            .await
            .map_err(internal)?;
        self.broadcaster
            .emit(
                run_id,
                ProgressEvent::Transition {
                    from: "queued".into(),
                    to: "running".into(),
                },
            )
            .await;

        let artifact_dir = run_artifact_dir(&self.config.artifact_root, run.project_id, run_id);
        if let Err(err) = tokio::fs::create_dir_all(&artifact_dir).await {
            self.log_queue
                .append(
                    run_id,
                    LogEntry::new(
                        LogLevel::Error,
                        format!("failed to create artifact directory: {err}"),
                    ),
                )
                .await;
        }

        for step in STEPS {
            if run.resume_state.is_completed(step) {
                continue;
            }
            if cancel.is_cancelled() {
                self.transition_canceled(run_id).await;
                return Ok(());
            }

            run = self
                .store
                .transition_run(
                    run_id,
                    Box::new(move |r| r.current_step = Some(step.to_string())),
                    None,
                )
                .await
                .map_err(internal)?;
            self.broadcaster
                .emit(run_id, ProgressEvent::StepStart { step: step.to_string() })
                .await;
            emit_event(
                Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "step.start",
                    component: "engine.worker",
                    run_id: Some(&run_id.to_string()),
                    project_id: Some(&run.project_id.to_string()),
                    step: Some(step.as_str()),
                    status: None,
                    error_code: None,
                    detail: None,
                },
            );

            match self
                .executor
                .run(step, cancel.clone(), &run, &plan, &artifact_dir)
                .await
            {
                Ok(result) => {
                    let artifacts = result.artifacts;
                    let resume_data = result.resume_data;
                    if !result.scene_durations.is_empty() {
                        self.store
                            .update_scene_durations(run.plan_version_id, &result.scene_durations)
                            .await
                            .map_err(internal)?;
                    }
                    run = self
                        .store
                        .transition_run(
                            run_id,
                            Box::new(move |r| {
                                r.artifacts.extend(artifacts);
                                r.resume_state.mark_completed(step, resume_data);
                                r.progress = r.resume_state.progress();
                            }),
                            None,
                        )
                        .await
                        .map_err(internal)?;
                    self.broadcaster
                        .emit(
                            run_id,
                            ProgressEvent::StepEnd {
                                step: step.to_string(),
                                progress: run.progress,
                            },
                        )
                        .await;
                }
                Err(EngineError::Canceled) => {
                    self.transition_canceled(run_id).await;
                    return Ok(());
                }
                Err(err) => {
                    self.transition_failed(run_id, err.to_string()).await;
                    return Ok(());
                }
            }
        }

        let updated = self
            .store
            .transition_run(
                run_id,
                Box::new(|r| r.status = RunStatus::Done),
                Some((run.project_id, ProjectStatus::Done)),
            )
            .await
            .map_err(internal)?;
        self.broadcaster
            .emit(
                run_id,
                ProgressEvent::Transition {
                    from: "running".into(),
                    to: "done".into(),
                },
            )
            .await;
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run.done",
                component: "engine",
                run_id: Some(&run_id.to_string()),
                project_id: Some(&updated.project_id.to_string()),
                step: None,
                status: Some("done"),
                error_code: None,
                detail: None,
            },
        );
        Ok(())
    }

    async fn transition_failed(&self, run_id: RunId, message: impl Into<String>) {
        let message = message.into();
        self.log_queue
            .append(run_id, LogEntry::new(LogLevel::Error, message.clone()))
            .await;
        let result = self
            .store
            .transition_run(run_id, Box::new(|r| r.status = RunStatus::Failed), None)
            .await;
        if result.is_ok() {
            self.broadcaster
                .emit(
                    run_id,
                    ProgressEvent::Transition {
                        from: "running".into(),
                        to: "failed".into(),
                    },
                )
                .await;
            emit_event(
                Level::ERROR,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "run.failed",
                    component: "engine.worker",
                    run_id: Some(&run_id.to_string()),
                    project_id: None,
                    step: None,
                    status: Some("failed"),
                    error_code: None,
                    detail: Some(&message),
                },
            );
        }
    }

    async fn transition_canceled(&self, run_id: RunId) {
        let result = self
            .store
            .transition_run(run_id, Box::new(|r| r.status = RunStatus::Canceled), None)
            .await;
        if result.is_ok() {
            self.broadcaster
                .emit(
                    run_id,
                    ProgressEvent::Transition {
                        from: "running".into(),
                        to: "canceled".into(),
                    },
                )
                .await;
        }
    }
}
