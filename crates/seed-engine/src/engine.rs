use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::api::{
    EngineConfig, EngineDeps, EngineEvent, EngineHandle, QueueStatus, StatusSnapshot,
    TaskOutcome, TaskSummary, WorkerSnapshot, WorkerStage,
};
use crate::broker::{ChannelCounts, ChannelHandle};
use crate::queue::{LeasedMessage, QueueError};
use crate::worker::{WorkerCommand, WorkerContext, WorkerInternalEvent, summarize};

type PollResult = Result<Result<Vec<LeasedMessage>, QueueError>, tokio::task::JoinError>;
type CountsResult = Result<Result<ChannelCounts, QueueError>, tokio::task::JoinError>;

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl EngineInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct WorkerRuntime {
    stage: WorkerStage,
    task: Option<TaskSummary>,
}

impl WorkerRuntime {
    fn new() -> Self {
        Self {
            stage: WorkerStage::Idle,
            task: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.stage == WorkerStage::Idle
    }

    fn start_task(&mut self, task: TaskSummary) {
        self.stage = WorkerStage::Rendering;
        self.task = Some(task);
    }

    fn finish_task(&mut self) {
        self.stage = WorkerStage::Idle;
        self.task = None;
    }
}

struct EngineRuntime {
    cfg: EngineConfig,
    deps: EngineDeps,
    channel: ChannelHandle,

    workers: Vec<WorkerRuntime>,
    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    internal_rx: mpsc::UnboundedReceiver<WorkerInternalEvent>,
    worker_join: JoinSet<()>,

    pending: VecDeque<LeasedMessage>,
    poll_task: Option<JoinHandle<Result<Vec<LeasedMessage>, QueueError>>>,
    poll_backoff: Option<Pin<Box<tokio::time::Sleep>>>,
    counts_task: Option<JoinHandle<Result<ChannelCounts, QueueError>>>,

    recent_tasks: VecDeque<TaskOutcome>,
    last_status: Option<QueueStatus>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<EngineInner>,
}

impl EngineRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        let workers = self
            .workers
            .iter()
            .enumerate()
            .map(|(idx, w)| WorkerSnapshot {
                worker_idx: idx,
                stage: w.stage,
                task: w.task.clone(),
            })
            .collect();

        StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            workers,
            recent_tasks: self.recent_tasks.iter().cloned().collect(),
            status: self.last_status,
        }
    }

    fn push_snapshot(&self) {
        let snap = self.build_snapshot();
        let _ = self.snapshot_tx.send(snap);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn running_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_idle()).count()
    }

    fn all_idle(&self) -> bool {
        self.running_count() == 0
    }

    /// Local backlog above which the poll loop stops receiving.
    fn backlog_limit(&self) -> usize {
        self.cfg.parallel.saturating_mul(2)
    }

    fn maybe_start_poll(&mut self) {
        if self.inner.should_stop() {
            return;
        }
        if self.poll_task.is_some() || self.poll_backoff.is_some() {
            return;
        }
        if self.pending.len() > self.backlog_limit() {
            return;
        }

        let queue = self.deps.queue.clone();
        let channel = self.channel.clone();
        let max_batch = self.cfg.parallel.min(EngineConfig::MAX_RECEIVE_BATCH);
        let wait = self.cfg.receive_wait;
        self.poll_task = Some(tokio::spawn(async move {
            queue.receive(&channel, max_batch, wait).await
        }));
    }

    fn start_counts(&mut self) {
        if self.counts_task.is_some() {
            return;
        }
        let queue = self.deps.queue.clone();
        let channel = self.channel.clone();
        self.counts_task = Some(tokio::spawn(async move { queue.counts(&channel).await }));
    }

    async fn assign_tasks(&mut self) -> anyhow::Result<()> {
        if self.inner.should_stop() {
            // Unstarted leases expire and the broker redelivers them.
            self.pending.clear();
            return Ok(());
        }

        let mut snapshot_dirty = false;
        for idx in 0..self.workers.len() {
            if !self.workers[idx].is_idle() {
                continue;
            }
            let Some(message) = self.pending.pop_front() else { break };

            let summary = summarize(&message);
            self.workers[idx].start_task(summary.clone());
            self.emit(EngineEvent::WorkerTaskStarted {
                worker_idx: idx,
                task: summary,
            });
            snapshot_dirty = true;

            self.worker_cmds
                .get(idx)
                .ok_or_else(|| anyhow::anyhow!("worker cmd sender missing for worker {idx}"))?
                .send(WorkerCommand::Task {
                    worker_idx: idx,
                    message: Box::new(message),
                })
                .await
                .map_err(|_| anyhow::anyhow!("worker {idx} command channel closed"))?;
        }

        if snapshot_dirty {
            self.push_snapshot();
        }

        Ok(())
    }

    fn handle_poll_result(&mut self, res: PollResult) {
        self.poll_task = None;

        match res {
            Ok(Ok(messages)) => {
                debug!(received = messages.len(), pending = self.pending.len(), "poll");
                if !self.inner.should_stop() {
                    self.pending.extend(messages);
                }
            }
            Ok(Err(err)) => {
                self.poll_backoff = Some(Box::pin(tokio::time::sleep(self.cfg.idle_sleep)));
                self.emit(EngineEvent::Error {
                    message: format!("receive error: {err}"),
                });
            }
            Err(err) => {
                self.poll_backoff = Some(Box::pin(tokio::time::sleep(self.cfg.idle_sleep)));
                self.emit(EngineEvent::Error {
                    message: format!("receive task join error: {err:#}"),
                });
            }
        }
    }

    fn handle_counts_result(&mut self, res: CountsResult) {
        self.counts_task = None;

        let counts = match res {
            Ok(Ok(counts)) => counts,
            Ok(Err(err)) => {
                self.emit(EngineEvent::Warning {
                    message: format!("status counts unavailable: {err}"),
                });
                return;
            }
            Err(err) => {
                self.emit(EngineEvent::Warning {
                    message: format!("status counts task join error: {err:#}"),
                });
                return;
            }
        };

        let status = QueueStatus {
            queued: counts.queued,
            in_flight: counts.in_flight,
            running: self.running_count() as u64,
            pending: self.pending.len() as u64,
            pending_uploads: self.deps.uploader.pending(),
            discarded: self.deps.queue.discarded(),
        };
        self.last_status = Some(status);
        self.emit(EngineEvent::Status { status });
        self.push_snapshot();

        if self.cfg.exit_on_drain && status.is_drained() && !self.inner.should_stop() {
            info!(channel = %self.channel.name, "queue drained");
            self.emit(EngineEvent::Drained);
            self.inner.request_stop();
        }
    }

    fn handle_internal_event(&mut self, ev: WorkerInternalEvent) {
        match ev {
            WorkerInternalEvent::StageChanged { worker_idx, stage } => {
                if let Some(worker) = self.workers.get_mut(worker_idx) {
                    worker.stage = stage;
                }
                self.emit(EngineEvent::WorkerStage { worker_idx, stage });
                self.push_snapshot();
            }
            WorkerInternalEvent::TaskFinished { worker_idx, outcome } => {
                if let Some(worker) = self.workers.get_mut(worker_idx) {
                    worker.finish_task();
                }
                self.recent_tasks.push_back(outcome.clone());
                while self.recent_tasks.len() > self.cfg.recent_tasks_max.max(1) {
                    self.recent_tasks.pop_front();
                }
                self.emit(EngineEvent::TaskFinished { outcome });
                self.emit(EngineEvent::WorkerStage {
                    worker_idx,
                    stage: WorkerStage::Idle,
                });
                self.push_snapshot();
            }
            WorkerInternalEvent::Warning { message } => {
                self.emit(EngineEvent::Warning { message });
            }
            WorkerInternalEvent::Error { message } => {
                self.emit(EngineEvent::Error { message });
            }
        }
    }

    async fn shutdown_workers(&mut self) {
        for tx in &self.worker_cmds {
            let _ = tx.send(WorkerCommand::Stop).await;
        }
        while self.worker_join.join_next().await.is_some() {}
    }

    /// Uploads are detached from tasks; hold the engine open until they finish.
    async fn wait_for_uploads(&self) {
        let pending = self.deps.uploader.pending();
        if pending == 0 {
            return;
        }
        info!(pending, "waiting for uploads to finish");
        self.deps.uploader.wait_idle().await;
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();

        let mut status_tick = tokio::time::interval(self.cfg.status_interval);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first sample sees real work.
        status_tick.reset();

        let mut result: anyhow::Result<()> = Ok(());

        loop {
            if self.inner.should_stop() && self.all_idle() {
                break;
            }

            if let Err(err) = self.assign_tasks().await {
                result = Err(err);
                break;
            }
            self.maybe_start_poll();

            let loop_result: anyhow::Result<()> = tokio::select! {
                _ = status_tick.tick() => {
                    self.start_counts();
                    Ok(())
                }
                _ = self.inner.notify.notified() => Ok(()),
                ev_opt = self.internal_rx.recv() => {
                    if let Some(ev) = ev_opt {
                        self.handle_internal_event(ev);
                    }
                    Ok(())
                }
                res = async {
                    match self.poll_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending::<PollResult>().await,
                    }
                } => {
                    self.handle_poll_result(res);
                    Ok(())
                }
                res = async {
                    match self.counts_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending::<CountsResult>().await,
                    }
                } => {
                    self.handle_counts_result(res);
                    Ok(())
                }
                _ = async {
                    match self.poll_backoff.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.poll_backoff = None;
                    Ok(())
                }
                res = self.worker_join.join_next() => {
                    match res {
                        Some(Ok(())) => Err(anyhow::anyhow!("worker task exited unexpectedly")),
                        Some(Err(err)) => Err(anyhow::anyhow!("worker task join error: {err:#}")),
                        None => Err(anyhow::anyhow!("worker join set empty unexpectedly")),
                    }
                }
            };

            if let Err(err) = loop_result {
                result = Err(err);
                break;
            }
        }

        if let Err(err) = &result {
            self.emit(EngineEvent::Error {
                message: format!("engine error: {err:#}"),
            });
        }

        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        if let Some(task) = self.counts_task.take() {
            task.abort();
        }
        self.poll_backoff = None;
        self.pending.clear();

        self.shutdown_workers().await;
        self.wait_for_uploads().await;
        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        result
    }
}

pub(crate) fn start_engine(cfg: EngineConfig, deps: EngineDeps) -> EngineHandle {
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        workers: Vec::new(),
        recent_tasks: Vec::new(),
        status: None,
    });

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_engine(inner.clone(), snapshot_tx, cfg, deps));
    EngineHandle { inner, join }
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: EngineConfig,
    deps: EngineDeps,
) -> anyhow::Result<()> {
    if cfg.parallel == 0 {
        cfg.parallel = 1;
    }
    if cfg.idle_sleep == Duration::ZERO {
        cfg.idle_sleep = EngineConfig::DEFAULT_IDLE_SLEEP;
    }
    if cfg.status_interval == Duration::ZERO {
        cfg.status_interval = EngineConfig::DEFAULT_STATUS_INTERVAL;
    }
    if cfg.child_attempts == 0 {
        cfg.child_attempts = EngineConfig::DEFAULT_CHILD_ATTEMPTS;
    }
    if cfg.tile_size == 0 {
        cfg.tile_size = tileseed_core::RenderSettings::DEFAULT_TILE_SIZE;
    }
    if cfg.recent_tasks_max == 0 {
        cfg.recent_tasks_max = EngineConfig::DEFAULT_RECENT_TASKS_MAX;
    }

    let channel = match deps.queue.ensure_channel(&cfg.channel).await {
        Ok(channel) => channel,
        Err(err) => {
            let message = format!("open channel {}: {err}", cfg.channel);
            let _ = inner
                .event_tx
                .send(EngineEvent::Error { message: message.clone() });
            let _ = inner.event_tx.send(EngineEvent::Stopped);
            return Err(anyhow::anyhow!("{message}"));
        }
    };

    let ctx = Arc::new(WorkerContext {
        queue: deps.queue.clone(),
        renderer: deps.renderer.clone(),
        uploader: deps.uploader.clone(),
        tile_size: cfg.tile_size,
        interactivity: cfg.interactivity,
        skip_existing: cfg.skip_existing,
        child_attempts: cfg.child_attempts,
    });

    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<WorkerInternalEvent>();

    let mut worker_cmds = Vec::with_capacity(cfg.parallel);
    let mut worker_join = JoinSet::new();

    for _ in 0..cfg.parallel {
        let (tx, rx) = mpsc::channel::<WorkerCommand>(1);
        worker_cmds.push(tx);

        let internal_tx = internal_tx.clone();
        let ctx = ctx.clone();
        worker_join.spawn(async move {
            crate::worker::run_worker_task(rx, internal_tx, ctx).await;
        });
    }

    info!(channel = %channel.name, parallel = cfg.parallel, "engine started");

    let workers = (0..cfg.parallel).map(|_| WorkerRuntime::new()).collect();
    let runtime = EngineRuntime {
        cfg,
        deps,
        channel,
        workers,
        worker_cmds,
        internal_rx,
        worker_join,
        pending: VecDeque::new(),
        poll_task: None,
        poll_backoff: None,
        counts_task: None,
        recent_tasks: VecDeque::new(),
        last_status: None,
        snapshot_tx,
        inner,
    };

    runtime.push_snapshot();
    runtime.run().await
}
