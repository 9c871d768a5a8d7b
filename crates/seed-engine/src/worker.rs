use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use tileseed_core::{RenderTask, TileCoord, TileRange, fan_out, tile_range};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::api::{TaskOutcome, TaskSummary, WorkerStage};
use crate::queue::{LeasedMessage, TaskQueue};
use crate::renderer::Renderer;
use crate::uploader::{UploadRecord, Uploader, storage_headers};

pub(crate) enum WorkerCommand {
    Task {
        worker_idx: usize,
        message: Box<LeasedMessage>,
    },
    Stop,
}

pub(crate) enum WorkerInternalEvent {
    StageChanged { worker_idx: usize, stage: WorkerStage },
    TaskFinished { worker_idx: usize, outcome: TaskOutcome },
    Warning { message: String },
    Error { message: String },
}

/// Everything a worker needs besides its command channel.
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) renderer: Arc<dyn Renderer>,
    pub(crate) uploader: Uploader,
    pub(crate) tile_size: u32,
    pub(crate) interactivity: bool,
    pub(crate) skip_existing: bool,
    pub(crate) child_attempts: u32,
}

pub(crate) fn summarize(message: &LeasedMessage) -> TaskSummary {
    TaskSummary {
        message_id: message.message_id.clone(),
        tile: message.task.tile,
        metatile_size: message.task.metatile_size,
        retina: message.task.retina,
        delivery_count: message.delivery_count,
    }
}

pub(crate) async fn run_worker_task(
    mut rx: mpsc::Receiver<WorkerCommand>,
    internal_tx: mpsc::UnboundedSender<WorkerInternalEvent>,
    ctx: Arc<WorkerContext>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Task {
                worker_idx,
                message,
            } => {
                let outcome = run_task(worker_idx, &internal_tx, &ctx, *message).await;
                let _ = internal_tx.send(WorkerInternalEvent::TaskFinished {
                    worker_idx,
                    outcome,
                });
            }
        }
    }
}

#[derive(Debug, Default)]
struct RenderTally {
    rendered: u32,
    skipped: u32,
    failed: u32,
}

enum TileResult {
    Rendered,
    Skipped,
    Failed,
}

async fn run_task(
    worker_idx: usize,
    internal_tx: &mpsc::UnboundedSender<WorkerInternalEvent>,
    ctx: &WorkerContext,
    message: LeasedMessage,
) -> TaskOutcome {
    let started_at = Instant::now();
    let mut outcome = TaskOutcome {
        worker_idx,
        task: summarize(&message),
        tiles_rendered: 0,
        render_errors: 0,
        tiles_skipped: 0,
        children_enqueued: 0,
        acknowledged: false,
        error: None,
        total_ms: 0,
        finished_at: 0,
    };

    // Another consumer may hold the message now; leave it to them.
    if message.lease_expired() {
        outcome.error = Some("Error (lease expired)".to_string());
        return finish(outcome, started_at);
    }

    let task = &message.task;
    let covered = match tile_range(&task.bbox, task.tile.z, ctx.tile_size) {
        Ok(range) => Some(range),
        Err(err) => {
            let _ = internal_tx.send(WorkerInternalEvent::Warning {
                message: format!("task {}: {err}", task.title()),
            });
            None
        }
    };

    let _ = internal_tx.send(WorkerInternalEvent::StageChanged {
        worker_idx,
        stage: WorkerStage::Rendering,
    });
    if let Some(covered) = &covered {
        let tally = render_metatile(ctx, task, covered).await;
        outcome.tiles_rendered = tally.rendered;
        outcome.render_errors = tally.failed;
        outcome.tiles_skipped = tally.skipped;
    }

    let _ = internal_tx.send(WorkerInternalEvent::StageChanged {
        worker_idx,
        stage: WorkerStage::Scheduling,
    });
    let children = covered
        .as_ref()
        .map(|covered| fan_out(task, covered))
        .unwrap_or_default();
    for child in &children {
        match ctx
            .queue
            .enqueue(&message.lease.channel, child, ctx.child_attempts, child.priority())
            .await
        {
            Ok(_) => outcome.children_enqueued += 1,
            Err(err) => {
                // Leave the parent leased so redelivery re-schedules the subtree.
                let _ = internal_tx.send(WorkerInternalEvent::Error {
                    message: format!("enqueue {} failed: {err}", child.title()),
                });
                outcome.error = Some(format!("Error (enqueue children: {err})"));
                return finish(outcome, started_at);
            }
        }
    }

    let _ = internal_tx.send(WorkerInternalEvent::StageChanged {
        worker_idx,
        stage: WorkerStage::Acknowledging,
    });
    match ctx.queue.acknowledge(&message.lease).await {
        Ok(()) => outcome.acknowledged = true,
        Err(err) => {
            let _ = internal_tx.send(WorkerInternalEvent::Error {
                message: format!("acknowledge {} failed: {err}", task.title()),
            });
            outcome.error = Some(format!("Error (acknowledge: {err})"));
        }
    }

    debug!(
        tile = %task.tile,
        rendered = outcome.tiles_rendered,
        failed = outcome.render_errors,
        skipped = outcome.tiles_skipped,
        children = outcome.children_enqueued,
        "task finished"
    );
    finish(outcome, started_at)
}

fn finish(mut outcome: TaskOutcome, started_at: Instant) -> TaskOutcome {
    outcome.total_ms = started_at.elapsed().as_millis() as u64;
    outcome.finished_at = Utc::now().timestamp();
    outcome
}

/// Render every tile of the metatile inside `covered`, concurrently.
///
/// Successful renders are handed to the uploader and not awaited. With
/// `skip_existing`, a tile whose image is already stored is not rendered.
async fn render_metatile(ctx: &WorkerContext, task: &RenderTask, covered: &TileRange) -> RenderTally {
    let mut set = JoinSet::new();
    for tile in task.tiles().filter(|t| covered.contains(t)) {
        let renderer = ctx.renderer.clone();
        let uploader = ctx.uploader.clone();
        let style = task.style.clone();
        let retina = task.retina;
        let interactivity = ctx.interactivity;
        let skip_existing = ctx.skip_existing;
        set.spawn(async move {
            let path = tile.image_path(retina, "png");
            if skip_existing && uploader.exists(&path).await {
                debug!(%tile, "already stored, skipping");
                return TileResult::Skipped;
            }
            if interactivity {
                render_grid(renderer.as_ref(), &uploader, &style, tile).await;
            }
            match renderer.get_tile(tile, retina).await {
                Ok(rendered) => {
                    uploader.spawn(UploadRecord {
                        path,
                        headers: storage_headers(&style, tile.z, "png", &rendered.headers),
                        body: rendered.body,
                    });
                    TileResult::Rendered
                }
                Err(err) => {
                    warn!(%tile, error = %err, "render failed");
                    TileResult::Failed
                }
            }
        });
    }

    let mut tally = RenderTally::default();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(TileResult::Rendered) => tally.rendered += 1,
            Ok(TileResult::Skipped) => tally.skipped += 1,
            Ok(TileResult::Failed) => tally.failed += 1,
            Err(err) => {
                warn!(error = %err, "render task join error");
                tally.failed += 1;
            }
        }
    }
    tally
}

async fn render_grid(renderer: &dyn Renderer, uploader: &Uploader, style: &str, tile: TileCoord) {
    match renderer.get_grid(tile).await {
        Ok(Some(grid)) => uploader.spawn(UploadRecord {
            path: tile.grid_path(),
            headers: storage_headers(style, tile.z, "json", &grid.headers),
            body: grid.body,
        }),
        Ok(None) => {}
        Err(err) => warn!(%tile, error = %err, "grid render failed"),
    }
}
