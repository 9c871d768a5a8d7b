mod cli;
mod logging;
mod shutdown;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tileseed_core::RenderSettings;
use tileseed_engine::{
    BackoffPolicy, Broker, EngineConfig, EngineDeps, EngineEvent, HttpBroker, HttpRenderer,
    HttpTileStore, MemoryBroker, QueueStatus, TaskQueue, Uploader, seed_tasks, start_engine,
};
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Command, WorkArgs};
use crate::shutdown::{EXIT_INTERRUPTED, StopRequest, spawn_ctrl_c_listener};
use crate::status::{format_outcome_line, format_status_line};

/// Longer than any receive long-poll.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(cli::parse_error_exit_code(&err));
        }
    };
    logging::init(cli.log_format)?;

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("build http client")?;
    let render = cli.render.settings();
    let lease = Duration::from_secs(cli.lease_seconds);

    let broker: Arc<dyn Broker> = match &cli.command {
        Command::Run { .. } => Arc::new(MemoryBroker::new()),
        _ => Arc::new(HttpBroker::new(http.clone(), cli.broker_url.clone())),
    };
    let queue = Arc::new(TaskQueue::new(broker, lease));
    let channel = queue
        .ensure_channel(&cli.style)
        .await
        .with_context(|| format!("open channel {}", cli.style))?;

    match &cli.command {
        Command::Seed(seed) => {
            let n = seed_tasks(&queue, &channel, &seed.request(&cli.style, &render)).await?;
            println!("seeded {n} tasks into {}", channel.name);
        }
        Command::QueueInfo => {
            let counts = queue.counts(&channel).await?;
            println!(
                "{}",
                format_status_line(&QueueStatus {
                    queued: counts.queued,
                    in_flight: counts.in_flight,
                    ..QueueStatus::default()
                })
            );
        }
        Command::EmptyQueue => {
            queue.delete_channel(&channel).await?;
            println!("deleted channel {}", channel.name);
        }
        Command::Work(work) => {
            run_workers(&cli, http, queue, render, work, work.exit_on_drain).await?;
        }
        Command::Run { seed, work } => {
            let n = seed_tasks(&queue, &channel, &seed.request(&cli.style, &render)).await?;
            info!(tasks = n, "seeded in-memory channel");
            run_workers(&cli, http, queue, render, work, true).await?;
        }
    }
    Ok(())
}

async fn run_workers(
    cli: &Cli,
    http: reqwest::Client,
    queue: Arc<TaskQueue>,
    render: RenderSettings,
    work: &WorkArgs,
    exit_on_drain: bool,
) -> anyhow::Result<()> {
    let renderer = HttpRenderer::new(http.clone(), work.render_url.clone(), render);
    let store = HttpTileStore::new(http, work.storage_url.as_str(), &work.path_prefix);
    let uploader = Uploader::new(Arc::new(store), BackoffPolicy::default());

    let mut config = EngineConfig::new(cli.style.clone(), work.parallel);
    config.status_interval = Duration::from_secs(work.status_interval);
    config.exit_on_drain = exit_on_drain;
    config.tile_size = render.tile_size;
    config.interactivity = work.interactivity;
    config.skip_existing = work.skip_existing;

    let engine = start_engine(
        config,
        EngineDeps {
            queue,
            renderer: Arc::new(renderer),
            uploader,
        },
    );
    let mut events = engine.subscribe();
    let mut stop_rx = spawn_ctrl_c_listener();

    println!(
        "tileseed {} style={} parallel={}",
        env!("CARGO_PKG_VERSION"),
        cli.style,
        work.parallel
    );

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            req = stop_rx.recv() => {
                match req {
                    Some(StopRequest::Graceful) => {
                        eprintln!("Stop requested, finishing current tasks and uploads (press CTRL+C again to exit immediately).");
                        engine.request_stop();
                    }
                    Some(StopRequest::Immediate) => {
                        eprintln!("Stop requested again, exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    EngineEvent::Started
                    | EngineEvent::StopRequested
                    | EngineEvent::WorkerTaskStarted { .. }
                    | EngineEvent::WorkerStage { .. } => {}
                    EngineEvent::TaskFinished { outcome } => {
                        debug!("{}", format_outcome_line(&outcome));
                    }
                    EngineEvent::Status { status } => println!("{}", format_status_line(&status)),
                    EngineEvent::Drained => info!("channel drained"),
                    EngineEvent::Warning { message } => warn!("{message}"),
                    EngineEvent::Error { message } => error!("{message}"),
                    EngineEvent::Stopped => break,
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(EXIT_INTERRUPTED);
    }

    engine.wait().await
}
