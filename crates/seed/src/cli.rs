use clap::builder::TypedValueParser as _;
use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use tileseed_core::{BoundingBox, RenderSettings};
use tileseed_engine::{EngineConfig, SeedRequest, TaskQueue};

use crate::logging::LogFormat;

const DEFAULT_BROKER_URL: &str = "http://127.0.0.1:9324";

/// Four tasks in flight per CPU.
pub fn default_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_mul(4)
        .min(1024)
}

/// Exit status for a failed parse: 0 for `--help`/`--version`, 1 otherwise.
pub fn parse_error_exit_code(err: &clap::Error) -> i32 {
    if err.use_stderr() { 1 } else { 0 }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "tileseed", version, about = "Distributed tile pyramid seeder")]
pub struct Cli {
    /// Broker service base URL.
    #[arg(long, env = "TILESEED_BROKER_URL", default_value = DEFAULT_BROKER_URL, global = true)]
    pub broker_url: Url,

    /// Style name; also the channel name.
    #[arg(long, env = "STYLE_NAME", default_value = "default", global = true)]
    pub style: String,

    /// Visibility window for leased messages, in seconds.
    #[arg(
        long,
        env = "TILESEED_LEASE_SECONDS",
        default_value_t = TaskQueue::DEFAULT_LEASE.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..),
        global = true
    )]
    pub lease_seconds: u64,

    #[arg(long, env = "TILESEED_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub render: RenderArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Enqueue the metatiles covering a bounding box at the min zoom.
    Seed(SeedArgs),
    /// Lease and render tasks from the broker.
    Work(WorkArgs),
    /// Seed and work in one process over an in-memory broker; exits on drain.
    Run {
        #[command(flatten)]
        seed: SeedArgs,
        #[command(flatten)]
        work: WorkArgs,
    },
    /// Print the channel counters.
    QueueInfo,
    /// Delete the channel and everything queued in it.
    EmptyQueue,
}

/// Renderer parameters; `--retina` doubles the pixel ones.
#[derive(Debug, Clone, Args)]
pub struct RenderArgs {
    /// Metatile edge length in tiles.
    #[arg(long, env = "METATILE", default_value_t = RenderSettings::DEFAULT_METATILE,
        value_parser = clap::value_parser!(u32).range(1..=64), global = true)]
    pub metatile: u32,

    #[arg(long, env = "BUFFER_SIZE", default_value_t = RenderSettings::DEFAULT_BUFFER_SIZE, global = true)]
    pub buffer_size: u32,

    #[arg(long, env = "TILE_SIZE", default_value_t = RenderSettings::DEFAULT_TILE_SIZE,
        value_parser = clap::value_parser!(u32).range(1..), global = true)]
    pub tile_size: u32,

    #[arg(long, env = "SCALE", default_value_t = RenderSettings::DEFAULT_SCALE,
        value_parser = clap::value_parser!(u32).range(1..), global = true)]
    pub scale: u32,
}

impl RenderArgs {
    pub fn settings(&self) -> RenderSettings {
        RenderSettings {
            metatile: self.metatile,
            buffer_size: self.buffer_size,
            tile_size: self.tile_size,
            scale: self.scale,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct SeedArgs {
    /// Bounding box: "minLon minLat maxLon maxLat".
    #[arg(short = 'b', long, allow_hyphen_values = true)]
    pub bbox: BoundingBox,

    /// Min zoom (inclusive); seed tasks are created here.
    #[arg(short = 'z', long = "min-zoom")]
    pub min_zoom: u8,

    /// Max zoom (inclusive).
    #[arg(short = 'Z', long = "max-zoom")]
    pub max_zoom: u8,

    /// Render retina (`@2x`) tiles.
    #[arg(short = 'r', long, default_value_t = false)]
    pub retina: bool,

    /// Attempt budget of each seed message.
    #[arg(long, default_value_t = SeedRequest::DEFAULT_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..))]
    pub attempts: u32,
}

impl SeedArgs {
    pub fn request(&self, style: &str, render: &RenderSettings) -> SeedRequest {
        SeedRequest {
            bbox: self.bbox,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            retina: self.retina,
            style: style.to_string(),
            metatile: render.metatile,
            tile_size: render.tile_size,
            attempts: self.attempts,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkArgs {
    /// Number of tasks processed concurrently.
    #[arg(
        short = 'p',
        long,
        env = "TILESEED_PARALLEL",
        default_value_t = default_parallel(),
        value_parser = clap::value_parser!(u64).range(1..=1024).map(|v| v as usize)
    )]
    pub parallel: usize,

    /// Rendering service base URL for the style.
    #[arg(long, env = "TILESEED_RENDER_URL")]
    pub render_url: Url,

    /// Object store base URL tiles are PUT to.
    #[arg(long, env = "STORAGE_URL")]
    pub storage_url: Url,

    /// Path prefix inside the store.
    #[arg(long, env = "PATH_PREFIX", default_value = "")]
    pub path_prefix: String,

    /// Also render and upload interactivity grids.
    #[arg(long, env = "TILESEED_INTERACTIVITY", default_value_t = false)]
    pub interactivity: bool,

    /// Skip tiles whose image is already in the store.
    #[arg(long, env = "TILESEED_SKIP_EXISTING", default_value_t = false)]
    pub skip_existing: bool,

    /// Seconds between status lines and drain checks.
    #[arg(
        long,
        env = "TILESEED_STATUS_INTERVAL",
        default_value_t = EngineConfig::DEFAULT_STATUS_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub status_interval: u64,

    /// Exit once the channel and local work are drained.
    #[arg(long, default_value_t = false)]
    pub exit_on_drain: bool,
}
