use std::sync::Once;

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, prelude::*};

static INIT: Once = Once::new();

/// Diagnostic log encoding. Status lines go to stdout either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the stderr fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter();
        let registry = tracing_subscriber::registry();
        let result = match log_format {
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .compact()
                        .with_filter(env_filter),
                )
                .try_init(),
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(true)
                        .json()
                        .with_filter(env_filter),
                )
                .try_init(),
        };
        init_result = Some(result.map_err(anyhow::Error::from));
    });
    init_result.unwrap_or(Ok(()))
}
