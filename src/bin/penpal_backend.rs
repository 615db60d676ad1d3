use anyhow::{Context, Result};
use penpal_backend::config::SchedulerConfig;
use penpal_backend::runtime::SchedulerRuntime;
use penpal_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,penpal_backend=debug")),
        )
        .init();

    let config = SchedulerConfig::load().context("failed to load scheduler config")?;
    let runtime =
        SchedulerRuntime::bootstrap(config).context("failed to bootstrap scheduler runtime")?;

    tracing::info!(
        "Starting scheduler service (set PENPAL_BACKEND_TOKEN + optional PENPAL_BACKEND_BIND; auth mode via PENPAL_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime))
}
