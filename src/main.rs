//! pentest-runner server entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pentest_runner::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pentest_runner=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        runs_dir = %config.runs_dir.display(),
        max_concurrent_tasks = config.max_concurrent_tasks,
        "Starting pentest-runner {}",
        env!("CARGO_PKG_VERSION")
    );

    api::serve(config).await
}
