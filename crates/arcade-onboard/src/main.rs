use anyhow::Context;
use arcade_onboard::{config::OnboardConfig, context::OnboardContext, events};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = OnboardConfig::from_env();
    tracing::info!(
        base = %config.base_dir.display(),
        channel = ?config.channel,
        launch_mode = ?config.launch_mode,
        "arcade-onboard starting"
    );

    let ctx = OnboardContext::start(config)
        .await
        .context("start onboard control plane")?;

    tokio::spawn(events::log_events(ctx.events.subscribe()));
    ctx.prefetch_artwork();

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    tracing::info!("shutting down");
    ctx.shutdown().await;

    Ok(())
}
