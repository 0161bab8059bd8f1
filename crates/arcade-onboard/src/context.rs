use std::sync::Arc;

use arcade_types::GameStatus;
use tokio::task::JoinHandle;

use crate::arbiter::{DownloadArbiter, HttpTransport, ReqwestTransport};
use crate::catalog::Catalog;
use crate::channel::{ChannelClient, ChannelOptions};
use crate::config::{LaunchMode, OnboardConfig};
use crate::error::{OnboardError, Result};
use crate::events::EventBus;
use crate::launcher::{DirectLauncher, Launcher, SandboxLauncher};
use crate::lifecycle::LifecycleManager;
use crate::remote::CatalogApi;

/// Everything the control plane shares, built once at startup.
pub struct OnboardContext {
    pub config: OnboardConfig,
    pub channel: ChannelClient,
    pub api: CatalogApi,
    pub catalog: Arc<Catalog>,
    pub lifecycle: Arc<LifecycleManager>,
    pub events: EventBus,
    launcher: Arc<dyn Launcher>,
    heartbeat: JoinHandle<()>,
}

impl OnboardContext {
    /// Opens the backend channel and loads the catalog over HTTP.
    pub async fn start(config: OnboardConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.api_token.clone())?);
        let channel = ChannelClient::open(
            &config.channel,
            ChannelOptions {
                call_timeout: config.call_timeout,
                ..ChannelOptions::default()
            },
        )
        .await?;
        Self::with_parts(config, channel, transport).await
    }

    pub async fn with_parts(
        config: OnboardConfig,
        channel: ChannelClient,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let Some(api_url) = config.api_url.clone() else {
            return Err(OnboardError::Config("ARCADE_API_URL is not set".to_string()));
        };
        tokio::fs::create_dir_all(&config.base_dir).await?;

        let arbiter = Arc::new(DownloadArbiter::new(
            transport,
            config.max_downloads,
            config.acquire_attempts,
            config.acquire_delay,
        ));
        let api = CatalogApi::new(api_url, arbiter);
        let heartbeat = channel.spawn_heartbeat(config.ping_interval, config.call_timeout);

        let catalog = Arc::new(Catalog::load(&api, &config.base_dir, config.catalog_retry_delay).await);
        let events = EventBus::default();
        let lifecycle = Arc::new(LifecycleManager::new(
            config.base_dir.clone(),
            api.clone(),
            events.clone(),
            config.kill_grace,
        ));
        let launcher: Arc<dyn Launcher> = match config.launch_mode {
            LaunchMode::Direct => Arc::new(DirectLauncher),
            LaunchMode::Sandbox => Arc::new(SandboxLauncher::new(config.sandbox.clone())),
        };
        tracing::info!(
            games = catalog.len(),
            source = ?catalog.source(),
            launcher = launcher.name(),
            "onboard context ready"
        );

        Ok(Self {
            config,
            channel,
            api,
            catalog,
            lifecycle,
            events,
            launcher,
            heartbeat,
        })
    }

    /// Launch strategy named by the config.
    pub fn default_launcher(&self) -> Arc<dyn Launcher> {
        self.launcher.clone()
    }

    /// Looks the game up by id and runs it with the configured launcher.
    pub async fn launch_by_id(&self, id: &str) -> Result<GameStatus> {
        let entry = self
            .catalog
            .by_id(id)
            .ok_or_else(|| OnboardError::UnknownGame(id.to_string()))?;
        self.lifecycle
            .launch_game(entry.game(), self.launcher.as_ref())
            .await
    }

    /// Fetches missing banners and icons in the background.
    pub fn prefetch_artwork(&self) -> Vec<JoinHandle<()>> {
        self.catalog
            .entries()
            .into_iter()
            .map(|entry| {
                let lifecycle = self.lifecycle.clone();
                tokio::spawn(async move {
                    lifecycle.ensure_banner(&entry).await;
                    lifecycle.ensure_icon(&entry).await;
                })
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        self.heartbeat.abort();
        self.lifecycle.kill_all().await;
        self.channel.shutdown();
    }
}
