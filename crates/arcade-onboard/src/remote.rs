use std::sync::Arc;

use arcade_types::Game;

use crate::arbiter::DownloadArbiter;
use crate::error::{OnboardError, Result};

/// The four remote catalog endpoints, all fetched through the shared arbiter.
#[derive(Clone)]
pub struct CatalogApi {
    base_url: String,
    arbiter: Arc<DownloadArbiter>,
}

impl CatalogApi {
    pub fn new(base_url: impl Into<String>, arbiter: Arc<DownloadArbiter>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, arbiter }
    }

    pub fn arbiter(&self) -> &Arc<DownloadArbiter> {
        &self.arbiter
    }

    pub fn game_list_url(&self) -> String {
        format!("{}/gamelist", self.base_url)
    }

    pub fn archive_url(&self, id: &str) -> String {
        format!("{}/download/{id}", self.base_url)
    }

    pub fn banner_url(&self, id: &str) -> String {
        format!("{}/download/banner/{id}", self.base_url)
    }

    pub fn icon_url(&self, id: &str) -> String {
        format!("{}/download/icon/{id}", self.base_url)
    }

    pub async fn game_list(&self) -> Result<Vec<Game>> {
        let body = self.arbiter.fetch(&self.game_list_url()).await?;
        serde_json::from_slice(&body)
            .map_err(|e| OnboardError::Protocol(format!("decode game list: {e}")))
    }

    pub async fn archive(&self, id: &str) -> Result<Vec<u8>> {
        self.arbiter.fetch(&self.archive_url(id)).await
    }

    pub async fn banner(&self, id: &str) -> Result<Vec<u8>> {
        self.arbiter.fetch(&self.banner_url(id)).await
    }

    pub async fn icon(&self, id: &str) -> Result<Vec<u8>> {
        self.arbiter.fetch(&self.icon_url(id)).await
    }
}
