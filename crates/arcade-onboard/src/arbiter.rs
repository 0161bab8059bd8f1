//! Bounded pool of download permits shared by every outbound fetch.
//!
//! Catalog listings, game archives, banners and icons all go through one arbiter, so the
//! remote catalog never sees more than `capacity` requests from this cabinet at once.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{OnboardError, Result};

/// Raw GET transport. Failures and non-success statuses come back as `Connectivity`.
pub trait HttpTransport: Send + Sync {
    fn get<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("arcade-onboard")
            .timeout(Duration::from_secs(10 * 60))
            .build()
            .map_err(|e| OnboardError::Config(format!("build http client: {e}")))?;
        Ok(Self { client, token })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let mut req = self.client.get(uri);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| OnboardError::Connectivity(format!("GET {uri}: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(OnboardError::Connectivity(format!(
                    "GET {uri}: status {status}"
                )));
            }
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| OnboardError::Connectivity(format!("read body {uri}: {e}")))?;
            Ok(bytes.to_vec())
        })
    }
}

/// A checked-out permit; returned to the pool on drop.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

pub struct DownloadArbiter {
    permits: Arc<Semaphore>,
    capacity: usize,
    attempts: u32,
    delay: Duration,
    transport: Arc<dyn HttpTransport>,
}

impl DownloadArbiter {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        capacity: usize,
        attempts: u32,
        delay: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            attempts: attempts.max(1),
            delay,
            transport,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|p| Permit { _permit: p })
    }

    /// Waits for a permit, giving up after `attempts` waits of `delay` each.
    pub async fn acquire(&self) -> Result<Permit> {
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.delay, self.permits.clone().acquire_owned()).await {
                Ok(Ok(p)) => return Ok(Permit { _permit: p }),
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::debug!(attempt, max = self.attempts, "no download permit free yet");
                }
            }
        }
        tracing::warn!(attempts = self.attempts, "no locks available");
        Err(OnboardError::ResourceExhausted {
            attempts: self.attempts,
        })
    }

    pub async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let _permit = self.acquire().await?;
        tracing::debug!(uri, in_flight = self.in_flight(), "fetching");
        match self.transport.get(uri).await {
            Ok(body) => {
                tracing::debug!(uri, bytes = body.len(), "fetched");
                Ok(body)
            }
            Err(e) => {
                tracing::warn!(uri, error = %e, "fetch failed");
                Err(e)
            }
        }
    }
}
