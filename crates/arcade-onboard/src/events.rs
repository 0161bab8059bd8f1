use tokio::sync::broadcast;

/// Outcome carried by completion events; the error is pre-rendered so events stay `Clone`.
pub type Outcome = std::result::Result<(), String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    DownloadCompleted { game: String, outcome: Outcome },
    BannerReady { game: String, outcome: Outcome },
    IconReady { game: String, outcome: Outcome },
    ImageBuilt { game: String },
    Launched { game: String, pid: Option<u32> },
    Exited { game: String, exit_code: Option<i32> },
    Killed { game: String },
}

impl LifecycleEvent {
    pub fn game(&self) -> &str {
        match self {
            LifecycleEvent::DownloadCompleted { game, .. }
            | LifecycleEvent::BannerReady { game, .. }
            | LifecycleEvent::IconReady { game, .. }
            | LifecycleEvent::ImageBuilt { game }
            | LifecycleEvent::Launched { game, .. }
            | LifecycleEvent::Exited { game, .. }
            | LifecycleEvent::Killed { game } => game,
        }
    }
}

pub(crate) fn outcome<T>(res: &crate::error::Result<T>) -> Outcome {
    match res {
        Ok(_) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Fan-out of lifecycle events. Sending with no subscribers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(game = event.game(), ?event, "lifecycle event");
        let _ = self.tx.send(event);
    }
}

/// Logs every event from `rx` until the bus closes. A lagging receiver skips what it
/// missed and keeps going. Returns how many events were logged.
pub async fn log_events(mut rx: broadcast::Receiver<LifecycleEvent>) -> usize {
    let mut logged = 0;
    loop {
        match rx.recv().await {
            Ok(ev) => {
                tracing::info!(game = ev.game(), ?ev, "lifecycle");
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
