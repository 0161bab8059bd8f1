//! Per-game download, launch and teardown.
//!
//! Commands for one game are serialized by a per-game async lock. Stage and handle for every
//! game live in one table behind a sync mutex so UI polls never wait on a download.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use arcade_types::{Game, GameStage, GameStatus};

use crate::archive;
use crate::catalog::CatalogEntry;
use crate::error::{OnboardError, Result};
use crate::events::{EventBus, LifecycleEvent, outcome};
use crate::launcher::{GameHandle, Launcher};
use crate::layout::{self, GameLayout};
use crate::remote::CatalogApi;

#[derive(Debug)]
struct RuntimeEntry {
    stage: GameStage,
    handle: Option<GameHandle>,
    exit_code: Option<i32>,
    message: Option<String>,
}

impl Default for RuntimeEntry {
    fn default() -> Self {
        Self {
            stage: GameStage::Absent,
            handle: None,
            exit_code: None,
            message: None,
        }
    }
}

impl RuntimeEntry {
    fn is_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.has_exited())
    }
}

type RuntimeTable = Arc<Mutex<HashMap<String, RuntimeEntry>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artwork {
    Banner,
    Icon,
}

pub struct LifecycleManager {
    base_dir: PathBuf,
    api: CatalogApi,
    events: EventBus,
    kill_grace: Duration,
    runtime: RuntimeTable,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(base_dir: PathBuf, api: CatalogApi, events: EventBus, kill_grace: Duration) -> Self {
        Self {
            base_dir,
            api,
            events,
            kill_grace,
            runtime: Arc::new(Mutex::new(HashMap::new())),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock_for(&self, game: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(game.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn with_entry<R>(&self, game: &str, f: impl FnOnce(&mut RuntimeEntry) -> R) -> R {
        let mut map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        f(map.entry(game.to_string()).or_default())
    }

    /// Moves to `stage` unless a live handle owns the game.
    fn set_stage(&self, game: &str, stage: GameStage, message: Option<String>) {
        self.with_entry(game, |e| {
            if e.is_live() {
                return;
            }
            e.stage = stage;
            e.message = message;
        });
    }

    fn fail(&self, game: &str, err: &OnboardError) {
        tracing::error!(game, error = %err, "lifecycle step failed");
        self.set_stage(game, GameStage::Failed, Some(err.to_string()));
    }

    /// Makes sure `{base}/{name}/publish` exists, downloading and unpacking the archive if
    /// not. An existing `publish` dir is trusted as-is. Returns the game directory.
    pub async fn ensure_downloaded(&self, game: &Game) -> Result<PathBuf> {
        let layout = GameLayout::new(&self.base_dir, &game.name)?;
        let lock = self.lock_for(&game.name);
        let _guard = lock.lock().await;

        let res = self.download_locked(game, &layout).await;
        if let Err(e) = &res {
            self.fail(&game.name, e);
        }
        self.events.emit(LifecycleEvent::DownloadCompleted {
            game: game.name.clone(),
            outcome: outcome(&res),
        });
        res.map(|_| layout.dir)
    }

    async fn download_locked(&self, game: &Game, layout: &GameLayout) -> Result<()> {
        if layout.is_unpacked() {
            tracing::debug!(game = %game.name, "game already unpacked");
        } else {
            self.set_stage(&game.name, GameStage::Downloading, None);
            tracing::info!(game = %game.name, id = %game.id, "downloading game");
            let bytes = self.api.archive(&game.id.0).await?;

            let dest = layout.dir.clone();
            tokio::task::spawn_blocking(move || archive::install_zip(&bytes, &dest))
                .await
                .map_err(|e| OnboardError::Extraction(format!("extract task: {e}")))??;
            tracing::info!(game = %game.name, dir = %layout.dir.display(), "game unpacked");
        }

        layout.write_snapshot(game)?;
        self.set_stage(&game.name, GameStage::Unpacked, None);
        Ok(())
    }

    /// Starts the game with the given strategy. Fails with `AlreadyRunning` while a previous
    /// handle is live; a failed launch records no handle.
    pub async fn launch(&self, game: &Game, launcher: &dyn Launcher) -> Result<GameStatus> {
        let layout = GameLayout::new(&self.base_dir, &game.name)?;
        let lock = self.lock_for(&game.name);
        let _guard = lock.lock().await;

        if self.is_running(&game.name) {
            return Err(OnboardError::AlreadyRunning(game.name.clone()));
        }

        tracing::info!(game = %game.name, launcher = launcher.name(), "launching");
        let handle = match self.start_locked(game, &layout, launcher).await {
            Ok(h) => h,
            Err(e) => {
                self.fail(&game.name, &e);
                return Err(e);
            }
        };

        let pid = handle.pid();
        self.with_entry(&game.name, |e| {
            e.stage = GameStage::Running;
            e.handle = Some(handle.clone());
            e.exit_code = None;
            e.message = None;
        });
        self.events.emit(LifecycleEvent::Launched {
            game: game.name.clone(),
            pid,
        });
        self.watch_exit(handle);
        Ok(self.status(&game.name))
    }

    async fn start_locked(
        &self,
        game: &Game,
        layout: &GameLayout,
        launcher: &dyn Launcher,
    ) -> Result<GameHandle> {
        if launcher.prepare(game, &layout.dir).await? {
            self.set_stage(&game.name, GameStage::Containerized, None);
            self.events.emit(LifecycleEvent::ImageBuilt {
                game: game.name.clone(),
            });
        }
        launcher.start(game, &layout.dir).await
    }

    fn watch_exit(&self, handle: GameHandle) {
        let runtime = self.runtime.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let code = handle.wait().await;
            let game = handle.game().to_string();
            // A kill takes the handle out first and reports `Killed` itself.
            let ours = {
                let mut map = runtime.lock().unwrap_or_else(|e| e.into_inner());
                match map.get_mut(&game) {
                    Some(e) if e.handle.as_ref().is_some_and(|h| h.same_process(&handle)) => {
                        e.handle = None;
                        e.exit_code = code;
                        match handle.launch_failure() {
                            Some(msg) => {
                                tracing::error!(game = %game, error = %msg, "game failed to start");
                                e.stage = GameStage::Failed;
                                e.message = Some(msg);
                            }
                            None => e.stage = GameStage::Exited,
                        }
                        true
                    }
                    _ => false,
                }
            };
            if ours {
                events.emit(LifecycleEvent::Exited {
                    game,
                    exit_code: code,
                });
            }
        });
    }

    /// Downloads if needed, then launches.
    pub async fn launch_game(&self, game: &Game, launcher: &dyn Launcher) -> Result<GameStatus> {
        self.ensure_downloaded(game).await?;
        self.launch(game, launcher).await
    }

    pub fn is_running(&self, game: &str) -> bool {
        let map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        map.get(game).is_some_and(RuntimeEntry::is_live)
    }

    /// Terminates the live handle, if any. Returns whether something was killed.
    pub async fn kill(&self, game: &str) -> bool {
        let handle = {
            let mut map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
            map.get_mut(game).and_then(|e| e.handle.take())
        };
        let Some(handle) = handle else {
            return false;
        };

        tracing::info!(game, pid = ?handle.pid(), "killing game");
        handle.terminate(self.kill_grace).await;
        self.with_entry(game, |e| {
            e.stage = GameStage::Exited;
            e.exit_code = handle.exit_code();
            e.message = Some("killed".to_string());
        });
        self.events.emit(LifecycleEvent::Killed {
            game: game.to_string(),
        });
        true
    }

    pub async fn kill_all(&self) {
        let live: Vec<String> = {
            let map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .filter(|(_, e)| e.handle.is_some())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for game in live {
            self.kill(&game).await;
        }
    }

    pub fn status(&self, game: &str) -> GameStatus {
        let map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(game) {
            Some(e) => status_of(game, e),
            None => {
                let stage = match GameLayout::new(&self.base_dir, game) {
                    Ok(l) if l.is_unpacked() => GameStage::Unpacked,
                    _ => GameStage::Absent,
                };
                GameStatus {
                    game: game.to_string(),
                    stage,
                    pid: None,
                    exit_code: None,
                    message: None,
                }
            }
        }
    }

    pub fn statuses(&self) -> Vec<GameStatus> {
        let map = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<GameStatus> = map.iter().map(|(k, e)| status_of(k, e)).collect();
        out.sort_by(|a, b| a.game.cmp(&b.game));
        out
    }

    /// Banner for the card; `None` leaves the placeholder in place.
    pub async fn ensure_banner(&self, entry: &CatalogEntry) -> Option<PathBuf> {
        self.ensure_artwork(entry, Artwork::Banner).await
    }

    pub async fn ensure_icon(&self, entry: &CatalogEntry) -> Option<PathBuf> {
        self.ensure_artwork(entry, Artwork::Icon).await
    }

    async fn ensure_artwork(&self, entry: &CatalogEntry, kind: Artwork) -> Option<PathBuf> {
        let game = entry.game();
        let res = self.fetch_artwork(game, kind).await;
        let ev_outcome = outcome(&res);
        let event = match kind {
            Artwork::Banner => LifecycleEvent::BannerReady {
                game: game.name.clone(),
                outcome: ev_outcome,
            },
            Artwork::Icon => LifecycleEvent::IconReady {
                game: game.name.clone(),
                outcome: ev_outcome,
            },
        };
        self.events.emit(event);

        match res {
            Ok(path) => {
                match kind {
                    Artwork::Banner => entry.set_banner(path.clone()),
                    Artwork::Icon => entry.set_icon(path.clone()),
                }
                Some(path)
            }
            Err(e) => {
                tracing::warn!(game = %game.name, kind = ?kind, error = %e, "artwork unavailable");
                None
            }
        }
    }

    async fn fetch_artwork(&self, game: &Game, kind: Artwork) -> Result<PathBuf> {
        let layout = GameLayout::new(&self.base_dir, &game.name)?;
        let path = match kind {
            Artwork::Banner => layout.banner(),
            Artwork::Icon => layout.icon(),
        };
        if path.is_file() {
            return Ok(path);
        }

        let bytes = match kind {
            Artwork::Banner => self.api.banner(&game.id.0).await?,
            Artwork::Icon => self.api.icon(&game.id.0).await?,
        };
        let target = path.clone();
        tokio::task::spawn_blocking(move || layout::write_atomic(&target, &bytes))
            .await
            .map_err(|e| OnboardError::Io(std::io::Error::other(e)))??;
        Ok(path)
    }
}

fn status_of(game: &str, e: &RuntimeEntry) -> GameStatus {
    // A handle whose wait task has finished but not yet been collected is already exited.
    let (stage, exit_code) = match &e.handle {
        Some(h) if h.has_exited() => (GameStage::Exited, h.exit_code()),
        _ => (e.stage, e.exit_code),
    };
    GameStatus {
        game: game.to_string(),
        stage,
        pid: e.handle.as_ref().and_then(|h| h.pid()),
        exit_code,
        message: e.message.clone(),
    }
}
