//! Known games and their locally attached artwork.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock, RwLock},
    time::Duration,
};

use arcade_types::{Game, Tag};

use crate::error::Result;
use crate::layout;
use crate::remote::CatalogApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Remote,
    Filesystem,
    Unavailable,
}

/// One game plus its set-once artwork paths.
#[derive(Debug)]
pub struct CatalogEntry {
    game: Arc<Game>,
    banner: OnceLock<PathBuf>,
    icon: OnceLock<PathBuf>,
}

impl CatalogEntry {
    fn new(game: Game) -> Self {
        Self {
            game: Arc::new(game),
            banner: OnceLock::new(),
            icon: OnceLock::new(),
        }
    }

    pub fn game(&self) -> &Arc<Game> {
        &self.game
    }

    /// `None` means the placeholder is still shown.
    pub fn banner(&self) -> Option<&Path> {
        self.banner.get().map(PathBuf::as_path)
    }

    pub fn icon(&self) -> Option<&Path> {
        self.icon.get().map(PathBuf::as_path)
    }

    pub fn set_banner(&self, path: PathBuf) {
        let _ = self.banner.set(path);
    }

    pub fn set_icon(&self, path: PathBuf) {
        let _ = self.icon.set(path);
    }
}

/// Keeps only the latest upload per name, in first-seen order.
pub fn dedup_latest(games: Vec<Game>) -> Vec<Game> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Game> = HashMap::new();
    for game in games {
        match latest.get(&game.name) {
            Some(cur) if cur.upload_date >= game.upload_date => {}
            Some(_) => {
                latest.insert(game.name.clone(), game);
            }
            None => {
                order.push(game.name.clone());
                latest.insert(game.name.clone(), game);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|name| latest.remove(&name))
        .collect()
}

pub struct Catalog {
    entries: RwLock<Vec<Arc<CatalogEntry>>>,
    source: RwLock<CatalogSource>,
}

impl Catalog {
    pub fn from_games(games: Vec<Game>, source: CatalogSource) -> Self {
        let entries = dedup_latest(games)
            .into_iter()
            .map(|g| Arc::new(CatalogEntry::new(g)))
            .collect();
        Self {
            entries: RwLock::new(entries),
            source: RwLock::new(source),
        }
    }

    pub fn unavailable() -> Self {
        Self::from_games(Vec::new(), CatalogSource::Unavailable)
    }

    /// Remote list, one retry after `retry_delay` on connectivity errors, then local
    /// snapshots under `base_dir`.
    pub async fn load(api: &CatalogApi, base_dir: &Path, retry_delay: Duration) -> Self {
        match api.game_list().await {
            Ok(games) => return Self::from_remote(games),
            Err(e) if e.is_connectivity() => {
                tracing::error!(
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "failed to fetch game list"
                );
                tokio::time::sleep(retry_delay).await;
                match api.game_list().await {
                    Ok(games) => return Self::from_remote(games),
                    Err(e) => {
                        tracing::error!(error = %e, "game list retry failed; trying local snapshots")
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "game list unusable; trying local snapshots"),
        }

        let base = base_dir.to_path_buf();
        let local = tokio::task::spawn_blocking(move || layout::load_snapshots(&base))
            .await
            .unwrap_or_default();
        if local.is_empty() {
            tracing::error!(base = %base_dir.display(), "catalog unavailable: no local snapshots");
            return Self::unavailable();
        }
        tracing::warn!(games = local.len(), "catalog rebuilt from local snapshots");
        Self::from_games(local, CatalogSource::Filesystem)
    }

    fn from_remote(games: Vec<Game>) -> Self {
        let catalog = Self::from_games(games, CatalogSource::Remote);
        tracing::info!(games = catalog.len(), "catalog loaded");
        catalog
    }

    /// Refetches the list and merges it in. Returns how many entries were added or
    /// replaced by a newer upload.
    pub async fn refresh(&self, api: &CatalogApi) -> Result<usize> {
        let fetched = dedup_latest(api.game_list().await?);

        let mut changed = 0;
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            for game in fetched {
                if entries.iter().any(|e| e.game.id == game.id) {
                    continue;
                }
                match entries.iter().position(|e| e.game.name == game.name) {
                    Some(i) if entries[i].game.upload_date >= game.upload_date => continue,
                    Some(i) => entries[i] = Arc::new(CatalogEntry::new(game)),
                    None => entries.push(Arc::new(CatalogEntry::new(game))),
                }
                changed += 1;
            }
        }
        *self.source.write().unwrap_or_else(|e| e.into_inner()) = CatalogSource::Remote;
        if changed > 0 {
            tracing::info!(changed, "catalog refreshed");
        }
        Ok(changed)
    }

    pub fn source(&self) -> CatalogSource {
        *self.source.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_available(&self) -> bool {
        self.source() != CatalogSource::Unavailable
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<Arc<CatalogEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn games(&self) -> Vec<Arc<Game>> {
        self.entries().iter().map(|e| e.game.clone()).collect()
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<CatalogEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.game.id.0 == id)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<CatalogEntry>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.game.name == name)
            .cloned()
    }

    pub fn with_tag(&self, tag: &str) -> Vec<Arc<Game>> {
        self.entries()
            .iter()
            .filter(|e| e.game.has_tag(tag))
            .map(|e| e.game.clone())
            .collect()
    }

    /// Distinct tags across all games, sorted by name.
    pub fn tags(&self) -> Vec<Tag> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for entry in self.entries() {
            for tag in &entry.game.tags {
                if seen.insert(tag.name.clone()) {
                    out.push(tag.clone());
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{DownloadArbiter, tests::MockTransport};
    use crate::layout::GameLayout;

    fn game(id: &str, name: &str, date: &str, tags: &[&str]) -> Game {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "upload_date": date,
            "tags": tags.iter().map(|t| serde_json::json!({"name": t})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    fn api(transport: Arc<MockTransport>) -> CatalogApi {
        let arbiter = Arc::new(DownloadArbiter::new(transport, 3, 2, Duration::from_millis(10)));
        CatalogApi::new("http://cat", arbiter)
    }

    #[test]
    fn duplicate_names_keep_latest_upload() {
        let games = dedup_latest(vec![
            game("1", "Snake", "2023-01-01", &[]),
            game("2", "Tetris", "2023-02-01", &[]),
            game("3", "Snake", "2023-05-01", &[]),
            game("4", "Snake", "2023-03-01", &[]),
        ]);
        let ids: Vec<&str> = games.iter().map(|g| g.id.0.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
    }

    #[tokio::test]
    async fn load_prefers_remote_list() {
        let transport = Arc::new(MockTransport::default());
        let list = serde_json::to_vec(&vec![
            game("1", "Snake", "2023-01-01", &["arcade"]),
            game("2", "Tetris", "2023-01-01", &["puzzle", "arcade"]),
        ])
        .unwrap();
        transport.respond("http://cat/gamelist", &list);

        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::load(&api(transport.clone()), tmp.path(), Duration::ZERO).await;
        assert_eq!(catalog.source(), CatalogSource::Remote);
        assert_eq!(catalog.len(), 2);
        assert_eq!(transport.calls(), 1);

        assert_eq!(catalog.by_id("2").unwrap().game().name, "Tetris");
        assert_eq!(catalog.by_name("Snake").unwrap().game().id.0, "1");
        assert_eq!(catalog.with_tag("arcade").len(), 2);
        let tags: Vec<String> = catalog.tags().into_iter().map(|t| t.name).collect();
        assert_eq!(tags, vec!["arcade", "puzzle"]);
    }

    #[tokio::test]
    async fn load_retries_once_then_uses_snapshots() {
        let transport = Arc::new(MockTransport::default());
        let tmp = tempfile::tempdir().unwrap();
        GameLayout::new(tmp.path(), "Snake")
            .unwrap()
            .write_snapshot(&game("1", "Snake", "2023-01-01", &[]))
            .unwrap();

        let catalog = Catalog::load(&api(transport.clone()), tmp.path(), Duration::ZERO).await;
        assert_eq!(transport.calls(), 2);
        assert_eq!(catalog.source(), CatalogSource::Filesystem);
        assert!(catalog.by_name("Snake").is_some());
    }

    #[tokio::test]
    async fn undecodable_list_skips_retry() {
        let transport = Arc::new(MockTransport::default());
        transport.respond("http://cat/gamelist", b"<html>not json</html>");
        let tmp = tempfile::tempdir().unwrap();
        GameLayout::new(tmp.path(), "Snake")
            .unwrap()
            .write_snapshot(&game("1", "Snake", "2023-01-01", &[]))
            .unwrap();

        let catalog = Catalog::load(&api(transport.clone()), tmp.path(), Duration::ZERO).await;
        assert_eq!(transport.calls(), 1);
        assert_eq!(catalog.source(), CatalogSource::Filesystem);
    }

    #[tokio::test]
    async fn exhausted_permits_skip_retry() {
        let transport = Arc::new(MockTransport::default());
        let arbiter = Arc::new(DownloadArbiter::new(
            transport.clone(),
            1,
            2,
            Duration::from_millis(10),
        ));
        let _held = arbiter.try_acquire().unwrap();
        let tmp = tempfile::tempdir().unwrap();

        let catalog = Catalog::load(
            &CatalogApi::new("http://cat", arbiter.clone()),
            tmp.path(),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(catalog.source(), CatalogSource::Unavailable);
    }

    #[tokio::test]
    async fn load_without_snapshots_is_unavailable() {
        let transport = Arc::new(MockTransport::default());
        let tmp = tempfile::tempdir().unwrap();

        let catalog = Catalog::load(&api(transport), tmp.path(), Duration::ZERO).await;
        assert_eq!(catalog.source(), CatalogSource::Unavailable);
        assert!(!catalog.is_available());
        assert!(catalog.is_empty());
    }

    #[tokio::test]
    async fn refresh_adds_new_ids_and_newer_uploads() {
        let catalog = Catalog::from_games(
            vec![
                game("1", "Snake", "2023-01-01", &[]),
                game("2", "Tetris", "2023-01-01", &[]),
            ],
            CatalogSource::Filesystem,
        );
        let transport = Arc::new(MockTransport::default());
        let list = serde_json::to_vec(&vec![
            game("1", "Snake", "2023-01-01", &[]),
            game("5", "Tetris", "2024-01-01", &[]),
            game("7", "Pong", "2022-01-01", &[]),
        ])
        .unwrap();
        transport.respond("http://cat/gamelist", &list);

        let changed = catalog.refresh(&api(transport)).await.unwrap();
        assert_eq!(changed, 2);
        assert_eq!(catalog.source(), CatalogSource::Remote);
        assert_eq!(catalog.by_name("Tetris").unwrap().game().id.0, "5");
        assert!(catalog.by_id("7").is_some());
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn artwork_is_set_once() {
        let catalog = Catalog::from_games(
            vec![game("1", "Snake", "2023-01-01", &[])],
            CatalogSource::Remote,
        );
        let entry = catalog.by_id("1").unwrap();
        assert!(entry.banner().is_none());
        entry.set_banner(PathBuf::from("/a/banner.png"));
        entry.set_banner(PathBuf::from("/b/banner.png"));
        assert_eq!(entry.banner(), Some(Path::new("/a/banner.png")));
    }
}
