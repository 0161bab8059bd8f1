//! On-disk layout under the base directory, one folder per game name:
//! `{base}/{name}/{publish/, banner.png, icon.png, {name}.json, Containerfile}`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use arcade_types::Game;

use crate::error::{OnboardError, Result};

#[derive(Debug, Clone)]
pub struct GameLayout {
    pub dir: PathBuf,
    name: String,
}

impl GameLayout {
    /// Rejects names that would escape `base` or collide with the layout itself.
    pub fn new(base: &Path, name: &str) -> Result<Self> {
        let bad = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0');
        if bad {
            return Err(OnboardError::Protocol(format!("invalid game name {name:?}")));
        }
        Ok(Self {
            dir: base.join(name),
            name: name.to_string(),
        })
    }

    pub fn publish(&self) -> PathBuf {
        self.dir.join("publish")
    }

    pub fn banner(&self) -> PathBuf {
        self.dir.join("banner.png")
    }

    pub fn icon(&self) -> PathBuf {
        self.dir.join("icon.png")
    }

    pub fn snapshot(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    pub fn is_unpacked(&self) -> bool {
        self.publish().is_dir()
    }

    pub fn write_snapshot(&self, game: &Game) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.snapshot();
        let tmp = self.dir.join(format!("{}.json.tmp", self.name));
        let json = serde_json::to_vec_pretty(game)?;
        if let Err(e) = fs::write(&tmp, json).and_then(|_| fs::rename(&tmp, &path)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Writes `bytes` to `path` via a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Reads every `{base}/{name}/{name}.json` snapshot. Unreadable ones are skipped.
pub fn load_snapshots(base: &Path) -> Vec<Game> {
    let Ok(rd) = fs::read_dir(base) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in rd.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let path = dir.join(format!("{name}.json"));
        let Ok(raw) = fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<Game>(&raw) {
            Ok(game) => out.push(game),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str, name: &str) -> Game {
        serde_json::from_value(serde_json::json!({ "id": id, "name": name })).unwrap()
    }

    #[test]
    fn rejects_escaping_names() {
        let base = Path::new("/tmp/devcade");
        assert!(GameLayout::new(base, "..").is_err());
        assert!(GameLayout::new(base, "a/b").is_err());
        assert!(GameLayout::new(base, "").is_err());

        let l = GameLayout::new(base, "Snake").unwrap();
        assert_eq!(l.publish(), PathBuf::from("/tmp/devcade/Snake/publish"));
        assert_eq!(l.snapshot(), PathBuf::from("/tmp/devcade/Snake/Snake.json"));
        assert_eq!(l.banner(), PathBuf::from("/tmp/devcade/Snake/banner.png"));
    }

    #[test]
    fn snapshots_round_trip_through_directory_scan() {
        let tmp = tempfile::tempdir().unwrap();
        for (id, name) in [("1", "Snake"), ("2", "Tetris")] {
            GameLayout::new(tmp.path(), name)
                .unwrap()
                .write_snapshot(&game(id, name))
                .unwrap();
        }
        fs::create_dir_all(tmp.path().join("junk")).unwrap();
        fs::write(tmp.path().join("junk/junk.json"), b"{not json").unwrap();
        fs::write(tmp.path().join("onboard.sock"), b"").unwrap();

        let mut names: Vec<String> = load_snapshots(tmp.path())
            .into_iter()
            .map(|g| g.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Snake", "Tetris"]);
    }

    #[test]
    fn missing_base_dir_yields_nothing() {
        assert!(load_snapshots(Path::new("/nonexistent/arcade/base")).is_empty());
    }
}
