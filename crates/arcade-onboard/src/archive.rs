use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::error::{OnboardError, Result};

fn extraction<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> OnboardError {
    move |e| OnboardError::Extraction(format!("{what}: {e}"))
}

/// Unpacks a zip archive into `dest`, keeping each entry's relative path.
///
/// Entries that would land outside `dest` fail the whole extraction. Files are written
/// to a temp name and renamed into place. Returns the extracted file paths.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(extraction("open archive"))?;
    fs::create_dir_all(dest).map_err(extraction("create target dir"))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(extraction("read entry"))?;
        let Some(rel) = file.enclosed_name() else {
            return Err(OnboardError::Extraction(format!(
                "entry escapes target dir: {}",
                file.name()
            )));
        };
        let out_path = dest.join(rel);

        if file.is_dir() {
            fs::create_dir_all(&out_path).map_err(extraction("create dir"))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(extraction("create parent dir"))?;
        }

        let mut tmp_name = out_path.as_os_str().to_owned();
        tmp_name.push(".part");
        let tmp_path = PathBuf::from(tmp_name);
        let mut out = fs::File::create(&tmp_path).map_err(extraction("create file"))?;
        if let Err(e) = std::io::copy(&mut file, &mut out) {
            let _ = fs::remove_file(&tmp_path);
            return Err(OnboardError::Extraction(format!(
                "write {}: {e}",
                out_path.display()
            )));
        }
        out.sync_all().ok();
        fs::rename(&tmp_path, &out_path).map_err(extraction("rename into place"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                let perms = fs::Permissions::from_mode(mode & 0o777);
                fs::set_permissions(&out_path, perms).map_err(extraction("set permissions"))?;
            }
        }

        written.push(out_path);
    }

    tracing::debug!(dest = %dest.display(), files = written.len(), "archive extracted");
    Ok(written)
}

/// Directory an archive is staged in before it is moved into the game directory.
const STAGING_DIR: &str = ".unpack";

/// Unpacks a game archive into `game_dir` so that `publish/` only appears once the whole
/// archive extracted cleanly. A failed unpack leaves no `publish/` behind.
pub fn install_zip(bytes: &[u8], game_dir: &Path) -> Result<()> {
    let staging = game_dir.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(extraction("clear staging dir"))?;
    }

    let res = extract_zip(bytes, &staging).and_then(|_| promote(&staging, game_dir));
    if staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    res
}

/// Moves the staged top-level entries into `game_dir`, `publish` last.
fn promote(staging: &Path, game_dir: &Path) -> Result<()> {
    if !staging.join("publish").is_dir() {
        return Err(OnboardError::Extraction(
            "archive has no publish directory".to_string(),
        ));
    }

    let mut names: Vec<_> = fs::read_dir(staging)
        .map_err(extraction("read staging dir"))?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()
        .map_err(extraction("read staging dir"))?;
    names.sort_by_key(|n| n == "publish");

    for name in names {
        let from = staging.join(&name);
        let to = game_dir.join(&name);
        if to.is_dir() {
            fs::remove_dir_all(&to).map_err(extraction("replace dir"))?;
        } else if to.exists() {
            fs::remove_file(&to).map_err(extraction("replace file"))?;
        }
        fs::rename(&from, &to).map_err(extraction("move into place"))?;
    }
    Ok(())
}
