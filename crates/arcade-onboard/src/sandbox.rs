use std::path::{Path, PathBuf};

use crate::error::{OnboardError, Result};

pub const CONTAINERFILE: &str = "Containerfile";
/// Records the tag of the last successful image build.
pub const IMAGE_TAG_FILE: &str = "image.tag";

/// Image tag for a game: lowercase alphanumeric runs joined by single `-`, so the result is
/// always a valid image name. Names with no alphanumerics fall back to `game`.
pub fn image_tag(game_name: &str) -> String {
    let mut out = String::with_capacity(game_name.len());
    for c in game_name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("game");
    }
    out
}

pub fn container_name(game_name: &str) -> String {
    format!("arcade-{}", image_tag(game_name))
}

/// Exec-form instructions are JSON arrays, so the binary path is JSON-escaped.
pub fn render_containerfile(base_image: &str, game_name: &str) -> String {
    let bin = format!("/app/{game_name}");
    let chmod = serde_json::json!(["chmod", "+x", bin.as_str()]);
    let cmd = serde_json::json!([bin.as_str()]);
    format!(
        "FROM {base_image}\n\
         COPY publish /app\n\
         RUN {chmod}\n\
         WORKDIR /app\n\
         CMD {cmd}\n"
    )
}

/// Writes the build descriptor into the game directory and returns its path.
pub fn write_containerfile(game_dir: &Path, base_image: &str, game_name: &str) -> Result<PathBuf> {
    let path = game_dir.join(CONTAINERFILE);
    std::fs::write(&path, render_containerfile(base_image, game_name)).map_err(|e| {
        OnboardError::ContainerBuild(format!("write {}: {e}", path.display()))
    })?;
    Ok(path)
}

pub fn build_args(context_dir: &Path, tag: &str) -> Vec<String> {
    vec![
        "build".to_string(),
        "--file".to_string(),
        context_dir.join(CONTAINERFILE).display().to_string(),
        format!("--tag={tag}"),
        context_dir.display().to_string(),
    ]
}

/// Display and audio passthrough for a graphical game.
#[derive(Debug, Clone, Default)]
pub struct Passthrough {
    pub display: Option<String>,
    pub xauthority: Option<PathBuf>,
    pub pulse_socket: Option<PathBuf>,
    pub sound_device: bool,
}

impl Passthrough {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let xauthority = var("XAUTHORITY")
            .map(PathBuf::from)
            .or_else(|| var("HOME").map(|h| PathBuf::from(h).join(".Xauthority")))
            .filter(|p| p.exists());
        let pulse_socket = var("XDG_RUNTIME_DIR")
            .map(|d| PathBuf::from(d).join("pulse").join("native"))
            .filter(|p| p.exists());
        Self {
            display: var("DISPLAY"),
            xauthority,
            pulse_socket,
            sound_device: Path::new("/dev/snd").exists(),
        }
    }
}

pub fn run_args(tag: &str, name: &str, pass: &Passthrough) -> Vec<String> {
    let mut out = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network=host".to_string(),
    ];

    if let Some(display) = &pass.display {
        out.push("--env".to_string());
        out.push(format!("DISPLAY={display}"));
        out.push("--volume".to_string());
        out.push("/tmp/.X11-unix:/tmp/.X11-unix".to_string());
    }
    if let Some(xauth) = &pass.xauthority {
        out.push("--env".to_string());
        out.push("XAUTHORITY=/root/.Xauthority".to_string());
        out.push("--volume".to_string());
        out.push(format!("{}:/root/.Xauthority:ro", xauth.display()));
    }
    if let Some(pulse) = &pass.pulse_socket {
        out.push("--env".to_string());
        out.push("PULSE_SERVER=unix:/run/pulse/native".to_string());
        out.push("--volume".to_string());
        out.push(format!("{}:/run/pulse/native", pulse.display()));
    }
    if pass.sound_device {
        out.push("--device".to_string());
        out.push("/dev/snd".to_string());
    }

    out.push(tag.to_string());
    out
}

pub fn kill_args(name: &str) -> Vec<String> {
    vec!["kill".to_string(), name.to_string()]
}

pub fn command_exists(bin: &str) -> bool {
    let path = Path::new(bin);
    if path.components().count() > 1 {
        return is_executable_file(path);
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable_file(&dir.join(bin))))
        .unwrap_or(false)
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_lowercase_and_safe() {
        assert_eq!(image_tag("SpaceInvaders"), "spaceinvaders");
        assert_eq!(image_tag("Bomb Omb Squad!"), "bomb-omb-squad");
        assert_eq!(image_tag("a..b"), "a-b");
        assert_eq!(image_tag("Snake (v2)"), "snake-v2");
        assert_eq!(image_tag("_hidden"), "hidden");
        assert_eq!(image_tag("!!!"), "game");
        assert_eq!(container_name("Tetris"), "arcade-tetris");
        assert_eq!(container_name("Pac--Man."), "arcade-pac-man");
    }

    #[test]
    fn containerfile_names_the_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_containerfile(tmp.path(), "debian:bookworm-slim", "Snake").unwrap();
        assert_eq!(path, tmp.path().join(CONTAINERFILE));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("FROM debian:bookworm-slim\n"));
        assert!(text.contains("COPY publish /app"));
        assert!(text.contains("RUN [\"chmod\",\"+x\",\"/app/Snake\"]"));
        assert!(text.contains("CMD [\"/app/Snake\"]"));
    }

    #[test]
    fn containerfile_escapes_quotes_in_names() {
        let name = r#"It's "Quoted""#;
        let text = render_containerfile("debian:bookworm-slim", name);
        let cmd = text
            .lines()
            .find_map(|l| l.strip_prefix("CMD "))
            .unwrap();
        let parsed: Vec<String> = serde_json::from_str(cmd).unwrap();
        assert_eq!(parsed, vec![format!("/app/{name}")]);

        let run = text
            .lines()
            .find_map(|l| l.strip_prefix("RUN "))
            .unwrap();
        let parsed: Vec<String> = serde_json::from_str(run).unwrap();
        assert_eq!(parsed[2], format!("/app/{name}"));
    }

    #[test]
    fn run_args_pass_display_and_audio() {
        let pass = Passthrough {
            display: Some(":0".to_string()),
            xauthority: Some(PathBuf::from("/home/arcade/.Xauthority")),
            pulse_socket: None,
            sound_device: true,
        };
        let args = run_args("snake", "arcade-snake", &pass);
        assert_eq!(&args[..4], &["run", "--rm", "--name", "arcade-snake"]);
        assert!(args.contains(&"DISPLAY=:0".to_string()));
        assert!(args.contains(&"/tmp/.X11-unix:/tmp/.X11-unix".to_string()));
        assert!(args.contains(&"/home/arcade/.Xauthority:/root/.Xauthority:ro".to_string()));
        assert!(args.contains(&"/dev/snd".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("snake"));
    }

    #[test]
    fn build_args_tag_the_image() {
        let args = build_args(Path::new("/tmp/devcade/Snake"), "snake");
        assert_eq!(args[0], "build");
        assert!(args.contains(&"--tag=snake".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/devcade/Snake"));
    }

    #[test]
    fn command_exists_finds_sh() {
        assert!(command_exists("sh"));
        assert!(!command_exists("arcade-onboard-definitely-missing"));
    }
}
