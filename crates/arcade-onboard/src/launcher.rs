//! Launch strategies for unpacked games.
//!
//! Both strategies hand back a [`GameHandle`] that owns nothing but shared exit state; the
//! child itself is owned by a wait task that records the exit code when it finishes.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    time::Duration,
};

use arcade_types::Game;
use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Notify,
};

use crate::command;
use crate::config::SandboxConfig;
use crate::error::{OnboardError, Result};
use crate::layout;
use crate::sandbox;

/// Sentinel stored while no exit code is known (signal death reports none).
const NO_CODE: i32 = i32::MIN;

/// Exit codes a container runtime uses for its own failures (bad run, not executable,
/// not found) rather than the game's.
const TOOL_FAILURE_CODES: std::ops::RangeInclusive<i32> = 125..=127;

pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build step run before `start`. Returns `true` when an image was produced.
    fn prepare<'a>(&'a self, _game: &'a Game, _game_dir: &'a Path) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    fn start<'a>(&'a self, game: &'a Game, game_dir: &'a Path) -> BoxFuture<'a, Result<GameHandle>>;
}

#[derive(Default)]
struct ExitState {
    exited: AtomicBool,
    code: AtomicI32,
    notify: Notify,
}

impl ExitState {
    fn finish(&self, code: Option<i32>) {
        self.code.store(code.unwrap_or(NO_CODE), Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn code(&self) -> Option<i32> {
        match self.code.load(Ordering::SeqCst) {
            NO_CODE => None,
            v => Some(v),
        }
    }
}

/// Extra teardown for handles that need more than a process-group signal.
#[derive(Debug, Clone)]
struct StopCommand {
    program: String,
    args: Vec<String>,
}

#[derive(Clone)]
pub struct GameHandle {
    game: String,
    pid: Option<u32>,
    pgid: Option<i32>,
    state: Arc<ExitState>,
    stop: Option<StopCommand>,
    /// Container runtime wrapping the game, if any.
    tool: Option<String>,
}

impl std::fmt::Debug for GameHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameHandle")
            .field("game", &self.game)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl GameHandle {
    pub fn game(&self) -> &str {
        &self.game
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.state.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn same_process(&self, other: &GameHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn exit_code(&self) -> Option<i32> {
        if self.has_exited() {
            self.state.code()
        } else {
            None
        }
    }

    /// Set when the wrapping container runtime, not the game, ended the run.
    pub fn launch_failure(&self) -> Option<String> {
        let tool = self.tool.as_ref()?;
        let code = self.exit_code()?;
        TOOL_FAILURE_CODES
            .contains(&code)
            .then(|| format!("{tool} run failed with exit code {code}"))
    }

    /// Resolves once the child has exited.
    pub async fn wait(&self) -> Option<i32> {
        loop {
            let notified = self.state.notify.notified();
            if self.has_exited() {
                return self.state.code();
            }
            notified.await;
        }
    }

    /// SIGTERM to the process group, SIGKILL after `grace`. No-op once exited.
    pub async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        if let Some(stop) = &self.stop {
            match command::run(&stop.program, &stop.args, None).await {
                Ok(0) => {}
                Ok(code) => tracing::warn!(game = %self.game, code, "container stop returned non-zero"),
                Err(e) => tracing::warn!(game = %self.game, error = %e, "container stop failed"),
            }
        }

        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid
                && !self.has_exited()
            {
                unsafe {
                    libc::kill(-pgid, libc::SIGTERM);
                }
                tracing::debug!(game = %self.game, pgid, "sent SIGTERM");
            }
        }

        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid {
                unsafe {
                    libc::kill(-pgid, libc::SIGKILL);
                }
                tracing::warn!(game = %self.game, pgid, "sent SIGKILL (grace expired)");
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.wait()).await;
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Games must not outlive the control plane.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Spawns `cmd` in its own process group and starts the output pumps and wait task.
fn spawn_supervised(game: &str, mut cmd: Command, stop: Option<StopCommand>) -> Result<GameHandle> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| OnboardError::Launch(format!("spawn {game}: {e}")))?;
    let pid = child.id();
    let pgid = pid.map(|p| p as i32);

    if let Some(out) = child.stdout.take() {
        let game = game.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(game = %game, stream = "stdout", "{line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let game = game.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(game = %game, stream = "stderr", "{line}");
            }
        });
    }

    let state = Arc::new(ExitState {
        code: AtomicI32::new(NO_CODE),
        ..ExitState::default()
    });
    {
        let state = state.clone();
        let game = game.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!(game = %game, error = %e, "failed to wait for game");
                    None
                }
            };
            tracing::info!(game = %game, exit_code = ?code, "game exited");
            state.finish(code);
        });
    }

    Ok(GameHandle {
        game: game.to_string(),
        pid,
        pgid,
        state,
        stop,
        tool: None,
    })
}

/// Runs `{game_dir}/publish/{name}` as a host process.
#[derive(Debug, Default, Clone)]
pub struct DirectLauncher;

impl DirectLauncher {
    pub fn executable(game: &Game, game_dir: &Path) -> PathBuf {
        game_dir.join("publish").join(&game.name)
    }
}

impl Launcher for DirectLauncher {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn start<'a>(&'a self, game: &'a Game, game_dir: &'a Path) -> BoxFuture<'a, Result<GameHandle>> {
        Box::pin(async move {
            let exe = Self::executable(game, game_dir);
            if !exe.is_file() {
                return Err(OnboardError::Launch(format!(
                    "missing executable {}",
                    exe.display()
                )));
            }
            command::make_executable(&exe)
                .map_err(|e| OnboardError::Launch(format!("chmod {}: {e}", exe.display())))?;

            let mut cmd = Command::new(&exe);
            if let Some(dir) = exe.parent() {
                cmd.current_dir(dir);
            }
            tracing::info!(game = %game.name, exe = %exe.display(), "launching game");
            spawn_supervised(&game.name, cmd, None)
        })
    }
}

/// Builds a per-game image with podman/docker and runs it with display passthrough.
#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    config: SandboxConfig,
}

impl SandboxLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

impl Launcher for SandboxLauncher {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn prepare<'a>(&'a self, game: &'a Game, game_dir: &'a Path) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let tool = &self.config.tool;
            if !sandbox::command_exists(tool) {
                return Err(OnboardError::ContainerBuild(format!(
                    "{tool} not found in PATH"
                )));
            }
            if !DirectLauncher::executable(game, game_dir).is_file() {
                return Err(OnboardError::ContainerBuild(format!(
                    "missing executable publish/{}",
                    game.name
                )));
            }

            sandbox::write_containerfile(game_dir, &self.config.base_image, &game.name)?;
            let tag = sandbox::image_tag(&game.name);
            tracing::info!(game = %game.name, tag = %tag, tool = %tool, "building game image");

            let code = command::run(tool, &sandbox::build_args(game_dir, &tag), Some(game_dir))
                .await
                .map_err(|e| OnboardError::ContainerBuild(format!("{tool} build: {e}")))?;
            if code != 0 {
                return Err(OnboardError::ContainerBuild(format!(
                    "{tool} build exited with {code}"
                )));
            }
            layout::write_atomic(&game_dir.join(sandbox::IMAGE_TAG_FILE), tag.as_bytes())?;
            Ok(true)
        })
    }

    fn start<'a>(&'a self, game: &'a Game, _game_dir: &'a Path) -> BoxFuture<'a, Result<GameHandle>> {
        Box::pin(async move {
            let tool = &self.config.tool;
            let tag = sandbox::image_tag(&game.name);
            let name = sandbox::container_name(&game.name);

            // A previous run may have left a container with the same name behind.
            let rm = ["rm".to_string(), "-f".to_string(), name.clone()];
            match command::run(tool, &rm, None).await {
                Ok(code) => tracing::debug!(container = %name, code, "removed stale container"),
                Err(e) => tracing::debug!(container = %name, error = %e, "stale container removal failed"),
            }

            let mut cmd = Command::new(tool);
            cmd.args(sandbox::run_args(&tag, &name, &sandbox::Passthrough::from_env()));
            tracing::info!(game = %game.name, container = %name, "launching game container");
            let mut handle = spawn_supervised(
                &game.name,
                cmd,
                Some(StopCommand {
                    program: tool.clone(),
                    args: sandbox::kill_args(&name),
                }),
            )?;
            handle.tool = Some(tool.clone());
            Ok(handle)
        })
    }
}
