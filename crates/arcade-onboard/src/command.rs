use std::{path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

use crate::error::Result;

/// Runs `program` to completion, forwarding its stdout/stderr lines to tracing.
///
/// Returns the exit code; a signal-terminated child reports `-1`. Spawn failures
/// (missing binary, bad cwd) come back as `Io`.
pub async fn run(program: &str, args: &[String], cwd: Option<&Path>) -> Result<i32> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    tracing::debug!(program, args = %args.join(" "), "running command");
    let mut child = cmd.spawn()?;

    let mut pumps = Vec::new();
    if let Some(out) = child.stdout.take() {
        let program = program.to_string();
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(program = %program, stream = "stdout", "{line}");
            }
        }));
    }
    if let Some(err) = child.stderr.take() {
        let program = program.to_string();
        pumps.push(tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(program = %program, stream = "stderr", "{line}");
            }
        }));
    }

    let status = child.wait().await?;
    for p in pumps {
        let _ = p.await;
    }
    let code = status.code().unwrap_or(-1);
    if code == 0 {
        tracing::debug!(program, "command finished");
    } else {
        tracing::warn!(program, code, "command exited non-zero");
    }
    Ok(code)
}

/// Adds the owner execute bit, like `chmod u+x`.
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o100);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::metadata(path)?;
    }
    Ok(())
}
