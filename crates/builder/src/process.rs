//! Blocking execution of the external build tool.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::info;

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, stream: &'static str) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "kiln_builder::jib", stream, "{}", line);
    }
}

/// Run `program` in `cwd` with the inherited environment plus `envs`,
/// forwarding its output to tracing. The overrides apply to the child only.
/// The child is killed if this future is dropped, so a caller deadline or
/// shutdown never leaks it.
pub async fn run_and_log<K, V>(program: &str, args: &[String], cwd: &Path, envs: &[(K, V)]) -> Result<()>
where
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} in {}", program, cwd.display()))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, _, _) = tokio::join!(child.wait(), pump(stdout, "stdout"), pump(stderr, "stderr"));
    let status = status.with_context(|| format!("waiting for {}", program))?;
    if !status.success() {
        bail!("{} exited with {}", program, status);
    }
    Ok(())
}
