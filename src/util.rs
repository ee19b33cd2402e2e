//! Helpers for running blocking work and external commands off the async
//! executor.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Runs `f` on the blocking pool. Async store access
/// ([`Store::transact`](crate::store::Store::transact),
/// [`Store::query`](crate::store::Store::query)) and git2 calls go through
/// here.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Like [`blocking`], but gives up after `duration`. The closure keeps
/// running to completion on its thread; only the caller stops waiting.
pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Runs an external command to completion, killing it if `limit` expires.
pub async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
    limit: Duration,
) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    match timeout(limit, cmd.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(Error::Timeout(limit)),
    }
}
