//! Worker processes for multi-instance command lines.
//!
//! `hopgate -P 1080 -F http://a:3128 -- -P 1081 -F http://b:3128` runs one
//! child process per `--`-separated group. The first child to exit stops
//! the others, and its exit code becomes the supervisor's.
use std::{
    ffi::OsStr,
    process::Stdio,
    sync::{Arc, OnceLock},
};

use eyre::{Context, Result};
use tokio::{process::Command, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Environment variable carrying the worker index
pub const WORKER_ID_ENV: &str = "_HOPGATE_ID";

/// Exit code used when the first worker died without one (killed by a signal)
const SIGNALLED_EXIT_CODE: i32 = 1;

/// Split arguments on `--`; `None` when there is no separator.
pub fn split_worker_args(args: &[String]) -> Option<Vec<Vec<String>>> {
    if !args.iter().any(|arg| arg == "--") {
        return None;
    }
    Some(
        args.split(|arg| arg == "--")
            .map(|group| group.to_vec())
            .filter(|group| !group.is_empty())
            .collect(),
    )
}

/// Run one `program` child per group until the first one exits, or until
/// `shutdown` fires. Returns the exit code to use.
pub async fn supervise(
    program: impl AsRef<OsStr>,
    groups: Vec<Vec<String>>,
    shutdown: &CancellationToken,
) -> Result<i32> {
    let stop = shutdown.child_token();
    let first_exit = Arc::new(OnceLock::new());
    let mut workers = JoinSet::new();

    for (id, args) in groups.into_iter().enumerate() {
        let mut child = Command::new(program.as_ref())
            .args(&args)
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .wrap_err_with(|| format!("Failed to start worker {id}"))?;
        tracing::info!(worker = id, pid = ?child.id(), args = %args.join(" "), "worker started");

        let stop = stop.clone();
        let first_exit = first_exit.clone();
        workers.spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code().unwrap_or(SIGNALLED_EXIT_CODE),
                        Err(e) => {
                            tracing::error!(worker = id, "waiting for worker failed: {e}");
                            SIGNALLED_EXIT_CODE
                        }
                    };
                    tracing::info!(worker = id, code, "worker exited");
                    let _ = first_exit.set(code);
                    stop.cancel();
                }
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(worker = id, "failed to stop worker: {e}");
                    }
                    tracing::debug!(worker = id, "worker stopped");
                }
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!("worker task failed: {e}");
            stop.cancel();
        }
    }

    Ok(first_exit.get().copied().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn split_requires_separator() {
        assert_eq!(split_worker_args(&args("-P 1080 -F http://a:1")), None);
        assert_eq!(
            split_worker_args(&args("-P 1 -- -P 2 -D --")).unwrap(),
            vec![args("-P 1"), args("-P 2 -D")]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn first_exit_wins_and_stops_the_rest() {
        let started = Instant::now();
        let code = supervise(
            "/bin/sh",
            vec![
                vec!["-c".into(), "sleep 30".into()],
                vec!["-c".into(), "exit 3".into()],
            ],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn workers_see_their_id() {
        let code = supervise(
            "/bin/sh",
            vec![vec!["-c".into(), format!("exit $(( ${WORKER_ID_ENV} + 7 ))")]],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_stops_every_worker() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                supervise("/bin/sh", vec![vec!["-c".into(), "sleep 30".into()]], &shutdown).await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }
}
