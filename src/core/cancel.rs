use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::core::error::{ForwardError, ForwardResult};

/// Run `fut` until it completes, `cancel` fires or `timeout` elapses.
///
/// Dropping the inner future on cancellation drops whatever it holds, which
/// is how limiter permits acquired inside it are released.
pub async fn bounded<F, T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    fut: F,
) -> ForwardResult<T>
where
    F: Future<Output = ForwardResult<T>>,
{
    let guarded = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ForwardError::Cancelled),
            res = fut => res,
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .unwrap_or(Err(ForwardError::Timeout(limit))),
        None => guarded.await,
    }
}
