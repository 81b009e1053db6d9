use std::future::Future;

use rand::Rng;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::NetworkError;
use crate::Result;

/// Runs `task` until it succeeds, bounding every attempt by `policy.timeout_ms`.
///
/// Failed attempts are retried `policy.max_retries` times with exponential
/// backoff plus a small jitter. The error of the last attempt is returned.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let mut attempt: u32 = 0;
    loop {
        let last_error = match timeout(policy.timeout(), task()).await {
            Ok(Ok(r)) => return Ok(r),
            Ok(Err(e)) => {
                warn!("attempt {} failed with error: {:?}", attempt, &e);
                e
            }
            Err(_) => {
                warn!("attempt {} timed out after {}ms", attempt, policy.timeout_ms);
                NetworkError::AttemptTimeout(policy.timeout_ms).into()
            }
        };

        attempt += 1;
        if attempt > policy.max_retries {
            warn!("task failed after {} retries", policy.max_retries);
            return Err(last_error);
        }
        sleep(jittered(policy, attempt)).await;
    }
}

/// Backoff delay of `attempt` with up to 20% random jitter.
pub(crate) fn jittered(
    policy: BackoffPolicy,
    attempt: u32,
) -> std::time::Duration {
    let delay = policy.delay(attempt);
    let spread = (delay.as_micros() as u64) / 5;
    if spread == 0 {
        return delay;
    }
    delay + std::time::Duration::from_micros(rand::thread_rng().gen_range(0..spread))
}

// Helper function to spawn tasks and track their JoinHandles
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<tokio::task::JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
