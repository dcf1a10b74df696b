//! Retry helpers wrapping fallible async operations with exponential
//! backoff. Used by every outbound RPC call and by DB operations that must
//! not lose updates. Every retry loop watches the shutdown token and
//! returns `Cancelled` as soon as it fires.

use std::future::Future;
use std::time::{Duration, Instant};

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::IndexerError;

/// Backoff policy: the delay starts at `initial_interval`, doubles up to
/// `max_interval`, and every sleep is jittered into `[0.5, 1.5)` of the
/// nominal delay. `max_elapsed_time` of `None` retries indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(5 * 60)),
        }
    }
}

impl Backoff {
    pub fn unbounded(self) -> Self {
        Self {
            max_elapsed_time: None,
            ..self
        }
    }
}

/// Retries `op` on transient errors only; permanent errors surface
/// immediately to the caller.
pub async fn retry<T, F, Fut>(
    policy: Backoff,
    shutdown: &CancellationToken,
    name: &str,
    op: F,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    retry_inner(policy, shutdown, name, IndexerError::is_transient, op).await
}

/// Driver-level retry: retries everything except fatal errors and
/// cancellation, so a run that loses the RPC node for an extended period
/// resumes rather than exits.
pub async fn retry_any<T, F, Fut>(
    policy: Backoff,
    shutdown: &CancellationToken,
    name: &str,
    op: F,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    retry_inner(policy, shutdown, name, |err| !err.is_fatal(), op).await
}

async fn retry_inner<T, F, Fut>(
    policy: Backoff,
    shutdown: &CancellationToken,
    name: &str,
    should_retry: impl Fn(&IndexerError) -> bool,
    mut op: F,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    let started = Instant::now();
    let mut delay = policy.initial_interval;

    loop {
        if shutdown.is_cancelled() {
            return Err(IndexerError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }

        let sleep_for = jittered(delay);
        if let Some(limit) = policy.max_elapsed_time {
            if started.elapsed() + sleep_for >= limit {
                return Err(err);
            }
        }

        debug!("{name} error: {err} - retrying after {sleep_for:?}");
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.cancelled() => return Err(IndexerError::Cancelled),
        }
        delay = (delay * 2).min(policy.max_interval);
    }
}

fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(0.5 + rand::random::<f64>())
}
