//! Fixed-interval status polling.
//!
//! External systems (cloud APIs, cluster resource stores) never push state
//! changes, so every wait in the engine is a bounded poll: sample, sleep,
//! sample again, until the observed status differs from the one we started
//! from or the deadline passes.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Reference sampling interval for external status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Interval and deadline for one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    /// A wait with the reference interval and the given deadline.
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why a wait ended without observing a new status.
#[derive(Debug, Error)]
pub enum PollError<S: Debug, E> {
    /// The deadline passed while the status stayed put.
    #[error("status still {last:?} after {elapsed:?}")]
    Timeout { elapsed: Duration, last: S },

    /// The status check itself failed.
    #[error(transparent)]
    Remote(E),
}

impl<S: Debug, E> PollError<S, E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Polls `sample` every `config.interval` until it reports something other
/// than `initial`, returning that new status.
///
/// The first sample is taken after one interval. A sampling error ends the
/// wait immediately; it is not retried.
pub async fn wait_for_status_change<S, E, F, Fut>(
    initial: &S,
    config: &PollConfig,
    mut sample: F,
) -> Result<S, PollError<S, E>>
where
    S: PartialEq + Clone + Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
{
    let started = Instant::now();
    let mut last = initial.clone();

    while last == *initial {
        let elapsed = started.elapsed();
        if elapsed >= config.timeout {
            return Err(PollError::Timeout { elapsed, last });
        }
        tokio::time::sleep(config.interval).await;
        last = sample().await.map_err(PollError::Remote)?;
        tracing::trace!(status = ?last, "Polled status");
    }

    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_different_status() {
        let calls = &AtomicU32::new(0);
        let config = PollConfig::with_timeout(Duration::from_secs(60));

        let status = wait_for_status_change(&"creating", &config, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(if n < 2 { "creating" } else { "unmounted" })
        })
        .await
        .unwrap();

        assert_eq!(status, "unmounted");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinct_from_remote_error() {
        let config = PollConfig::new(Duration::from_secs(3), Duration::from_secs(10));

        let err = wait_for_status_change(&"starting", &config, || async {
            Ok::<_, String>("starting")
        })
        .await
        .unwrap_err();

        match err {
            PollError::Timeout { elapsed, last } => {
                assert!(elapsed >= Duration::from_secs(10));
                assert_eq!(last, "starting");
            }
            PollError::Remote(e) => panic!("unexpected remote error {e}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_stops_wait() {
        let config = PollConfig::with_timeout(Duration::from_secs(60));

        let err = wait_for_status_change(&1u8, &config, || async {
            Err::<u8, _>("api down")
        })
        .await
        .unwrap_err();

        assert!(!err.is_timeout());
        assert!(matches!(err, PollError::Remote("api down")));
    }
}
