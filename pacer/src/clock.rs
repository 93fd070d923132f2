use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Source of "now" and of cancellable sleeps for every timing decision in a run.
///
/// The scheduling loop, token manager, workers and drain loops never call the runtime
/// directly; they go through a `Clock` so a test can substitute its own notion of time.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;

    /// Calendar time stamped on published results.
    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Suspends for `duration`. Returns `false` if `cancel` fired first.
    async fn wait_for(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// [`Clock`] backed by the tokio timer. Honours `tokio::time::pause`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn wait_for(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_runs_to_completion() {
        let clock = TokioClock;
        let before = clock.now();

        assert!(clock.wait_for(Duration::from_secs(3), &CancellationToken::new()).await);
        assert_eq!(clock.now() - before, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_returns_early() {
        let clock = TokioClock;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!clock.wait_for(Duration::from_secs(60), &cancel).await);
    }
}
