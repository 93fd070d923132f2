use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{clock::Clock, marshall::ThreadMarshall, report::RunOutcome, token::TokenManager};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Draining,
    Done,
}

/// The scheduling loop.
///
/// Every `check_interval` it releases the tokens owed since the previous tick and resizes
/// the worker pool. It stops at the end of the run window, when the iteration budget is
/// spent, or on cancellation, and then drains the workers.
#[derive(TypedBuilder)]
pub struct TestRunner {
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenManager>,
    marshall: Arc<ThreadMarshall>,
    test_duration: Duration,
    #[builder(default)]
    iterations: u64,
    #[builder(default = Duration::from_millis(100))]
    check_interval: Duration,
    #[builder(default = Duration::from_secs(10))]
    shutdown_timeout: Duration,
    #[builder(default, setter(skip))]
    state: Mutex<RunState>,
}

impl TestRunner {
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Runs one test window. Returns `Cancelled` if `cancel` fired before the window ended.
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        self.set_state(RunState::Running);
        let start = self.clock.now();
        let end = if self.test_duration.is_zero() && self.iterations > 0 {
            None
        } else {
            Some(start + self.test_duration)
        };
        self.tokens.initialise(start, end);
        tracing::info!(
            "Scheduling loop started: duration {:?}, iterations {}",
            self.test_duration,
            self.iterations
        );

        let workers = cancel.child_token();
        let mut now = start;
        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            if matches!(end, Some(end) if now >= end) || self.tokens.is_exhausted() {
                break RunOutcome::Completed;
            }

            let released = self.tokens.release_tokens(now);
            let spawned = self.marshall.adjust_thread_levels(start, now, &workers);
            tracing::debug!("Tick: released {released} tokens, spawned {spawned} workers");

            if !self.clock.wait_for(self.check_interval, cancel).await {
                break RunOutcome::Cancelled;
            }
            now = self.clock.now();
        };

        self.set_state(RunState::Draining);
        tracing::info!("Draining workers...");
        let aborted = self.marshall.shutdown(&workers, self.shutdown_timeout).await;
        if aborted > 0 {
            tracing::warn!("Aborted {aborted} workers that outlived the shutdown timeout");
        }
        self.set_state(RunState::Done);
        tracing::info!("Scheduling loop finished: {outcome:?}");
        outcome
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        clock::TokioClock,
        config::{ConcurrencyConfig, ThroughputConfig},
        error::ProbeError,
        outcome::ProbeValue,
        probe::Probe,
        publisher::ResultPublisher,
        worker::WorkerContext,
    };

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Probe for Counting {
        async fn execute(&self) -> Result<ProbeValue, ProbeError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true.into())
        }
    }

    fn runner(
        probe: Arc<Counting>,
        throughput: ThroughputConfig,
        test_duration: Duration,
    ) -> TestRunner {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let iterations = throughput.iterations;
        let tokens = Arc::new(TokenManager::new(throughput, clock.clone()));
        let context = WorkerContext::builder()
            .probe(probe)
            .tokens(tokens.clone())
            .publisher(Arc::new(ResultPublisher::new(
                Duration::from_millis(100),
                1000,
                clock.clone(),
            )))
            .clock(clock.clone())
            .build();
        let marshall = ThreadMarshall::new(
            ConcurrencyConfig::builder().threads(2).build(),
            Arc::new(context),
        );
        TestRunner::builder()
            .clock(clock)
            .tokens(tokens)
            .marshall(Arc::new(marshall))
            .test_duration(test_duration)
            .iterations(iterations)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_the_window_closes() {
        let probe = Arc::new(Counting::default());
        let runner = runner(
            probe.clone(),
            ThroughputConfig::builder().tps(20.0).build(),
            Duration::from_secs(2),
        );
        assert_eq!(runner.state(), RunState::Idle);

        let outcome = runner.run(&CancellationToken::new()).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(runner.state(), RunState::Done);
        // 2s at 20/s, released in whole tokens per tick
        let executed = probe.0.load(Ordering::SeqCst);
        assert!((38..=40).contains(&executed), "executed {executed}");
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_budget_ends_an_unbounded_run() {
        let probe = Arc::new(Counting::default());
        let runner = runner(
            probe.clone(),
            ThroughputConfig::builder().iterations(7).build(),
            Duration::ZERO,
        );

        let outcome = runner.run(&CancellationToken::new()).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(probe.0.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let probe = Arc::new(Counting::default());
        let runner = Arc::new(runner(
            probe,
            ThroughputConfig::default(),
            Duration::from_secs(3600),
        ));
        let cancel = CancellationToken::new();

        let run = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(run.await.unwrap(), RunOutcome::Cancelled);
        assert_eq!(runner.state(), RunState::Done);
    }
}
