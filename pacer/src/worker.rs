use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::TestResult,
    clock::Clock,
    outcome::{classify, ProbeValue},
    probe::Probe,
    publisher::ResultPublisher,
    token::TokenManager,
};

/// Everything a worker shares with its siblings.
#[derive(TypedBuilder)]
pub struct WorkerContext {
    pub probe: Arc<dyn Probe>,
    pub tokens: Arc<TokenManager>,
    pub publisher: Arc<ResultPublisher>,
    pub clock: Arc<dyn Clock>,
    #[builder(default)]
    pub think_time: Duration,
    #[builder(default)]
    pub open_workload: bool,
    /// Open workload only. Zero disables idle kills.
    #[builder(default)]
    pub idle_kill: Duration,
}

/// One logical concurrency slot: asks for permission, runs the probe, publishes, repeats.
pub struct Worker {
    name: String,
    context: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, context: Arc<WorkerContext>) -> Self {
        Self {
            name: format!("worker-{id}"),
            context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::debug!("{} started", self.name);
        let mut executions = 0u64;
        while self.can_execute(&cancel).await {
            self.execute_once().await;
            executions += 1;

            let think_time = self.context.think_time;
            if think_time.is_zero() {
                tokio::task::yield_now().await;
            } else if !self.context.clock.wait_for(think_time, &cancel).await {
                break;
            }
        }
        tracing::debug!("{} stopped after {executions} executions", self.name);
    }

    async fn can_execute(&self, cancel: &CancellationToken) -> bool {
        let context = &self.context;
        if !context.open_workload || context.idle_kill.is_zero() {
            return context.tokens.request_task_execution(cancel).await;
        }

        tokio::select! {
            biased;
            granted = context.tokens.request_task_execution(cancel) => granted,
            _ = context.clock.wait_for(context.idle_kill, cancel) => {
                tracing::debug!("{} idle for {:?}, exiting", self.name, context.idle_kill);
                false
            }
        }
    }

    async fn execute_once(&self) {
        let clock = &self.context.clock;
        let started = clock.now();
        let value = match AssertUnwindSafe(self.context.probe.execute())
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => ProbeValue::error(e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!("Probe panicked in {}: {message}", self.name);
                ProbeValue::Error(message)
            }
        };
        let measured = clock.now().saturating_duration_since(started);

        for outcome in classify(value, measured) {
            self.context.publisher.publish(TestResult {
                thread_name: self.name.clone(),
                passed: outcome.passed,
                result: outcome.result,
                duration: outcome.duration,
                finished_time: clock.wall_time(),
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "probe panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio::time::Instant;

    use super::*;
    use crate::{
        clock::TokioClock,
        config::ThroughputConfig,
        error::ProbeError,
        listener::{ListenerError, ResultListener},
        rate::Phase,
    };

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Probe for Counting {
        async fn execute(&self) -> Result<ProbeValue, ProbeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(true.into())
        }
    }

    struct Flaky;

    #[async_trait]
    impl Probe for Flaky {
        async fn execute(&self) -> Result<ProbeValue, ProbeError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err("503 Service Unavailable".into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Probe for Panicking {
        async fn execute(&self) -> Result<ProbeValue, ProbeError> {
            panic!("boom")
        }
    }

    #[derive(Default)]
    struct Capture(parking_lot::Mutex<Vec<TestResult>>);

    #[async_trait]
    impl ResultListener for Capture {
        async fn on_results(
            &self,
            batch: &[TestResult],
            _: &CancellationToken,
        ) -> Result<(), ListenerError> {
            self.0.lock().extend_from_slice(batch);
            Ok(())
        }
    }

    fn context(
        probe: Arc<dyn Probe>,
        throughput: ThroughputConfig,
        open_workload: bool,
    ) -> Arc<WorkerContext> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let tokens = Arc::new(TokenManager::new(throughput, clock.clone()));
        let start = Instant::now();
        tokens.initialise(start, Some(start + Duration::from_secs(60)));
        Arc::new(
            WorkerContext::builder()
                .probe(probe)
                .tokens(tokens)
                .publisher(Arc::new(ResultPublisher::new(
                    Duration::from_millis(100),
                    1000,
                    clock.clone(),
                )))
                .clock(clock)
                .open_workload(open_workload)
                .idle_kill(Duration::from_secs(1))
                .build(),
        )
    }

    async fn published(context: &WorkerContext) -> Vec<TestResult> {
        let capture = Arc::new(Capture::default());
        context.publisher.subscribe(capture.clone());
        context.publisher.test_completed();
        context.publisher.process(&CancellationToken::new()).await;
        let results = capture.0.lock().clone();
        results
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_dies_without_executing() {
        let probe = Arc::new(Counting::default());
        // regulated, but no token is ever released
        let throughput = ThroughputConfig::builder()
            .phases(vec![Phase::flat(Duration::from_secs(60), 1.0)])
            .build();
        let context = context(probe.clone(), throughput, true);

        let worker = tokio::spawn(Worker::new(0, context.clone()).run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(worker.is_finished());
        assert_eq!(probe.0.load(Ordering::SeqCst), 0);
        assert!(published(&context).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_become_failed_results() {
        let context = context(
            Arc::new(Flaky),
            ThroughputConfig::builder().iterations(2).build(),
            false,
        );

        Worker::new(3, context.clone())
            .run(CancellationToken::new())
            .await;

        let results = published(&context).await;
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(!result.passed);
            assert_eq!(result.thread_name, "worker-3");
            assert_eq!(result.result, "503 Service Unavailable");
            assert_eq!(result.duration, Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_contained() {
        let context = context(
            Arc::new(Panicking),
            ThroughputConfig::builder().iterations(1).build(),
            false,
        );

        Worker::new(0, context.clone())
            .run(CancellationToken::new())
            .await;

        let results = published(&context).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert_eq!(results[0].result, "boom");
    }

    #[derive(Debug)]
    struct Frozen(DateTime<Utc>);

    #[async_trait]
    impl Clock for Frozen {
        fn now(&self) -> Instant {
            Instant::now()
        }

        async fn wait_for(&self, duration: Duration, cancel: &CancellationToken) -> bool {
            TokioClock.wait_for(duration, cancel).await
        }

        fn wall_time(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finished_time_comes_from_the_clock() {
        let stamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(Frozen(stamp));
        let tokens = Arc::new(TokenManager::new(
            ThroughputConfig::builder().iterations(2).build(),
            clock.clone(),
        ));
        tokens.initialise(Instant::now(), None);
        let context = Arc::new(
            WorkerContext::builder()
                .probe(Arc::new(Counting::default()))
                .tokens(tokens)
                .publisher(Arc::new(ResultPublisher::new(
                    Duration::from_millis(100),
                    1000,
                    clock.clone(),
                )))
                .clock(clock)
                .build(),
        );

        Worker::new(0, context.clone())
            .run(CancellationToken::new())
            .await;

        let results = published(&context).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.finished_time == stamp));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_think_time_stops_the_worker() {
        let probe = Arc::new(Counting::default());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let tokens = Arc::new(TokenManager::new(ThroughputConfig::default(), clock.clone()));
        tokens.initialise(Instant::now(), None);
        let context = Arc::new(
            WorkerContext::builder()
                .probe(probe.clone())
                .tokens(tokens)
                .publisher(Arc::new(ResultPublisher::new(
                    Duration::from_millis(100),
                    1000,
                    clock.clone(),
                )))
                .clock(clock)
                .think_time(Duration::from_secs(10))
                .build(),
        );
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(Worker::new(0, context).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(probe.0.load(Ordering::SeqCst), 1);
    }
}
