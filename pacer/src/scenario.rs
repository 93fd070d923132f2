use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregator,
    clock::{Clock, TokioClock},
    condition::ExitConditionEvaluator,
    config::TestConfig,
    error::{Error, Result},
    exit::ExitSignal,
    listener::{AggregateListener, ResultListener},
    marshall::ThreadMarshall,
    probe::Probe,
    publisher::ResultPublisher,
    report::{RunOutcome, RunReport},
    runner::TestRunner,
    token::TokenManager,
    worker::WorkerContext,
};

/// Glue that ties a probe, its configuration and the output listeners into one run.
///
/// ```rust,no_run
/// use std::{sync::Arc, time::Duration};
/// use pacer::{config::{ConcurrencyConfig, TestConfig}, probe_fn, Scenario};
///
/// # async fn run() -> pacer::Result<()> {
/// let report = Scenario::builder()
///     .name("ping")
///     .probe(Arc::new(probe_fn(|| async { true })))
///     .config(
///         TestConfig::builder()
///             .concurrency(ConcurrencyConfig::builder().threads(4).hold_for(Duration::from_secs(10)).build())
///             .build(),
///     )
///     .build()
///     .run()
///     .await?;
///
/// std::process::exit(report.outcome.exit_code());
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub probe: Arc<dyn Probe>,
    #[builder(default)]
    pub config: TestConfig,
    #[builder(default)]
    pub result_listeners: Vec<Arc<dyn ResultListener>>,
    #[builder(default)]
    pub aggregate_listeners: Vec<Arc<dyn AggregateListener>>,
    #[builder(default = Arc::new(TokioClock))]
    pub clock: Arc<dyn Clock>,
    /// Cancelling this stops admitting new work; buffered results are still delivered.
    #[builder(default)]
    pub cancel: CancellationToken,
    /// Fired by exit conditions, or by the host to end the run early with a verdict.
    /// Once fired it stays fired, so a scenario run twice needs a fresh signal.
    #[builder(default = Arc::new(ExitSignal::new()))]
    pub exit_signal: Arc<ExitSignal>,
}

impl Scenario {
    pub async fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        config.validate()?;
        tracing::info!("Running scenario: {}", self.name);

        self.probe.setup().await.map_err(Error::Setup)?;
        let started = self.clock.now();

        let engine = &config.engine;
        let publisher = Arc::new(ResultPublisher::new(
            engine.result_publishing_interval,
            engine.result_batch_size,
            self.clock.clone(),
        ));
        let aggregator = Arc::new(Aggregator::new(
            engine.aggregation_interval,
            self.clock.clone(),
        ));
        publisher.subscribe(aggregator.clone());
        for listener in &self.result_listeners {
            publisher.subscribe(listener.clone());
        }
        if !config.exit_conditions.is_empty() {
            aggregator.subscribe(Arc::new(ExitConditionEvaluator::new(
                config.exit_conditions.clone(),
                engine.aggregation_interval,
                self.exit_signal.clone(),
            )));
        }
        for listener in &self.aggregate_listeners {
            aggregator.subscribe(listener.clone());
        }

        let tokens = Arc::new(TokenManager::new(
            config.throughput.clone(),
            self.clock.clone(),
        ));
        let context = WorkerContext::builder()
            .probe(self.probe.clone())
            .tokens(tokens.clone())
            .publisher(publisher.clone())
            .clock(self.clock.clone())
            .think_time(config.throughput.think_time)
            .open_workload(config.concurrency.open_workload)
            .idle_kill(config.concurrency.thread_idle_kill_time)
            .build();
        let marshall = ThreadMarshall::new(config.concurrency.clone(), Arc::new(context));
        let runner = TestRunner::builder()
            .clock(self.clock.clone())
            .tokens(tokens)
            .marshall(Arc::new(marshall))
            .test_duration(config.test_duration())
            .iterations(config.throughput.iterations)
            .check_interval(engine.check_interval)
            .shutdown_timeout(engine.shutdown_timeout)
            .build();

        // never cancelled: the pipeline stops on test_completed, after the workers are gone
        let pipeline = CancellationToken::new();
        let publishing = tokio::spawn({
            let publisher = publisher.clone();
            let pipeline = pipeline.clone();
            async move { publisher.process(&pipeline).await }
        });
        let aggregating = tokio::spawn({
            let aggregator = aggregator.clone();
            let pipeline = pipeline.clone();
            async move { aggregator.process(&pipeline).await }
        });

        let run = self.cancel.child_token();
        let watcher = tokio::spawn({
            let signal = self.exit_signal.clone();
            let run = run.clone();
            async move {
                signal.wait().await;
                run.cancel();
            }
        });

        let outcome = runner.run(&run).await;
        watcher.abort();

        tracing::info!("Flushing results...");
        publisher.test_completed();
        let published = publishing.await;
        aggregator.test_completed();
        let aggregated = aggregating.await;

        if let Err(e) = self.probe.teardown().await {
            tracing::warn!("Probe teardown failed: {e}");
        }
        published.map_err(|source| Error::Task {
            task: "result publisher",
            source,
        })?;
        aggregated.map_err(|source| Error::Task {
            task: "aggregator",
            source,
        })?;

        let outcome = match self.exit_signal.reason() {
            Some(reason) => RunOutcome::ExitConditionMet(reason),
            None => outcome,
        };
        let report = RunReport {
            name: self.name.clone(),
            outcome,
            elapsed: self.clock.now().saturating_duration_since(started),
            summary: aggregator.last_snapshot(),
        };
        tracing::info!("Done running scenario: {report}");
        Ok(report)
    }
}
