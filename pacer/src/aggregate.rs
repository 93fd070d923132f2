//! Periodic summaries of raw results.
//!
//! The [`Aggregator`] is itself a [`ResultListener`]: the result publisher hands it batches,
//! which it only buffers. Its own [`Aggregator::process`] loop wakes once per aggregation
//! interval, folds everything buffered into running statistics and emits one
//! [`AggregatedResult`] to every [`AggregateListener`]. Ticks without new results emit
//! nothing.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    listener::{same_listener, AggregateListener, ListenerError, ResultListener},
};

/// Smoothing cap of the moving average: weight is `1 / min(count, FACTOR)`.
const FACTOR: u64 = 4;
/// Upper bound of results folded into a single snapshot.
const DRAIN_CAP: usize = 100_000;

/// Outcome of one probe execution, as published by a worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub thread_name: String,
    pub passed: bool,
    pub result: String,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub finished_time: DateTime<Utc>,
}

/// Snapshot emitted once per aggregation tick that saw results.
///
/// `min`, `max`, `moving_average`, `mean`, `variance`, `standard_deviation` and the plain
/// success/error counts cover the whole run so far; `period_*` fields cover only the
/// results folded in this tick. Averages and spreads are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub count: u64,
    #[serde(serialize_with = "as_millis")]
    pub min: Duration,
    #[serde(serialize_with = "as_millis")]
    pub max: Duration,
    pub moving_average: f64,
    #[serde(serialize_with = "as_millis")]
    pub period_min: Duration,
    #[serde(serialize_with = "as_millis")]
    pub period_max: Duration,
    pub period_average: f64,
    #[serde(serialize_with = "as_millis")]
    pub period_length: Duration,
    pub period_success_count: u64,
    pub period_error_count: u64,
    pub mean: f64,
    pub variance: f64,
    pub standard_deviation: f64,
    pub success_count: u64,
    pub error_count: u64,
}

impl AggregatedResult {
    /// Looks a field up by name, as written in exit conditions.
    ///
    /// Matching ignores case and underscores, so `PeriodErrorCount`, `periodErrorCount` and
    /// `period_error_count` are the same property. Durations are read in milliseconds.
    pub fn property(&self, name: &str) -> Option<f64> {
        let key: String = name
            .chars()
            .filter(|c| *c != '_' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        let value = match key.as_str() {
            "count" => self.count as f64,
            "min" => millis(self.min),
            "max" => millis(self.max),
            "movingaverage" => self.moving_average,
            "periodmin" => millis(self.period_min),
            "periodmax" => millis(self.period_max),
            "periodaverage" => self.period_average,
            "periodlength" => millis(self.period_length),
            "periodsuccesscount" => self.period_success_count as f64,
            "perioderrorcount" => self.period_error_count as f64,
            "mean" => self.mean,
            "variance" => self.variance,
            "standarddeviation" => self.standard_deviation,
            "successcount" => self.success_count as f64,
            "errorcount" => self.error_count as f64,
            _ => return None,
        };
        Some(value)
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(millis(*duration))
}

/// Cumulative state carried from tick to tick.
#[derive(Debug, Default)]
struct RunningStats {
    count: u64,
    min: Option<Duration>,
    max: Option<Duration>,
    moving_average: f64,
    // Welford
    mean: f64,
    m2: f64,
    success_count: u64,
    error_count: u64,
}

impl RunningStats {
    fn fold(&mut self, batch: &[TestResult], period_length: Duration) -> AggregatedResult {
        let mut period_min = Duration::MAX;
        let mut period_max = Duration::ZERO;
        let mut period_total = 0.0;
        let mut period_success_count = 0;

        for result in batch {
            let sample = millis(result.duration);
            self.count += 1;

            let alpha = 1.0 / self.count.min(FACTOR) as f64;
            self.moving_average += alpha * (sample - self.moving_average);

            let delta = sample - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (sample - self.mean);

            self.min = Some(self.min.map_or(result.duration, |min| min.min(result.duration)));
            self.max = Some(self.max.map_or(result.duration, |max| max.max(result.duration)));
            period_min = period_min.min(result.duration);
            period_max = period_max.max(result.duration);
            period_total += sample;

            if result.passed {
                period_success_count += 1;
            }
        }

        let period_error_count = batch.len() as u64 - period_success_count;
        self.success_count += period_success_count;
        self.error_count += period_error_count;

        // sample variance, zero until there are two samples
        let variance = if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        };

        AggregatedResult {
            count: self.count,
            min: self.min.unwrap_or_default(),
            max: self.max.unwrap_or_default(),
            moving_average: self.moving_average,
            period_min: if batch.is_empty() { Duration::ZERO } else { period_min },
            period_max,
            period_average: if batch.is_empty() {
                0.0
            } else {
                period_total / batch.len() as f64
            },
            period_length,
            period_success_count,
            period_error_count,
            mean: self.mean,
            variance,
            standard_deviation: variance.sqrt(),
            success_count: self.success_count,
            error_count: self.error_count,
        }
    }
}

pub struct Aggregator {
    clock: Arc<dyn Clock>,
    interval: Duration,
    tx: Sender<TestResult>,
    rx: Receiver<TestResult>,
    listeners: RwLock<Vec<Arc<dyn AggregateListener>>>,
    stats: Mutex<RunningStats>,
    last_snapshot: Mutex<Option<AggregatedResult>>,
    completed: CancellationToken,
}

impl Aggregator {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            clock,
            interval,
            tx,
            rx,
            listeners: RwLock::new(Vec::new()),
            stats: Mutex::new(RunningStats::default()),
            last_snapshot: Mutex::new(None),
            completed: CancellationToken::new(),
        }
    }

    /// Registers a snapshot listener. Returns `false` if it was already registered.
    pub fn subscribe(&self, listener: Arc<dyn AggregateListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|known| same_listener(known, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// No more results will arrive; `process` flushes its buffer and returns.
    pub fn test_completed(&self) {
        self.completed.cancel();
    }

    /// The most recent snapshot emitted, if any.
    pub fn last_snapshot(&self) -> Option<AggregatedResult> {
        self.last_snapshot.lock().clone()
    }

    /// Runs the aggregation loop until completion or cancellation, then drains the buffer.
    pub async fn process(&self, cancel: &CancellationToken) {
        tracing::debug!("Aggregator started, interval {:?}", self.interval);
        let mut last_tick = self.clock.now();
        loop {
            let done = cancel.is_cancelled() || self.completed.is_cancelled();
            if !done {
                tokio::select! {
                    _ = self.clock.wait_for(self.interval, cancel) => {}
                    _ = self.completed.cancelled() => {}
                }
            }

            let batch: Vec<TestResult> = self.rx.try_iter().take(DRAIN_CAP).collect();
            if !batch.is_empty() {
                let now = self.clock.now();
                let snapshot = self.stats.lock().fold(&batch, now - last_tick);
                last_tick = now;
                tracing::debug!(
                    "Aggregated {} results ({} total)",
                    batch.len(),
                    snapshot.count
                );
                self.deliver(&snapshot, cancel).await;
                *self.last_snapshot.lock() = Some(snapshot);
            }

            if done && self.rx.is_empty() {
                break;
            }
        }
        tracing::debug!("Aggregator drained");
    }

    async fn deliver(&self, snapshot: &AggregatedResult, cancel: &CancellationToken) {
        let listeners = self.listeners.read().clone();
        let results = join_all(
            listeners
                .iter()
                .map(|listener| listener.on_aggregate(snapshot, cancel)),
        )
        .await;
        for e in results.into_iter().filter_map(Result::err) {
            tracing::warn!("Aggregate listener failed: {e}");
        }
    }
}

#[async_trait]
impl ResultListener for Aggregator {
    async fn on_results(
        &self,
        batch: &[TestResult],
        _: &CancellationToken,
    ) -> Result<(), ListenerError> {
        for result in batch {
            // the receiver lives as long as self
            let _ = self.tx.send(result.clone());
        }
        Ok(())
    }
}
