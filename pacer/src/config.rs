//! Configuration shape consumed by the engine.
//!
//! Every struct can be built in code with its `TypedBuilder` or deserialized from JSON
//! (camelCase keys, every field optional). Durations accept `"250ms"`, `"10s"`, `"2m"`,
//! `"1h"` strings or bare integer milliseconds.
//!
//! ```rust
//! use std::time::Duration;
//! use pacer::config::{ConcurrencyConfig, TestConfig, ThroughputConfig};
//!
//! let config = TestConfig::builder()
//!     .concurrency(ConcurrencyConfig::builder().threads(8).hold_for(Duration::from_secs(30)).build())
//!     .throughput(ThroughputConfig::builder().tps(50.0).build())
//!     .build();
//!
//! assert_eq!(config.test_duration(), Duration::from_secs(30));
//! ```
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    condition::ExitCondition,
    error::{Error, Result},
    rate::{Phase, RateProfile},
};

/// Stand-in length for a throughput curve that has no natural end.
const UNBOUNDED_RUN: Duration = Duration::from_secs(60 * 60 * 24 * 365);

fn default_max_threads() -> usize {
    // 120 workers per cpu seems like a good default number
    num_cpus::get() * 120
}

/// How many workers are alive over time, and under which discipline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    /// Peak (ramped) or constant worker count when no phases are given.
    #[builder(default = 1)]
    pub threads: usize,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub ramp_up: Duration,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub hold_for: Duration,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub ramp_down: Duration,
    /// Elastic pool sized by backlog instead of by the concurrency curve.
    #[builder(default)]
    pub open_workload: bool,
    #[builder(default = 1)]
    pub min_threads: usize,
    #[builder(default = default_max_threads())]
    pub max_threads: usize,
    #[builder(default)]
    pub phases: Vec<Phase>,
    /// Open workload only: a worker that waits this long without a token exits.
    /// Zero disables idle kills.
    #[builder(default = Duration::from_secs(5))]
    #[serde(with = "duration_serde")]
    pub thread_idle_kill_time: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConcurrencyConfig {
    /// The concurrency curve. Empty means a constant `threads` count.
    pub fn profile(&self) -> RateProfile {
        if !self.phases.is_empty() {
            return RateProfile::new(self.phases.clone());
        }
        RateProfile::ramp_hold_ramp(
            self.ramp_up,
            self.hold_for,
            self.ramp_down,
            self.threads as f64,
        )
    }

    fn shaped_duration(&self) -> Duration {
        self.ramp_up + self.hold_for + self.ramp_down
    }
}

/// How many probe executions may start over time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct ThroughputConfig {
    /// Peak (ramped) or constant executions per second. Zero means unregulated.
    #[builder(default)]
    pub tps: f64,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub ramp_up: Duration,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub hold_for: Duration,
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub ramp_down: Duration,
    #[builder(default)]
    pub phases: Vec<Phase>,
    /// Pause between two executions of the same worker.
    #[builder(default)]
    #[serde(with = "duration_serde")]
    pub think_time: Duration,
    /// Cap on the total number of executions. Zero means unbounded.
    #[builder(default)]
    pub iterations: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ThroughputConfig {
    /// The throughput curve for a run lasting `run_duration` (zero meaning "no end").
    pub fn profile(&self, run_duration: Duration) -> RateProfile {
        if !self.phases.is_empty() {
            return RateProfile::new(self.phases.clone());
        }
        if self.tps <= 0.0 {
            return RateProfile::default();
        }

        let shaped =
            RateProfile::ramp_hold_ramp(self.ramp_up, self.hold_for, self.ramp_down, self.tps);
        if !shaped.is_empty() {
            return shaped;
        }
        let span = if run_duration.is_zero() {
            UNBOUNDED_RUN
        } else {
            run_duration
        };
        RateProfile::new(vec![Phase::flat(span, self.tps)])
    }

    fn shaped_duration(&self) -> Duration {
        self.ramp_up + self.hold_for + self.ramp_down
    }
}

/// Cadences and limits of the engine's own loops.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Tick of the scheduling loop.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
    /// Tick of the aggregator; one `AggregatedResult` per tick with data.
    #[builder(default = Duration::from_secs(1))]
    #[serde(with = "duration_serde")]
    pub aggregation_interval: Duration,
    /// Pause of the result publisher between two batches.
    #[builder(default = Duration::from_millis(100))]
    #[serde(with = "duration_serde")]
    pub result_publishing_interval: Duration,
    #[builder(default = 1000)]
    pub result_batch_size: usize,
    /// How long draining waits for in-flight probe executions before aborting them.
    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything a run needs apart from the probe itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    #[builder(default)]
    pub concurrency: ConcurrencyConfig,
    #[builder(default)]
    pub throughput: ThroughputConfig,
    #[builder(default)]
    pub engine: EngineConfig,
    #[builder(default)]
    pub exit_conditions: Vec<ExitCondition>,
}

impl TestConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))
    }

    /// Length of the run window.
    ///
    /// When either side is phase-driven, the longer phase list wins; otherwise the longer
    /// ramp-up + hold + ramp-down sum wins. Zero means the run is bounded only by
    /// `iterations` (or by cancellation).
    pub fn test_duration(&self) -> Duration {
        let concurrency = &self.concurrency;
        let throughput = &self.throughput;
        if !concurrency.phases.is_empty() || !throughput.phases.is_empty() {
            let c: Duration = concurrency.phases.iter().map(|p| p.duration).sum();
            let t: Duration = throughput.phases.iter().map(|p| p.duration).sum();
            return c.max(t);
        }
        concurrency.shaped_duration().max(throughput.shaped_duration())
    }

    pub fn validate(&self) -> Result<()> {
        let throughput = &self.throughput;
        if !throughput.tps.is_finite() || throughput.tps < 0.0 {
            return Err(Error::config(format!(
                "tps must be a finite, non-negative number (got {})",
                throughput.tps
            )));
        }
        if !RateProfile::new(throughput.phases.clone()).is_well_formed() {
            return Err(Error::config(
                "throughput phases must hold finite, non-negative rates",
            ));
        }
        if !RateProfile::new(self.concurrency.phases.clone()).is_well_formed() {
            return Err(Error::config(
                "concurrency phases must hold finite, non-negative counts",
            ));
        }

        let concurrency = &self.concurrency;
        if concurrency.open_workload {
            if concurrency.max_threads == 0 {
                return Err(Error::config("maxThreads must be at least 1"));
            }
            if concurrency.min_threads > concurrency.max_threads {
                return Err(Error::config(format!(
                    "minThreads ({}) exceeds maxThreads ({})",
                    concurrency.min_threads, concurrency.max_threads
                )));
            }
        }

        let engine = &self.engine;
        for (name, interval) in [
            ("checkInterval", engine.check_interval),
            ("aggregationInterval", engine.aggregation_interval),
            ("resultPublishingInterval", engine.result_publishing_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }
        if engine.result_batch_size == 0 {
            return Err(Error::config("resultBatchSize must be at least 1"));
        }
        Ok(())
    }
}

/// Parses `"250ms"`, `"10s"`, `"2m"`, `"1h"` or a bare number of milliseconds.
pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration: {s}");
    // "ms" must be checked before "s"
    let (number, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1)
    };
    let value: u64 = number.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

pub(crate) fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{ms}ms")
    }
}

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(s) => super::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::PhaseValue;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn duration_from_phases_takes_the_longer_list() {
        let config = TestConfig::builder()
            .concurrency(
                ConcurrencyConfig::builder()
                    .phases(vec![Phase::flat(secs(10), 2.0), Phase::flat(secs(5), 4.0)])
                    .build(),
            )
            .throughput(
                ThroughputConfig::builder()
                    .phases(vec![Phase::ramp(secs(12), 0.0, 10.0)])
                    .build(),
            )
            .build();

        assert_eq!(config.test_duration(), secs(15));
    }

    #[test]
    fn duration_from_ramps_takes_the_longer_shape() {
        let config = TestConfig::builder()
            .concurrency(
                ConcurrencyConfig::builder()
                    .threads(4)
                    .ramp_up(secs(5))
                    .hold_for(secs(20))
                    .build(),
            )
            .throughput(
                ThroughputConfig::builder()
                    .tps(100.0)
                    .hold_for(secs(30))
                    .build(),
            )
            .build();

        assert_eq!(config.test_duration(), secs(30));
    }

    #[test]
    fn flat_tps_without_shape_spans_the_run() {
        let throughput = ThroughputConfig::builder().tps(25.0).build();

        assert_eq!(
            throughput.profile(secs(40)).phases(),
            &[Phase::flat(secs(40), 25.0)]
        );
        assert!(ThroughputConfig::default().profile(secs(40)).is_empty());
    }

    #[test]
    fn concurrency_without_shape_is_constant() {
        let concurrency = ConcurrencyConfig::builder().threads(6).build();
        assert!(concurrency.profile().is_empty());

        let shaped = ConcurrencyConfig::builder()
            .threads(6)
            .ramp_up(secs(6))
            .build();
        assert_eq!(
            shaped.profile().phases()[0].value,
            PhaseValue::Ramp { from: 0.0, to: 6.0 }
        );
    }

    #[test]
    fn parses_json_with_defaults() {
        let config = TestConfig::from_json(
            r#"{
                "concurrency": { "threads": 3, "holdFor": "1m", "openWorkload": true, "maxThreads": 10 },
                "throughput": { "tps": 12.5, "thinkTime": 250, "iterations": 1000 },
                "engine": { "aggregationInterval": "5s" },
                "exitConditions": [
                    { "property": "Max", "operator": ">", "value": 900, "periods": 3, "passedFailed": "failed" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.concurrency.threads, 3);
        assert_eq!(config.concurrency.hold_for, secs(60));
        assert_eq!(config.concurrency.min_threads, 1);
        assert_eq!(config.throughput.think_time, Duration::from_millis(250));
        assert_eq!(config.engine.aggregation_interval, secs(5));
        assert_eq!(config.engine.check_interval, Duration::from_millis(100));
        assert_eq!(config.exit_conditions.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_open_workload_bounds() {
        let config = TestConfig::builder()
            .concurrency(
                ConcurrencyConfig::builder()
                    .open_workload(true)
                    .min_threads(8)
                    .max_threads(2)
                    .build(),
            )
            .build();

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_negative_rates() {
        let config = TestConfig::builder()
            .throughput(
                ThroughputConfig::builder()
                    .phases(vec![Phase::ramp(secs(1), 5.0, -1.0)])
                    .build(),
            )
            .build();

        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(secs(10)));
        assert_eq!(parse_duration("2m"), Ok(secs(120)));
        assert_eq!(parse_duration("1h"), Ok(secs(3600)));
        assert_eq!(parse_duration("75"), Ok(Duration::from_millis(75)));
        assert!(parse_duration("ten seconds").is_err());
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(secs(30)), "30s");
    }
}
