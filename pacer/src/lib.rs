//! Pacer: an admission and scheduling engine for load tests.
//!
//! You hand Pacer a [`Probe`] (the thing under load) and a [`TestConfig`] describing two
//! curves over time: how many probe executions may *start* per second (throughput), and how
//! many workers are *alive* (concurrency). Pacer drives the probe along those curves,
//! summarizes what comes back, and can end the run early when a rule over those summaries
//! holds for long enough.
//!
//! # Architecture
//!
//! - [`TestRunner`]: the scheduling loop. Every tick it releases the tokens owed by the
//!   throughput curve and resizes the worker pool.
//! - [`TokenManager`]: admission. Workers ask it for permission before each execution.
//! - [`ThreadMarshall`]: the worker pool. Grows by spawning, shrinks by handing out
//!   discontinue requests that a worker picks up at its next permission check.
//! - [`Worker`](worker::Worker): runs the probe, classifies whatever it returned into
//!   [`TestResult`]s and publishes them.
//! - [`ResultPublisher`]: batches raw results out to [`ResultListener`]s.
//! - [`Aggregator`]: folds results into periodic [`AggregatedResult`] snapshots for
//!   [`AggregateListener`]s.
//! - [`ExitConditionEvaluator`]: watches snapshots and fires the [`ExitSignal`].
//! - [`Scenario`]: glue that wires all of the above for one run and returns a [`RunReport`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use pacer::{
//!     config::{ConcurrencyConfig, TestConfig, ThroughputConfig},
//!     probe_fn, LogListener, Scenario,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TestConfig::builder()
//!         .concurrency(ConcurrencyConfig::builder().threads(8).build())
//!         .throughput(
//!             ThroughputConfig::builder()
//!                 .tps(200.0)
//!                 .ramp_up(Duration::from_secs(10))
//!                 .hold_for(Duration::from_secs(50))
//!                 .build(),
//!         )
//!         .exit_conditions(vec!["failed if PeriodErrorCount > 10 for 3 periods".parse().unwrap()])
//!         .build();
//!
//!     let report = Scenario::builder()
//!         .name("sleepy endpoint")
//!         .probe(Arc::new(probe_fn(|| async {
//!             tokio::time::sleep(Duration::from_millis(15)).await;
//!             (true, "200 OK")
//!         })))
//!         .config(config)
//!         .aggregate_listeners(vec![Arc::new(LogListener)])
//!         .build()
//!         .run()
//!         .await
//!         .unwrap();
//!
//!     println!("{report}");
//!     std::process::exit(report.outcome.exit_code());
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: the `#[outcome]` attribute for custom probe return types. (Enabled by default)
//! - `builtins`: ready-made listeners such as [`LogListener`]. (Enabled by default)
//!
//! # Logging
//!
//! Everything logs through `tracing`. Pacer never installs a subscriber; that is up to the
//! host (see `examples/steady_probe.rs`).

extern crate self as pacer;

/// Snapshot aggregation
pub mod aggregate;
/// Time source used for every scheduling decision
pub mod clock;
/// Early-exit rules
pub mod condition;
/// Configuration shape
pub mod config;
pub mod error;
pub mod exit;
/// Listener contracts and built-in listeners
pub mod listener;
pub mod marshall;
/// Probe return value classification
pub mod outcome;
pub mod probe;
pub mod publisher;
/// Rate curves
pub mod rate;
pub mod report;
/// Scheduling loop
pub mod runner;
/// Main module of the engine that glues everything together
pub mod scenario;
pub mod token;
pub mod worker;

pub use aggregate::{AggregatedResult, Aggregator, TestResult};
pub use condition::{ExitCondition, ExitConditionEvaluator};
pub use config::TestConfig;
pub use error::{Error, ProbeError, Result};
pub use exit::{ExitReason, ExitSignal};
#[cfg(feature = "builtins")]
pub use listener::LogListener;
pub use listener::{AggregateListener, ResultListener};
pub use marshall::ThreadMarshall;
pub use outcome::ProbeValue;
pub use probe::{probe_fn, Probe};
pub use publisher::ResultPublisher;
pub use report::{RunOutcome, RunReport};
pub use runner::TestRunner;
pub use scenario::Scenario;
pub use token::TokenManager;

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use pacer_macros::*;
}
