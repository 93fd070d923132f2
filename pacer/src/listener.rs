//! Listener contracts, the boundary to output sinks.
//!
//! Raw results reach [`ResultListener`]s in batches from the result publisher; periodic
//! snapshots reach [`AggregateListener`]s from the aggregator. Every registered listener of a
//! kind receives each delivery concurrently and the engine awaits them all before moving
//! on. A listener error is logged and does not affect the other listeners or the run.
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::{AggregatedResult, TestResult},
    error::ProbeError,
};

/// Error type listeners report back with.
pub type ListenerError = ProbeError;

#[async_trait]
pub trait ResultListener: Send + Sync {
    async fn on_results(
        &self,
        batch: &[TestResult],
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError>;
}

#[async_trait]
pub trait AggregateListener: Send + Sync {
    async fn on_aggregate(
        &self,
        result: &AggregatedResult,
        cancel: &CancellationToken,
    ) -> Result<(), ListenerError>;
}

/// Identity comparison for listener handles, ignoring vtable differences.
pub(crate) fn same_listener<T: ?Sized>(a: &std::sync::Arc<T>, b: &std::sync::Arc<T>) -> bool {
    std::ptr::eq(
        std::sync::Arc::as_ptr(a) as *const (),
        std::sync::Arc::as_ptr(b) as *const (),
    )
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use super::*;

    /// Writes every snapshot to the `tracing` log at `info` level.
    ///
    /// Enabled via the `builtins` feature.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct LogListener;

    #[async_trait]
    impl AggregateListener for LogListener {
        async fn on_aggregate(
            &self,
            result: &AggregatedResult,
            _: &CancellationToken,
        ) -> Result<(), ListenerError> {
            tracing::info!(
                count = result.count,
                period_ok = result.period_success_count,
                period_err = result.period_error_count,
                "min={:?} max={:?} avg={:.2}ms period_avg={:.2}ms",
                result.min,
                result.max,
                result.moving_average,
                result.period_average,
            );
            Ok(())
        }
    }
}
