use std::{sync::Arc, time::Duration};

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregate::TestResult,
    clock::Clock,
    listener::{same_listener, ResultListener},
};

/// Fans raw results out to result listeners in batches.
///
/// Workers [`publish`](Self::publish) into an unbounded queue and never wait. The
/// [`process`](Self::process) loop takes up to `batch_size` results at a time and hands the
/// same batch to every listener concurrently. Once the run is cancelled or marked complete,
/// the loop stops pausing between batches and returns only after the queue is empty.
pub struct ResultPublisher {
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
    tx: Sender<TestResult>,
    rx: Receiver<TestResult>,
    listeners: RwLock<Vec<Arc<dyn ResultListener>>>,
    completed: CancellationToken,
}

impl ResultPublisher {
    pub fn new(interval: Duration, batch_size: usize, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            clock,
            interval,
            batch_size: batch_size.max(1),
            tx,
            rx,
            listeners: RwLock::new(Vec::new()),
            completed: CancellationToken::new(),
        }
    }

    pub fn publish(&self, result: TestResult) {
        // the receiver lives as long as self
        let _ = self.tx.send(result);
    }

    /// Registers a listener. Returns `false` if this instance was already registered.
    pub fn subscribe(&self, listener: Arc<dyn ResultListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|known| same_listener(known, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn test_completed(&self) {
        self.completed.cancel();
    }

    /// Results published but not yet delivered.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub async fn process(&self, cancel: &CancellationToken) {
        tracing::debug!("Result publisher started, batch size {}", self.batch_size);
        let mut delivered = 0usize;
        loop {
            let done = cancel.is_cancelled() || self.completed.is_cancelled();
            if done && self.rx.is_empty() {
                break;
            }

            let batch: Vec<TestResult> = self.rx.try_iter().take(self.batch_size).collect();
            if !batch.is_empty() {
                self.deliver(&batch, cancel).await;
                delivered += batch.len();
            }

            if !done {
                tokio::select! {
                    _ = self.clock.wait_for(self.interval, cancel) => {}
                    _ = self.completed.cancelled() => {}
                }
            }
        }
        tracing::debug!("Result publisher drained after {delivered} results");
    }

    async fn deliver(&self, batch: &[TestResult], cancel: &CancellationToken) {
        let listeners = self.listeners.read().clone();
        let results = join_all(
            listeners
                .iter()
                .map(|listener| listener.on_results(batch, cancel)),
        )
        .await;
        for e in results.into_iter().filter_map(Result::err) {
            tracing::warn!("Result listener failed: {e}");
        }
    }
}
