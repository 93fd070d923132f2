//! Thread marshall: worker pool sizing.
//!
//! Growing the pool spawns workers immediately. Shrinking never cancels a worker: it
//! queues discontinue requests with the token manager, and a worker stops the next time it
//! asks for permission to execute. Queued requests count against the live pool, so a
//! later growth withdraws them before spawning anything new.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConcurrencyConfig,
    rate::RateProfile,
    worker::{Worker, WorkerContext},
};

pub struct ThreadMarshall {
    concurrency: ConcurrencyConfig,
    profile: RateProfile,
    context: Arc<WorkerContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
}

impl ThreadMarshall {
    pub fn new(concurrency: ConcurrencyConfig, context: Arc<WorkerContext>) -> Self {
        let profile = concurrency.profile();
        Self {
            concurrency,
            profile,
            context,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Moves the pool towards `desired` workers. Returns how many were spawned.
    pub fn set_desired_level(&self, desired: usize, cancel: &CancellationToken) -> usize {
        let tokens = &self.context.tokens;
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());

        let effective = workers.len().saturating_sub(tokens.pending_discontinues());
        if desired < effective {
            for _ in desired..effective {
                tokens.request_task_discontinues();
            }
            tracing::debug!("Discontinuing {} workers", effective - desired);
            return 0;
        }

        let missing = desired - effective;
        let missing = missing - tokens.retract_discontinues(missing);
        for _ in 0..missing {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::new(id, self.context.clone());
            workers.push(tokio::spawn(worker.run(cancel.clone())));
        }
        if missing > 0 {
            tracing::debug!("Spawned {missing} workers, {} alive", workers.len());
        }
        missing
    }

    /// Sizes the pool for the current tick.
    ///
    /// Closed workload follows the concurrency curve (or the constant `threads` count when
    /// there is none). Open workload keeps at least `min_threads` alive and, while tokens
    /// pile up, adds workers up to `max_threads`.
    pub fn adjust_thread_levels(
        &self,
        start: Instant,
        now: Instant,
        cancel: &CancellationToken,
    ) -> usize {
        let concurrency = &self.concurrency;
        if !concurrency.open_workload {
            let desired = if self.profile.is_empty() {
                concurrency.threads
            } else {
                self.profile.desired_count(start, now)
            };
            return self.set_desired_level(desired, cancel);
        }

        let effective = self
            .get_thread_count()
            .saturating_sub(self.context.tokens.pending_discontinues());
        let backlog = self.context.tokens.available_tokens();
        let desired = if backlog > 1 {
            effective.saturating_add(backlog - 1)
        } else {
            effective
        };
        let desired = desired
            .max(concurrency.min_threads)
            .min(concurrency.max_threads);
        self.set_desired_level(desired, cancel)
    }

    /// Live workers, after forgetting the ones that have exited.
    pub fn get_thread_count(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.len()
    }

    /// Cancels `cancel`, waits up to `grace` for every worker, then aborts the rest.
    ///
    /// Returns how many workers had to be aborted.
    pub async fn shutdown(&self, cancel: &CancellationToken, grace: Duration) -> usize {
        cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        tracing::debug!("Waiting for {count} workers to finish");

        let never = CancellationToken::new();
        let finished = tokio::select! {
            results = join_all(workers) => Some(results),
            _ = self.context.clock.wait_for(grace, &never) => None,
        };
        match finished {
            Some(results) => {
                for e in results.into_iter().filter_map(Result::err) {
                    if e.is_panic() {
                        tracing::error!("Worker panicked: {e}");
                    }
                }
                0
            }
            None => {
                let stragglers = aborts.iter().filter(|abort| !abort.is_finished()).count();
                tracing::warn!("{stragglers} workers still busy after {grace:?}, aborting");
                for abort in aborts {
                    abort.abort();
                }
                stragglers
            }
        }
    }
}
