//! Token manager: throughput admission.
//!
//! Rate generation and work execution are kept apart: the scheduling loop calls
//! [`TokenManager::release_tokens`] once per tick, which integrates the throughput curve
//! over the time elapsed since the previous tick and adds that many permits to a
//! [`tokio::sync::Semaphore`]. Workers call [`TokenManager::request_task_execution`], which
//! claims one permit and *forgets* it so it never returns to the pool.
//!
//! # Fractional carrying
//! The curve integral is a float. Only whole tokens are released; the remainder is carried
//! into the next tick so that the released total tracks the exact integral instead of
//! drifting low:
//!
//! ```text
//! owed      = integral(last, now) + fractional
//! released  = floor(owed)
//! fractional = owed - released
//! ```
//!
//! # Iteration budget
//! With `iterations = N`, exactly `N` requests are granted. The budget is decremented under
//! a lock so that "check, decrement, read" is atomic across concurrent workers.
//!
//! # Discontinue requests
//! The thread marshall shrinks the pool by queueing discontinue requests. Each one is
//! consumed by exactly one future `request_task_execution` call, which then answers
//! "stop" without touching the semaphore.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::ThroughputConfig,
    rate::{RateProfile, MAX_TOKENS},
};

/// Per-run bookkeeping, present once [`TokenManager::initialise`] has been called.
#[derive(Debug)]
struct RunWindow {
    start: Instant,
    end: Option<Instant>,
    last: Instant,
    fractional: f64,
    /// Tokens that may still be released before the iteration cap is reached.
    unreleased: Option<u64>,
    profile: RateProfile,
}

#[derive(Debug)]
pub struct TokenManager {
    clock: Arc<dyn Clock>,
    /// Throughput curve as configured, before it is anchored to a run.
    throughput: ThroughputConfig,
    tokens: Arc<Semaphore>,
    window: Mutex<Option<RunWindow>>,
    /// Remaining executions; only meaningful when `iterations > 0`.
    budget: Mutex<i64>,
    regulated: AtomicBool,
    exhausted: AtomicBool,
    discontinues: AtomicUsize,
}

impl TokenManager {
    pub fn new(throughput: ThroughputConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            throughput,
            tokens: Arc::new(Semaphore::new(0)),
            window: Mutex::new(None),
            budget: Mutex::new(0),
            regulated: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            discontinues: AtomicUsize::new(0),
        }
    }

    /// Anchors the manager to a run window and resets every counter.
    ///
    /// `end == None` means the run has no time limit.
    pub fn initialise(&self, start: Instant, end: Option<Instant>) {
        let run_duration = end.map_or(Duration::ZERO, |end| end - start);
        let profile = self.throughput.profile(run_duration);
        let iterations = self.throughput.iterations;

        let regulated = profile.implies_rate();

        self.tokens.forget_permits(self.tokens.available_permits());
        self.discontinues.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
        self.regulated.store(regulated, Ordering::SeqCst);
        *self.budget.lock() = i64::try_from(iterations).unwrap_or(i64::MAX);

        tracing::debug!("Token manager initialised: regulated={regulated}, iterations={iterations}");
        *self.window.lock() = Some(RunWindow {
            start,
            end,
            last: start,
            fractional: 0.0,
            unreleased: (iterations > 0).then_some(iterations),
            profile,
        });
    }

    /// Adds the tokens owed since the previous call. Returns how many were released.
    pub fn release_tokens(&self, now: Instant) -> usize {
        let mut guard = self.window.lock();
        let Some(window) = guard.as_mut() else {
            tracing::warn!("release_tokens called before initialise, ignoring");
            return 0;
        };
        if window.unreleased == Some(0) || now <= window.last {
            return 0;
        }

        let owed = window
            .profile
            .tokens_for_interval(window.start, window.last, now)
            + window.fractional;
        window.last = now;

        let whole = owed.floor().max(0.0);
        window.fractional = (owed - whole).max(0.0);

        // Safely convert f64 to usize, saturating at the semaphore's hard limit
        let mut release = if whole >= MAX_TOKENS as f64 {
            MAX_TOKENS
        } else {
            whole as usize
        };
        if let Some(unreleased) = window.unreleased.as_mut() {
            release = release.min(usize::try_from(*unreleased).unwrap_or(MAX_TOKENS));
            *unreleased -= release as u64;
        }

        let room = MAX_TOKENS.saturating_sub(self.tokens.available_permits());
        let release = release.min(room);
        if release > 0 {
            self.tokens.add_permits(release);
        }
        release
    }

    /// Asks for permission to run one probe execution.
    ///
    /// Returns `false` when the caller must stop: a discontinue request was pending, the
    /// wait for a token was cancelled, the run end has passed, or the iteration budget is
    /// spent.
    pub async fn request_task_execution(&self, cancel: &CancellationToken) -> bool {
        if self.take_discontinue() {
            return false;
        }
        if cancel.is_cancelled() {
            return false;
        }

        if self.regulated.load(Ordering::SeqCst) {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                permit = self.tokens.acquire() => permit,
            };
            match permit {
                // The scheduling loop is solely responsible for adding permits
                Ok(permit) => permit.forget(),
                Err(_) => return false,
            }
        }

        if self.throughput.iterations > 0 {
            let remaining = {
                let mut budget = self.budget.lock();
                *budget -= 1;
                *budget
            };
            if remaining <= 0 {
                self.exhausted.store(true, Ordering::SeqCst);
            }
            if remaining < 0 {
                return false;
            }
        }

        let end = self.window.lock().as_ref().and_then(|window| window.end);
        !matches!(end, Some(end) if self.clock.now() >= end)
    }

    /// Queues one discontinue request for whichever worker asks next.
    pub fn request_task_discontinues(&self) {
        self.discontinues.fetch_add(1, Ordering::SeqCst);
    }

    /// Withdraws up to `count` queued discontinue requests. Returns how many were withdrawn.
    pub fn retract_discontinues(&self, count: usize) -> usize {
        let mut retracted = 0;
        let _ = self
            .discontinues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                retracted = pending.min(count);
                Some(pending - retracted)
            });
        retracted
    }

    pub fn pending_discontinues(&self) -> usize {
        self.discontinues.load(Ordering::SeqCst)
    }

    /// Tokens released but not yet claimed. Diagnostics only.
    pub fn available_tokens(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Whether the iteration budget has been handed out completely.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn is_regulated(&self) -> bool {
        self.regulated.load(Ordering::SeqCst)
    }

    fn take_discontinue(&self) -> bool {
        self.discontinues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::TokioClock, rate::Phase};
    use futures::future::join_all;

    fn manager(throughput: ThroughputConfig) -> Arc<TokenManager> {
        Arc::new(TokenManager::new(throughput, Arc::new(TokioClock)))
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test]
    async fn release_before_initialise_is_a_no_op() {
        let tokens = manager(ThroughputConfig::builder().tps(10.0).build());

        assert_eq!(tokens.release_tokens(Instant::now() + secs(1)), 0);
        assert_eq!(tokens.available_tokens(), 0);
    }

    #[tokio::test]
    async fn releases_one_second_of_flat_rate() {
        let tokens = manager(
            ThroughputConfig::builder()
                .phases(vec![Phase::flat(secs(10), 10.0)])
                .build(),
        );
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(10)));

        assert_eq!(tokens.release_tokens(start + secs(1)), 10);
        assert_eq!(tokens.available_tokens(), 10);
        // same instant again owes nothing
        assert_eq!(tokens.release_tokens(start + secs(1)), 0);
    }

    #[tokio::test]
    async fn fractional_accumulation() {
        // 12.5/s over 100ms ticks owes 1.25 per tick
        let tokens = manager(ThroughputConfig::builder().tps(12.5).build());
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(10)));

        let released: Vec<usize> = (1..=8)
            .map(|i| tokens.release_tokens(start + Duration::from_millis(100 * i)))
            .collect();

        assert_eq!(released, vec![1, 1, 1, 2, 1, 1, 1, 2]);
    }

    #[tokio::test]
    async fn token_conservation_regardless_of_chopping() {
        let profile = vec![
            Phase::ramp(secs(4), 0.0, 33.3),
            Phase::flat(secs(3), 33.3),
            Phase::ramp(secs(5), 33.3, 2.0),
        ];
        let start = Instant::now();
        let end = start + secs(12);
        let exact = crate::rate::RateProfile::new(profile.clone())
            .tokens_for_interval(start, start, end)
            .floor() as i64;

        for step_ms in [7u64, 100, 333, 1000, 4999] {
            let tokens = manager(ThroughputConfig::builder().phases(profile.clone()).build());
            tokens.initialise(start, Some(end));

            let mut now = start;
            let mut total = 0i64;
            while now < end {
                now = (now + Duration::from_millis(step_ms)).min(end);
                total += tokens.release_tokens(now) as i64;
            }
            assert!(
                (total - exact).abs() <= 1,
                "step {step_ms}ms released {total}, expected {exact}"
            );
        }
    }

    #[tokio::test]
    async fn iteration_cap_is_exact_under_concurrency() {
        let tokens = manager(ThroughputConfig::builder().iterations(25).build());
        let start = Instant::now();
        tokens.initialise(start, None);
        let cancel = CancellationToken::new();

        let requests = (0..100).map(|_| {
            let tokens = tokens.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tokens.request_task_execution(&cancel).await })
        });
        let granted = join_all(requests)
            .await
            .into_iter()
            .filter(|granted| *granted.as_ref().unwrap())
            .count();

        assert_eq!(granted, 25);
        assert!(tokens.is_exhausted());
        assert!(!tokens.request_task_execution(&cancel).await);
    }

    #[tokio::test]
    async fn iteration_cap_clamps_released_tokens() {
        let tokens = manager(ThroughputConfig::builder().tps(100.0).iterations(30).build());
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(10)));

        assert_eq!(tokens.release_tokens(start + secs(1)), 30);
        assert_eq!(tokens.release_tokens(start + secs(2)), 0);
    }

    #[tokio::test]
    async fn discontinue_is_consumed_exactly_once() {
        let tokens = manager(ThroughputConfig::default());
        let start = Instant::now();
        tokens.initialise(start, None);
        let cancel = CancellationToken::new();

        tokens.request_task_discontinues();
        assert_eq!(tokens.pending_discontinues(), 1);
        assert!(!tokens.request_task_execution(&cancel).await);
        assert!(tokens.request_task_execution(&cancel).await);
        assert_eq!(tokens.pending_discontinues(), 0);
    }

    #[tokio::test]
    async fn retracting_discontinues_never_goes_negative() {
        let tokens = manager(ThroughputConfig::default());
        tokens.request_task_discontinues();
        tokens.request_task_discontinues();

        assert_eq!(tokens.retract_discontinues(5), 2);
        assert_eq!(tokens.pending_discontinues(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn regulated_wait_is_cancellable() {
        let tokens = manager(ThroughputConfig::builder().tps(1.0).build());
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(60)));
        let cancel = CancellationToken::new();

        let waiter = {
            let tokens = tokens.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tokens.request_task_execution(&cancel).await })
        };
        tokio::time::sleep(secs(1)).await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn regulated_request_waits_for_a_token() {
        let tokens = manager(ThroughputConfig::builder().tps(1.0).build());
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(60)));
        let cancel = CancellationToken::new();

        let waiter = {
            let tokens = tokens.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tokens.request_task_execution(&cancel).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tokens.release_tokens(start + secs(1));
        assert!(waiter.await.unwrap());
        assert_eq!(tokens.available_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denies_execution_past_the_end_time() {
        let tokens = manager(ThroughputConfig::default());
        let start = Instant::now();
        tokens.initialise(start, Some(start + secs(5)));
        let cancel = CancellationToken::new();

        assert!(tokens.request_task_execution(&cancel).await);
        tokio::time::sleep(secs(5)).await;
        assert!(!tokens.request_task_execution(&cancel).await);
    }
}
