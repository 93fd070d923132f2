//! Rate curves: piecewise flat/linear profiles over the run timeline.
//!
//! A [`RateProfile`] is an ordered list of [`Phase`]s. Each phase starts where the previous
//! one ended, so the position of a phase in the list defines its start offset:
//!
//! ```text
//! phase_start(i) = start + sum(duration(0..i))
//! phase_end(i)   = phase_start(i) + duration(i)
//! ```
//!
//! The same profile type drives two very different consumers:
//!
//! - the token manager integrates a *throughput* profile over `[last, now]` to know how many
//!   executions are owed ([`RateProfile::tokens_for_interval`]);
//! - the thread marshall samples a *concurrency* profile at `now` to know how many workers
//!   should be alive ([`RateProfile::desired_count`]).
//!
//! # Integration of a ramp
//! Inside a ramp phase the rate is linear in time. Over a clipped sub-interval `[lo, hi]`
//! the area under the curve is a rectangle plus a triangle:
//!
//! ```text
//! area = min(r(lo), r(hi)) * (hi - lo) + |r(hi) - r(lo)| * (hi - lo) / 2
//! ```
//!
//! which is exact for both ascending and descending ramps.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// The semaphore implementation uses 3 bits of usize for flags.
/// Any value greater than this will be capped to avoid crashing
/// the whole thing.
pub const MAX_TOKENS: usize = usize::MAX >> 3;

/// The value a phase holds for its whole duration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseValue {
    /// Constant rate (throughput) or count (concurrency).
    Flat(f64),
    /// Linear ramp from `from` to `to` over the phase duration.
    Ramp { from: f64, to: f64 },
}

impl PhaseValue {
    /// Value of the phase at `offset` into a phase of length `duration`.
    pub fn at(&self, offset: Duration, duration: Duration) -> f64 {
        match *self {
            PhaseValue::Flat(value) => value,
            PhaseValue::Ramp { from, to } => {
                if duration.is_zero() {
                    return to;
                }
                let t = (offset.as_secs_f64() / duration.as_secs_f64()).min(1.0);
                from + (to - from) * t
            }
        }
    }

    fn is_non_zero(&self) -> bool {
        match *self {
            PhaseValue::Flat(value) => value > 0.0,
            PhaseValue::Ramp { from, to } => from > 0.0 || to > 0.0,
        }
    }

    fn values(&self) -> [f64; 2] {
        match *self {
            PhaseValue::Flat(value) => [value, value],
            PhaseValue::Ramp { from, to } => [from, to],
        }
    }
}

/// A time-boxed segment of a rate curve.
///
/// Use `Phase::flat(Duration::from_secs(10), 100.0)` to hold 100/s for 10s and
/// `Phase::ramp(Duration::from_secs(10), 0.0, 100.0)` to climb to it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(with = "crate::config::duration_serde")]
    pub duration: Duration,
    pub value: PhaseValue,
}

impl Phase {
    pub fn flat(duration: Duration, value: f64) -> Self {
        Self {
            duration,
            value: PhaseValue::Flat(value),
        }
    }

    pub fn ramp(duration: Duration, from: f64, to: f64) -> Self {
        Self {
            duration,
            value: PhaseValue::Ramp { from, to },
        }
    }
}

/// An ordered, contiguous sequence of phases. Empty means "unregulated".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateProfile {
    phases: Vec<Phase>,
}

impl RateProfile {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Builds the classic ramp-up / hold / ramp-down shape peaking at `peak`.
    /// Zero-length segments are left out.
    pub fn ramp_hold_ramp(
        ramp_up: Duration,
        hold_for: Duration,
        ramp_down: Duration,
        peak: f64,
    ) -> Self {
        let phases = [
            Phase::ramp(ramp_up, 0.0, peak),
            Phase::flat(hold_for, peak),
            Phase::ramp(ramp_down, peak, 0.0),
        ]
        .into_iter()
        .filter(|phase| !phase.duration.is_zero())
        .collect();
        Self { phases }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Sum of all phase durations.
    pub fn total_duration(&self) -> Duration {
        self.phases.iter().map(|phase| phase.duration).sum()
    }

    /// Whether any phase asks for a non-zero rate at some point.
    pub fn implies_rate(&self) -> bool {
        self.phases.iter().any(|phase| phase.value.is_non_zero())
    }

    /// Whether every phase value is finite and non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.phases
            .iter()
            .flat_map(|phase| phase.value.values())
            .all(|value| value.is_finite() && value >= 0.0)
    }

    /// Total work owed between `last` and `now`, phase boundaries being laid out from `start`.
    ///
    /// Phases are clipped to the overlap with `[last, now]` and integrated independently;
    /// the result is the sum over all overlapping phases. Returns `0.0` for empty or
    /// inverted intervals.
    pub fn tokens_for_interval(&self, start: Instant, last: Instant, now: Instant) -> f64 {
        if now <= last {
            return 0.0;
        }

        let mut total = 0.0;
        let mut phase_start = start;
        for phase in &self.phases {
            if phase_start >= now {
                break;
            }
            let phase_end = phase_start + phase.duration;
            let lo = last.max(phase_start);
            let hi = now.min(phase_end);

            if hi > lo {
                let span = (hi - lo).as_secs_f64();
                total += match phase.value {
                    PhaseValue::Flat(rate) => rate * span,
                    ramp @ PhaseValue::Ramp { .. } => {
                        let r_lo = ramp.at(lo - phase_start, phase.duration);
                        let r_hi = ramp.at(hi - phase_start, phase.duration);
                        // rectangle under the lower bound plus the triangle above it
                        r_lo.min(r_hi) * span + (r_hi - r_lo).abs() * span / 2.0
                    }
                };
            }
            phase_start = phase_end;
        }
        total
    }

    /// Instantaneous value of the curve at `now`, or `None` outside every phase.
    ///
    /// Phases are scanned in order and the first one with `start <= now < end` wins.
    pub fn value_at(&self, start: Instant, now: Instant) -> Option<f64> {
        if now < start {
            return None;
        }
        let offset = now - start;
        let mut phase_start = Duration::ZERO;
        for phase in &self.phases {
            let phase_end = phase_start + phase.duration;
            if phase_start <= offset && offset < phase_end {
                return Some(phase.value.at(offset - phase_start, phase.duration));
            }
            phase_start = phase_end;
        }
        None
    }

    /// Number of workers the curve asks for at `now`, truncated toward zero.
    ///
    /// Outside the profile (before the start or past the end) there is no demand and
    /// the result is `0`.
    pub fn desired_count(&self, start: Instant, now: Instant) -> usize {
        match self.value_at(start, now) {
            Some(value) if value >= 1.0 => {
                if value >= MAX_TOKENS as f64 {
                    MAX_TOKENS
                } else {
                    value.trunc() as usize
                }
            }
            _ => 0,
        }
    }
}

impl From<Vec<Phase>> for RateProfile {
    fn from(phases: Vec<Phase>) -> Self {
        Self::new(phases)
    }
}
