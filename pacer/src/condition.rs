//! Exit conditions: rules over aggregated statistics that end a run early.
//!
//! Each condition watches one [`AggregatedResult`] property. On every snapshot the property
//! is compared with the configured value, and the verdict is pushed into a per-condition
//! window sized in aggregation periods. When a full window holds nothing but satisfied
//! comparisons, the condition fires the [`ExitSignal`].
//!
//! Conditions are written in configuration as objects or, for operators, as text:
//!
//! ```rust
//! use pacer::condition::{ExitCondition, Verdict};
//!
//! let condition: ExitCondition = "failed if PeriodErrorCount > 5 for 3 periods".parse().unwrap();
//!
//! assert_eq!(condition.passed_failed, Verdict::Failed);
//! assert_eq!(condition.periods, Some(3));
//! assert_eq!(condition.to_string(), "failed if PeriodErrorCount > 5 for 3 periods");
//! ```
use std::{collections::VecDeque, fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    aggregate::AggregatedResult,
    config::{format_duration, parse_duration},
    exit::ExitSignal,
    listener::{AggregateListener, ListenerError},
};

/// Whether a fired condition means the run passed or failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    Passed,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
}

impl Operator {
    /// `None` for anything but `<`, `>`, `<=`, `>=`, `=` (or `==`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            "<=" => Some(Self::Le),
            ">=" => Some(Self::Ge),
            "=" | "==" => Some(Self::Eq),
            _ => None,
        }
    }

    pub fn compare(self, actual: f64, expected: f64) -> bool {
        match self {
            Self::Lt => actual < expected,
            Self::Gt => actual > expected,
            Self::Le => actual <= expected,
            Self::Ge => actual >= expected,
            Self::Eq => actual == expected,
        }
    }
}

/// A rule of the form "`passed_failed` if `property` `operator` `value` for a window".
///
/// Exactly one of `periods` or `duration` sizes the window; `periods` wins if both are
/// set. An operator outside the known set is kept as written and the condition is skipped
/// at evaluation time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ExitCondition {
    #[builder(setter(into))]
    pub property: String,
    #[builder(setter(into))]
    pub operator: String,
    pub value: f64,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_duration")]
    pub duration: Option<Duration>,
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periods: Option<u32>,
    #[builder(default)]
    #[serde(default)]
    pub passed_failed: Verdict,
}

impl ExitCondition {
    /// Window length in aggregation periods.
    ///
    /// A duration converts to `ceil(duration / aggregation_interval) + 1` periods.
    pub fn capacity(&self, aggregation_interval: Duration) -> usize {
        if let Some(periods) = self.periods {
            return (periods as usize).max(1);
        }
        match self.duration {
            Some(duration) if !aggregation_interval.is_zero() => {
                let periods = duration.as_secs_f64() / aggregation_interval.as_secs_f64();
                periods.ceil() as usize + 1
            }
            _ => 1,
        }
    }
}

impl fmt::Display for ExitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} if {} {} {} for ",
            self.passed_failed, self.property, self.operator, self.value
        )?;
        match (self.periods, self.duration) {
            (None, Some(duration)) => f.write_str(&format_duration(duration)),
            (periods, _) => write!(f, "{} periods", periods.unwrap_or(1)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionParseError {
    #[error("expected `<passed|failed> if <property> <operator> <value> for <window>`, got `{0}`")]
    Shape(String),
    #[error("unknown verdict `{0}`, expected `passed` or `failed`")]
    Verdict(String),
    #[error("unknown operator `{0}`")]
    Operator(String),
    #[error("`{0}` is not a number")]
    Value(String),
    #[error("invalid window `{0}`")]
    Window(String),
}

impl FromStr for ExitCondition {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let shape = || ConditionParseError::Shape(s.to_owned());
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let [verdict, keyword_if, property, operator, value, keyword_for, window @ ..] =
            tokens.as_slice()
        else {
            return Err(shape());
        };
        if !keyword_if.eq_ignore_ascii_case("if") || !keyword_for.eq_ignore_ascii_case("for") {
            return Err(shape());
        }

        let passed_failed = match verdict.to_ascii_lowercase().as_str() {
            "passed" | "pass" => Verdict::Passed,
            "failed" | "fail" => Verdict::Failed,
            _ => return Err(ConditionParseError::Verdict(verdict.to_string())),
        };
        if Operator::parse(operator).is_none() {
            return Err(ConditionParseError::Operator(operator.to_string()));
        }
        let value: f64 = value
            .parse()
            .map_err(|_| ConditionParseError::Value(value.to_string()))?;

        let (periods, duration) = match window {
            [count, unit] if matches!(unit.to_ascii_lowercase().as_str(), "period" | "periods") => {
                let periods = count
                    .parse::<u32>()
                    .map_err(|_| ConditionParseError::Window(window.join(" ")))?;
                (Some(periods), None)
            }
            [duration] => {
                let duration = parse_duration(duration)
                    .map_err(|_| ConditionParseError::Window(duration.to_string()))?;
                (None, Some(duration))
            }
            _ => return Err(ConditionParseError::Window(window.join(" "))),
        };

        Ok(Self {
            property: property.to_string(),
            operator: operator.to_string(),
            value,
            duration,
            periods,
            passed_failed,
        })
    }
}

mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::config::duration_serde;

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "duration_serde")] Duration);

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => duration_serde::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(duration)| duration))
    }
}

/// Watches aggregated snapshots and fires the exit signal on the first satisfied condition.
pub struct ExitConditionEvaluator {
    conditions: Vec<ExitCondition>,
    aggregation_interval: Duration,
    signal: Arc<ExitSignal>,
    /// One lazily created window per condition, holding `(satisfied, observed value)`.
    windows: Mutex<Vec<Option<VecDeque<(bool, f64)>>>>,
}

impl ExitConditionEvaluator {
    pub fn new(
        conditions: Vec<ExitCondition>,
        aggregation_interval: Duration,
        signal: Arc<ExitSignal>,
    ) -> Self {
        let windows = Mutex::new(vec![None; conditions.len()]);
        Self {
            conditions,
            aggregation_interval,
            signal,
            windows,
        }
    }

    /// Feeds one snapshot through every condition, in order.
    ///
    /// Returns the index of the condition that fired, if any. Once the signal has fired,
    /// by this evaluator or anyone else, snapshots are ignored.
    pub fn evaluate(&self, snapshot: &AggregatedResult) -> Option<usize> {
        if self.signal.is_signalled() {
            return None;
        }
        let mut windows = self.windows.lock();

        for (index, condition) in self.conditions.iter().enumerate() {
            let Some(operator) = Operator::parse(&condition.operator) else {
                tracing::debug!("Skipping exit condition with unknown operator: {condition}");
                continue;
            };
            let Some(actual) = snapshot.property(&condition.property).filter(|v| v.is_finite())
            else {
                tracing::debug!("Skipping exit condition on unknown property: {condition}");
                continue;
            };

            let capacity = condition.capacity(self.aggregation_interval);
            let window = windows[index].get_or_insert_with(|| VecDeque::with_capacity(capacity));
            window.push_back((operator.compare(actual, condition.value), actual));
            while window.len() > capacity {
                window.pop_front();
            }

            if window.len() == capacity && window.iter().all(|(satisfied, _)| *satisfied) {
                self.signal.signal(
                    condition.to_string(),
                    condition.passed_failed == Verdict::Passed,
                );
                return Some(index);
            }
        }
        None
    }
}

#[async_trait]
impl AggregateListener for ExitConditionEvaluator {
    async fn on_aggregate(
        &self,
        result: &AggregatedResult,
        _: &CancellationToken,
    ) -> Result<(), ListenerError> {
        self.evaluate(result);
        Ok(())
    }
}
