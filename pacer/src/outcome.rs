//! Classification of probe return values.
//!
//! Probes are heterogeneous: one returns a bare `bool`, another a `(Duration, String)`,
//! a third a list of sub-results. Instead of assuming a calling convention, every probe
//! returns a [`ProbeValue`], a closed set of recognised shapes, and [`classify`] turns it
//! into one or more [`Outcome`]s of `(duration, passed, result)`.
//!
//! | shape | duration | passed | result |
//! |---|---|---|---|
//! | `Error(e)` | measured | `false` | `e` |
//! | `Duration(d)` | `d` | `true` | `""` |
//! | `Bool(b)` | measured | `b` | `""` |
//! | `Text(s)` / `Scalar(s)` | measured | `true` | `s` |
//! | 2/3-`Tuple` | by element type | by element type | by element type |
//! | `Sequence` | one outcome per element (one level deep) |||
//! | anything else | measured | `true` | JSON text, `""` if that fails |
//!
//! Most values convert with `.into()`:
//!
//! ```rust
//! use std::time::Duration;
//! use pacer::outcome::{classify, ProbeValue};
//!
//! let value: ProbeValue = ("created".to_owned(), Duration::from_millis(12), true).into();
//! let outcomes = classify(value, Duration::from_millis(40));
//!
//! assert_eq!(outcomes[0].duration, Duration::from_millis(12));
//! assert_eq!(outcomes[0].result, "created");
//! assert!(outcomes[0].passed);
//! ```
use std::{fmt::Display, time::Duration};

use serde::Serialize;

/// Raw value returned by one probe execution.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeValue {
    /// Nothing to report beyond "it ran".
    Unit,
    Duration(Duration),
    Bool(bool),
    Text(String),
    /// A number or other scalar, already rendered.
    Scalar(String),
    /// A 2- or 3-tuple whose element types give each element its meaning.
    Tuple(Vec<ProbeValue>),
    /// Several sub-results, each published as its own result.
    Sequence(Vec<ProbeValue>),
    /// The probe failed.
    Error(String),
    /// Anything else, serialized as JSON.
    Serialized(String),
}

impl ProbeValue {
    /// Best-effort JSON rendering of an arbitrary value.
    ///
    /// A serialization failure yields an empty result text; it never fails the result.
    pub fn serialized<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => ProbeValue::Serialized(json),
            Err(e) => {
                tracing::debug!("Probe value could not be serialized: {e}");
                ProbeValue::Serialized(String::new())
            }
        }
    }

    pub fn error(error: impl Display) -> Self {
        ProbeValue::Error(error.to_string())
    }

    fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Classified result of a single probe execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub duration: Duration,
    pub passed: bool,
    pub result: String,
}

impl Outcome {
    fn measured(duration: Duration) -> Self {
        Self {
            duration,
            passed: true,
            result: String::new(),
        }
    }
}

/// Turns a probe value into outcomes. `measured` is the wall time of the execution and is
/// used unless the value carries its own duration.
///
/// Every call yields at least one outcome.
pub fn classify(value: ProbeValue, measured: Duration) -> Vec<Outcome> {
    match value {
        ProbeValue::Sequence(items) if !items.is_empty() => items
            .into_iter()
            .map(|item| classify_single(item, measured))
            .collect(),
        ProbeValue::Sequence(_) => vec![Outcome::measured(measured)],
        other => vec![classify_single(other, measured)],
    }
}

fn classify_single(value: ProbeValue, measured: Duration) -> Outcome {
    let mut outcome = Outcome::measured(measured);
    match value {
        ProbeValue::Unit => {}
        ProbeValue::Duration(duration) => outcome.duration = duration,
        ProbeValue::Bool(passed) => outcome.passed = passed,
        ProbeValue::Text(text) | ProbeValue::Scalar(text) | ProbeValue::Serialized(text) => {
            outcome.result = text
        }
        ProbeValue::Error(error) => {
            outcome.passed = false;
            outcome.result = error;
        }
        ProbeValue::Tuple(items) if matches!(items.len(), 2 | 3) && items.iter().all(is_field) => {
            for item in items {
                match item {
                    ProbeValue::Duration(duration) => outcome.duration = duration,
                    ProbeValue::Bool(passed) => outcome.passed = passed,
                    ProbeValue::Text(text) | ProbeValue::Scalar(text) => outcome.result = text,
                    _ => {}
                }
            }
        }
        // nested sequences and odd tuples are only described, not destructured
        other @ (ProbeValue::Tuple(_) | ProbeValue::Sequence(_)) => outcome.result = other.render(),
    }
    outcome
}

fn is_field(value: &ProbeValue) -> bool {
    matches!(
        value,
        ProbeValue::Duration(_) | ProbeValue::Bool(_) | ProbeValue::Text(_) | ProbeValue::Scalar(_)
    )
}

impl From<()> for ProbeValue {
    fn from(_: ()) -> Self {
        ProbeValue::Unit
    }
}

impl From<Duration> for ProbeValue {
    fn from(value: Duration) -> Self {
        ProbeValue::Duration(value)
    }
}

impl From<bool> for ProbeValue {
    fn from(value: bool) -> Self {
        ProbeValue::Bool(value)
    }
}

impl From<String> for ProbeValue {
    fn from(value: String) -> Self {
        ProbeValue::Text(value)
    }
}

impl From<&str> for ProbeValue {
    fn from(value: &str) -> Self {
        ProbeValue::Text(value.to_owned())
    }
}

impl From<serde_json::Value> for ProbeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ProbeValue::Unit,
            serde_json::Value::Bool(b) => ProbeValue::Bool(b),
            serde_json::Value::String(s) => ProbeValue::Text(s),
            serde_json::Value::Number(n) => ProbeValue::Scalar(n.to_string()),
            other => ProbeValue::serialized(&other),
        }
    }
}

macro_rules! scalar_probe_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ProbeValue {
                fn from(value: $ty) -> Self {
                    ProbeValue::Scalar(value.to_string())
                }
            }
        )*
    };
}

scalar_probe_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, char);

impl<A, B> From<(A, B)> for ProbeValue
where
    A: Into<ProbeValue>,
    B: Into<ProbeValue>,
{
    fn from((a, b): (A, B)) -> Self {
        ProbeValue::Tuple(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for ProbeValue
where
    A: Into<ProbeValue>,
    B: Into<ProbeValue>,
    C: Into<ProbeValue>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        ProbeValue::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

impl<T: Into<ProbeValue>> From<Vec<T>> for ProbeValue {
    fn from(values: Vec<T>) -> Self {
        ProbeValue::Sequence(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ProbeValue>> From<Option<T>> for ProbeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ProbeValue::Unit, Into::into)
    }
}

impl<T, E> From<Result<T, E>> for ProbeValue
where
    T: Into<ProbeValue>,
    E: Display,
{
    fn from(value: Result<T, E>) -> Self {
        match value {
            Ok(value) => value.into(),
            Err(e) => ProbeValue::error(e),
        }
    }
}
