use std::{fmt, time::Duration};

use serde::Serialize;

use crate::{aggregate::AggregatedResult, exit::ExitReason};

/// How a run reached its terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RunOutcome {
    /// The configured duration or iteration budget was consumed.
    Completed,
    /// The exit signal fired before the run window closed.
    ExitConditionMet(ExitReason),
    Cancelled,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        match self {
            RunOutcome::Completed => true,
            RunOutcome::ExitConditionMet(reason) => reason.passed,
            RunOutcome::Cancelled => false,
        }
    }

    /// Process exit code a host should report: `0` when passed, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub name: String,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    /// Last snapshot of the run; its cumulative fields describe the whole run.
    pub summary: Option<AggregatedResult>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.name)?;
        match &self.outcome {
            RunOutcome::Completed => f.write_str("completed")?,
            RunOutcome::ExitConditionMet(reason) => write!(f, "stopped early ({})", reason.reason)?,
            RunOutcome::Cancelled => f.write_str("cancelled")?,
        }
        write!(f, " after {:.1?}", self.elapsed)?;
        if let Some(summary) = &self.summary {
            write!(
                f,
                ", {} results ({} failed), mean {:.2}ms, max {:?}",
                summary.count, summary.error_count, summary.mean, summary.max
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let stopped = |passed| {
            RunOutcome::ExitConditionMet(ExitReason {
                reason: "Min > 0 for 1 periods".into(),
                passed,
            })
        };

        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(stopped(true).exit_code(), 0);
        assert_eq!(stopped(false).exit_code(), 1);
        assert_eq!(RunOutcome::Cancelled.exit_code(), 1);
    }

    #[test]
    fn outcome_serializes_with_a_status_tag() {
        let json = serde_json::to_value(RunOutcome::ExitConditionMet(ExitReason {
            reason: "stop".into(),
            passed: false,
        }))
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "status": "exitConditionMet", "reason": "stop", "passed": false })
        );
    }
}
