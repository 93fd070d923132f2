use serde::Serialize;
use tokio::sync::watch;

/// Why a run ended early, and whether that counts as a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExitReason {
    pub reason: String,
    pub passed: bool,
}

/// One-shot "stop the run" flag shared by everything that may end a run early.
///
/// Transitions from unsignalled to signalled exactly once. The first [`signal`](Self::signal)
/// call wins; later calls are ignored and return `false`.
#[derive(Debug)]
pub struct ExitSignal {
    state: watch::Sender<Option<ExitReason>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    /// Fires the signal. Returns `true` if this call was the one that fired it.
    pub fn signal(&self, reason: impl Into<String>, passed: bool) -> bool {
        let reason = reason.into();
        let fired = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(ExitReason {
                reason: reason.clone(),
                passed,
            });
            true
        });
        if fired {
            tracing::info!("Exit signal fired ({}): {reason}", verdict(passed));
        } else {
            tracing::debug!("Exit signal already fired, ignoring: {reason}");
        }
        fired
    }

    pub fn is_signalled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ExitReason> {
        self.state.borrow().clone()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            // the sender is self, so this only fails if self is gone
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

fn verdict(passed: bool) -> &'static str {
    if passed {
        "passed"
    } else {
        "failed"
    }
}
