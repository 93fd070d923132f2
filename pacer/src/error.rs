use thiserror::Error;

/// Boxed error returned by probes and listeners.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Faults that stop a run from starting or finishing cleanly.
///
/// Probe failures are not in here: a failing probe is recorded as a failed
/// [`TestResult`](crate::aggregate::TestResult) and the run carries on.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration was rejected before the run started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The probe's one-shot setup hook failed.
    #[error("probe setup failed: {0}")]
    Setup(#[source] ProbeError),

    /// One of the engine's own background tasks panicked or was aborted.
    #[error("{task} task failed: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
