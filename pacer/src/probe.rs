use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;

use crate::{error::ProbeError, outcome::ProbeValue};

/// The unit of work a run drives.
///
/// `execute` is called once per granted token, from many workers at once. `setup` and
/// `teardown` run exactly once per run, outside the hot loop.
///
/// An `Err` from `execute` (or a panic inside it) is not fatal: it is recorded as a
/// failed result and the worker moves on.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use async_trait::async_trait;
/// use pacer::{Probe, ProbeError, ProbeValue};
///
/// struct Ping;
///
/// #[async_trait]
/// impl Probe for Ping {
///     async fn execute(&self) -> Result<ProbeValue, ProbeError> {
///         tokio::time::sleep(Duration::from_millis(5)).await;
///         Ok((true, "pong").into())
///     }
/// }
/// ```
#[async_trait]
pub trait Probe: Send + Sync {
    async fn setup(&self) -> Result<(), ProbeError> {
        Ok(())
    }

    async fn execute(&self) -> Result<ProbeValue, ProbeError>;

    async fn teardown(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// [`Probe`] built from a closure; see [`probe_fn`].
pub struct FnProbe<F, Fut, T> {
    action: F,
    _marker: PhantomData<fn() -> (Fut, T)>,
}

/// Wraps an async closure as a probe.
///
/// NEVER instantiate heavy things like clients inside the closure; build them outside and
/// clone them in.
///
/// ```rust
/// use std::time::Duration;
/// let probe = pacer::probe_fn(|| async {
///     tokio::time::sleep(Duration::from_millis(5)).await;
///     true
/// });
/// ```
pub fn probe_fn<F, Fut, T>(action: F) -> FnProbe<F, Fut, T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = T> + Send,
    T: Into<ProbeValue>,
{
    FnProbe {
        action,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> Probe for FnProbe<F, Fut, T>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = T> + Send,
    T: Into<ProbeValue>,
{
    async fn execute(&self) -> Result<ProbeValue, ProbeError> {
        Ok((self.action)().await.into())
    }
}
