//! One-shot timer service
//!
//! The client never uses a recurring timer. Every handler that needs to run
//! again schedules itself once more, and re-checks the client state when it
//! fires. A shutdown racing with a pending timer is therefore absorbed by the
//! handler turning into a no-op.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;

use crate::error::{Result, RtpProxyError};

/// Work item run by a [`Scheduler`] once its delay expires
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedule-once-with-delay service
pub trait Scheduler: Send + Sync {
    /// Run `task` once, after `delay`
    fn schedule_once(&self, delay: Duration, task: ScheduledTask);
}

/// Scheduler backed by the tokio timer
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler bound to the given runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler bound to the runtime of the calling context
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| RtpProxyError::config(format!("No tokio runtime available: {}", e)))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: ScheduledTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokioScheduler")
    }
}

/// Perturb `base` by a uniformly distributed factor within `±jitter`
///
/// The factor never drops below zero, so a jitter of 1 or more can shrink
/// the delay to nothing but cannot make it negative.
pub fn randomize(base: Duration, jitter: f64) -> Duration {
    let u: f64 = rand::thread_rng().gen();
    let factor = 1.0 + jitter * (1.0 - 2.0 * u);
    if factor.is_finite() && factor > 0.0 {
        base.mul_f64(factor)
    } else {
        Duration::ZERO
    }
}
