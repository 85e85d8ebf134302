use std::future::Future;

use chrono::{DateTime, Local};

/// Source of wall-clock time for the scheduler. Lets the schedule be driven
/// by a manual clock in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Local>;

    /// Resolve once `deadline` has been reached. Resolves immediately if it
    /// already has.
    fn sleep_until(&self, deadline: DateTime<Local>) -> impl Future<Output = ()> + Send;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep_until(&self, deadline: DateTime<Local>) -> impl Future<Output = ()> + Send {
        // Negative durations (deadline already passed) fail to convert.
        let delay = (deadline - Local::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay)
    }
}
