//! Common types for the ReachGuard environment abstraction.

use std::time::Duration;

/// A message tagged with the context time at which it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    /// Context time (`SupervisorContext::now()`) at creation
    pub stamp: Duration,

    /// The message body
    pub value: T,
}

impl<T> Stamped<T> {
    /// Wraps a value with its timestamp.
    pub fn new(stamp: Duration, value: T) -> Self {
        Self { stamp, value }
    }

    /// Age of the message relative to `now`, saturating at zero.
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.stamp)
    }

    /// Maps the body while keeping the stamp.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Stamped<U> {
        Stamped {
            stamp: self.stamp,
            value: f(self.value),
        }
    }
}
