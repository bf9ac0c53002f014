//! Retry primitives shared by the transactional sink.
//!
//! A [strategy] is just an [Iterator] of [Duration]s: every item is the cool-off before the next
//! attempt, and the end of the iterator means the attempts are exhausted. [retry::Retry] drives an
//! [Operation] with such a strategy until it succeeds, the [Condition] rejects the error, or the
//! strategy runs dry.
//!
//! [Duration]: std::time::Duration

use std::future::Future;

/// Backoff strategies.
pub mod strategy;

/// Drives an [Operation] with a backoff strategy.
pub mod retry;

pub use retry::{Retry, RetryError};

/// A unit of work which can be started any number of times.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    /// Start a new attempt.
    fn run(&mut self) -> Self::Future;
}

impl<T, E, Fut, F> Operation for F
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Item = T;
    type Error = E;
    type Future = Fut;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt should be retried.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
