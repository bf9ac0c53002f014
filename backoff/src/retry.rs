use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Condition, Operation};

/// Why a [Retry] gave up. Every variant keeps the last error and how many times the operation ran.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError<E> {
    /// The [Condition] refused to retry the error.
    #[error("non-retryable error after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u16 },

    /// The backoff strategy ran out of delays.
    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u16 },

    /// The cancellation token fired while cooling off.
    #[error("cancelled after {attempts} attempt(s): {error}")]
    Cancelled { error: E, attempts: u16 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u16 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. }
            | RetryError::Exhausted { error, .. }
            | RetryError::Cancelled { error, .. } => error,
        }
    }
}

/// Runs an [Operation] until it succeeds, the [Condition] refuses the error, the backoff runs dry,
/// or the (optional) cancellation token fires during a cool-off.
///
/// ```no_rust
///  run ──Ok──────────────────────────────> Ok(item)
///   │
///   Err ── condition? ──no──────────────> Permanent
///              │
///             yes ── backoff.next()? ─None──> Exhausted
///                          │
///                        Some(d) ── sleep(d) | cancelled ──> Cancelled
///                                      │
///                                     run
/// ```
pub struct Retry<I, O, C> {
    backoff: I,
    operation: O,
    condition: C,
    cancel: Option<CancellationToken>,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II>(backoff: II, operation: O, condition: C) -> Self
    where
        II: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            backoff: backoff.into_iter(),
            operation,
            condition,
            cancel: None,
        }
    }

    /// Abort the cool-off (and hence the retry loop) once `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub async fn run(mut self) -> Result<O::Item, RetryError<O::Error>> {
        let mut attempts: u16 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let error = match self.operation.run().await {
                Ok(item) => return Ok(item),
                Err(error) => error,
            };

            if !self.condition.can_retry(&error) {
                return Err(RetryError::Permanent { error, attempts });
            }

            let Some(delay) = self.backoff.next() else {
                return Err(RetryError::Exhausted { error, attempts });
            };

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Err(RetryError::Cancelled { error, attempts });
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU16, Ordering};

    use super::*;
    use crate::strategy::fixed::Interval;

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = Retry::new(
            Interval::from_millis(1),
            || future::ready(Ok::<_, ()>(7)),
            |_: &()| true,
        )
        .run()
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU16::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            Interval::from_millis(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), _>("boom"))
            },
            |_: &&str| false,
        )
        .run()
        .await;

        assert_eq!(
            result,
            Err(RetryError::Permanent {
                error: "boom",
                attempts: 1
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_counts_the_first_run() {
        let calls = Arc::new(AtomicU16::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            Interval::from_millis(1).take(3),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(Err::<(), u16>(n))
            },
            |_: &u16| true,
        )
        .run()
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { .. }));
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.into_inner(), 4);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU16::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            Interval::from_millis(1).take(5),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(if n < 2 { Err("flaky") } else { Ok(n) })
            },
            |_: &&str| true,
        )
        .run()
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn cancellation_stops_cool_off() {
        let token = CancellationToken::new();
        token.cancel();
        let result = Retry::new(
            Interval::from_millis(60_000),
            || future::ready(Err::<(), _>("down")),
            |_: &&str| true,
        )
        .cancel_on(token)
        .run()
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
