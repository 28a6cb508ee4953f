//! Bounded polling loops
//!
//! Every convergence loop in the engine goes through `eventually`: a condition
//! is re-evaluated at a fixed interval until it reports `Ready`, returns a
//! hard error, or the deadline (or an external cancellation) fires.
//!
//! # Example
//!
//! ```ignore
//! use kuvio::eventually::{eventually, Progress};
//! use std::time::Duration;
//!
//! let obj = eventually(move || async move {
//!     match client.get(&key).await {
//!         Ok(obj) => Ok(Progress::Ready(obj)),
//!         Err(e) if e.is_not_found() => Ok(Progress::pending("not found")),
//!         Err(e) => Err(e),
//!     }
//! })
//! .timeout(Duration::from_secs(30))
//! .interval(Duration::from_secs(1))
//! .cancel_on(token.clone())
//! .await_condition()
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Progress<T> {
    /// The condition holds; stop polling
    Ready(T),
    /// Not there yet; the details describe the last observed state
    Pending(Vec<String>),
}

impl<T> Progress<T> {
    /// Pending with a single detail line
    pub fn pending(detail: impl Into<String>) -> Self {
        Progress::Pending(vec![detail.into()])
    }
}

/// Error type for polling loops
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("condition not met within {timeout:?} ({attempts} attempts over {elapsed:?})")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        timeout: Duration,
        /// Details reported by the last pending attempt
        last: Vec<String>,
    },

    #[error("cancelled after {attempts} attempts over {elapsed:?}")]
    Cancelled {
        attempts: u32,
        elapsed: Duration,
        last: Vec<String>,
    },

    #[error("{0}")]
    Aborted(E),
}

impl<E> PollError<E> {
    /// Details of the last pending attempt, empty for aborted loops
    pub fn last_details(&self) -> &[String] {
        match self {
            PollError::DeadlineExceeded { last, .. } | PollError::Cancelled { last, .. } => last,
            PollError::Aborted(_) => &[],
        }
    }

    /// Convert the error of an aborted loop
    pub fn map_aborted<E2>(self, f: impl FnOnce(E) -> E2) -> PollError<E2> {
        match self {
            PollError::DeadlineExceeded {
                attempts,
                elapsed,
                timeout,
                last,
            } => PollError::DeadlineExceeded {
                attempts,
                elapsed,
                timeout,
                last,
            },
            PollError::Cancelled {
                attempts,
                elapsed,
                last,
            } => PollError::Cancelled {
                attempts,
                elapsed,
                last,
            },
            PollError::Aborted(e) => PollError::Aborted(f(e)),
        }
    }
}

/// Builder for a bounded polling loop
pub struct Eventually<F> {
    condition: F,
    timeout: Duration,
    interval: Duration,
    cancel: Option<CancellationToken>,
}

/// Create a polling loop around `condition`
///
/// Default timeout: 30 seconds
/// Default interval: 1 second
pub fn eventually<F>(condition: F) -> Eventually<F> {
    Eventually {
        condition,
        timeout: Duration::from_secs(30),
        interval: Duration::from_secs(1),
        cancel: None,
    }
}

impl<F> Eventually<F> {
    /// Set the timeout duration
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Abort the loop when `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Run the loop
    ///
    /// The first attempt runs immediately. Every attempt is raced against the
    /// deadline and the cancellation token, so a slow remote call cannot
    /// overrun the budget.
    pub async fn await_condition<Fut, T, E>(mut self) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Progress<T>, E>>,
    {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let token = self.cancel.take().unwrap_or_default();
        let mut attempts = 0u32;
        let mut last = Vec::new();

        loop {
            if token.is_cancelled() {
                return Err(PollError::Cancelled {
                    attempts,
                    elapsed: start.elapsed(),
                    last,
                });
            }

            attempts += 1;
            let attempt = tokio::select! {
                _ = token.cancelled() => {
                    return Err(PollError::Cancelled {
                        attempts,
                        elapsed: start.elapsed(),
                        last,
                    });
                }
                result = timeout_at(deadline, (self.condition)()) => result,
            };

            match attempt {
                Err(_elapsed) => {
                    return Err(PollError::DeadlineExceeded {
                        attempts,
                        elapsed: start.elapsed(),
                        timeout: self.timeout,
                        last,
                    });
                }
                Ok(Err(e)) => return Err(PollError::Aborted(e)),
                Ok(Ok(Progress::Ready(value))) => return Ok(value),
                Ok(Ok(Progress::Pending(details))) => last = details,
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::DeadlineExceeded {
                    attempts,
                    elapsed: start.elapsed(),
                    timeout: self.timeout,
                    last,
                });
            }

            let wake = std::cmp::min(now + self.interval, deadline);
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(PollError::Cancelled {
                        attempts,
                        elapsed: start.elapsed(),
                        last,
                    });
                }
                _ = sleep_until(wake) => {}
            }
        }
    }
}

/// Sleep for `duration` unless `token` is cancelled first
///
/// Returns `false` when the sleep was interrupted.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
