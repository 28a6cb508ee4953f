//! Rich deadline errors with debugging context
//!
//! When a convergence loop runs out of time the operation surfaces a
//! `WaitError` carrying what was being waited for, the last observed state
//! and the mismatches reported by the final poll.
//!
//! # Example
//!
//! ```ignore
//! match executor.exec(&bindings, &token).await {
//!     Err(OperationError::DeadlineExceeded(err)) => {
//!         println!("Resource: {}", err.resource);
//!         println!("Last state: {}", err.last_state);
//!         for detail in &err.details {
//!             println!("  {detail}");
//!         }
//!     }
//!     _ => {}
//! }
//! ```

use std::fmt;
use std::time::Duration;

use crate::eventually::PollError;

/// Rich error context for operations that exceeded their deadline
#[derive(Debug, Clone, PartialEq)]
pub struct WaitError {
    /// Verb that was polling (e.g. "assert", "delete")
    pub operation: String,
    /// Resource reference (e.g. "apps/v1/Deployment/ns/web")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    /// Mismatches or other details from the last poll
    pub details: Vec<String>,
}

impl WaitError {
    pub fn new(
        operation: impl Into<String>,
        resource: impl Into<String>,
        timeout: Duration,
        elapsed: Duration,
    ) -> Self {
        Self {
            operation: operation.into(),
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
            details: Vec::new(),
        }
    }

    /// Set the last observed state
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    /// Add details to the error
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    /// Build from a poll loop that ran out of time or was cancelled
    ///
    /// Returns `None` for aborted loops, which are not deadline failures.
    pub fn from_poll<E>(
        operation: &str,
        resource: &str,
        state: &str,
        err: &PollError<E>,
    ) -> Option<Self> {
        let wait = match err {
            PollError::DeadlineExceeded {
                elapsed, timeout, ..
            } => WaitError::new(operation, resource, *timeout, *elapsed).with_state(state),
            PollError::Cancelled { elapsed, .. } => {
                WaitError::new(operation, resource, *elapsed, *elapsed)
                    .with_state(format!("{state} (cancelled)"))
            }
            PollError::Aborted(_) => return None,
        };
        Some(wait.with_details(err.last_details().to_vec()))
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{} deadline exceeded for {}", self.operation, self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        writeln!(f, "└─ Timeout: {:?}", self.timeout)?;

        if !self.details.is_empty() {
            writeln!(f)?;
            writeln!(f, "Last poll:")?;
            for (i, detail) in self.details.iter().enumerate() {
                let prefix = if i == self.details.len() - 1 {
                    "└─"
                } else {
                    "├─"
                };
                writeln!(f, "{prefix} {detail}")?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for WaitError {}
