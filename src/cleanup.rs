//! Teardown of resources created by a test
//!
//! Operations register every object they create; at teardown the cleaner
//! deletes them newest first and waits for each one to disappear.
//!
//! # Example
//!
//! ```ignore
//! let cleaner = Cleaner::new(Duration::from_secs(30), None, DeletionPropagation::Background);
//! cleaner.add(client.clone(), &created)?;
//! let errors = cleaner.run(Some(&mut step_report)).await;
//! ```

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{wait_for_deletion, ClientError, ClusterClient, ObjectKey};
use crate::config::DeletionPropagation;
use crate::eventually::PollError;
use crate::report::{OperationReport, OperationType, Phase, StepReport};

/// Failure to tear down one entry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to delete {resource}: {source}")]
    Delete {
        resource: String,
        #[source]
        source: ClientError,
    },

    #[error("{resource} still present after {timeout:?}")]
    Timeout { resource: String, timeout: Duration },
}

/// A resource to delete at teardown
#[derive(Clone)]
pub struct CleanupEntry {
    pub client: Arc<dyn ClusterClient>,
    pub key: ObjectKey,
}

impl std::fmt::Debug for CleanupEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupEntry").field("key", &self.key).finish()
    }
}

/// Registry of resources to delete, run in reverse registration order
pub struct Cleaner {
    timeout: Duration,
    delay: Option<Duration>,
    propagation: DeletionPropagation,
    entries: Mutex<Vec<CleanupEntry>>,
}

impl Cleaner {
    pub fn new(
        timeout: Duration,
        delay: Option<Duration>,
        propagation: DeletionPropagation,
    ) -> Self {
        Self {
            timeout,
            delay,
            propagation,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<CleanupEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `object` for deletion through `client`
    pub fn add(&self, client: Arc<dyn ClusterClient>, object: &Value) -> Result<(), ClientError> {
        let key = ObjectKey::from_object(object)?;
        debug!(resource = %key, "Registered for cleanup");
        self.entries().push(CleanupEntry { client, key });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Delete every registered entry, newest first
    ///
    /// Every entry is attempted; the returned list holds one error per entry
    /// whose delete or wait genuinely failed. A delete answered with NotFound
    /// counts as done. Entries are consumed.
    pub async fn run(&self, mut report: Option<&mut StepReport>) -> Vec<CleanupError> {
        let entries: Vec<CleanupEntry> = std::mem::take(&mut *self.entries());
        if entries.is_empty() {
            return Vec::new();
        }

        if let Some(delay) = self.delay {
            debug!(delay = ?delay, "Waiting before cleanup");
            tokio::time::sleep(delay).await;
        }

        info!(count = entries.len(), "Running cleanup");
        let mut errors = Vec::new();
        for entry in entries.iter().rev() {
            let op = OperationReport::start(
                format!("delete {}", entry.key),
                OperationType::Delete,
                Phase::Cleanup,
            );
            let result = self.delete(entry).await;
            if let Err(e) = &result {
                warn!(resource = %entry.key, error = %e, "Cleanup failed");
            }
            let op = op.finish(result.as_ref().err().map(ToString::to_string));
            if let Some(report) = report.as_deref_mut() {
                report.add(op);
            }
            if let Err(e) = result {
                errors.push(e);
            }
        }
        errors
    }

    async fn delete(&self, entry: &CleanupEntry) -> Result<(), CleanupError> {
        let resource = entry.key.to_string();
        let timed_out = || CleanupError::Timeout {
            resource: resource.clone(),
            timeout: self.timeout,
        };
        let deadline = tokio::time::Instant::now() + self.timeout;

        match tokio::time::timeout_at(deadline, entry.client.delete(&entry.key, self.propagation))
            .await
        {
            Err(_) => return Err(timed_out()),
            Ok(Err(e)) if e.is_not_found() => return Ok(()),
            Ok(Err(source)) => {
                return Err(CleanupError::Delete {
                    resource: resource.clone(),
                    source,
                })
            }
            Ok(Ok(())) => {}
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match wait_for_deletion(
            entry.client.as_ref(),
            &entry.key,
            remaining,
            &CancellationToken::new(),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(source)) => Err(CleanupError::Delete {
                resource: resource.clone(),
                source,
            }),
            Err(_) => Err(timed_out()),
        }
    }
}
