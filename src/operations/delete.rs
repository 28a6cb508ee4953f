use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{bounded, Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::client::{read_candidates, wait_for_deletion, ObjectKey};
use crate::config::DeletionPropagation;
use crate::resource;
use crate::wait::WaitError;

/// Delete an object, or every object under a label selector, and wait until
/// each one is gone
pub struct Delete {
    target: Target,
    object: Value,
    propagation: DeletionPropagation,
}

impl Delete {
    pub fn new(target: Target, object: Value, propagation: DeletionPropagation) -> Self {
        Self {
            target,
            object,
            propagation,
        }
    }

    fn deadline_exceeded(&self, resource: &str, started: Instant) -> OperationError {
        OperationError::DeadlineExceeded(
            WaitError::new("delete", resource, self.target.timeout, started.elapsed())
                .with_state("delete request pending"),
        )
    }
}

#[async_trait]
impl Operation for Delete {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let template = self.target.prepare(&self.object, bindings).await?;
        let client = self.target.client.as_ref();
        let started = Instant::now();
        let deadline = started + self.target.timeout;
        let description = resource::describe(&template);

        let candidates = match bounded(deadline, cancel, read_candidates(client, &template)).await {
            Some(found) => found?,
            None => return Err(self.deadline_exceeded(&description, started)),
        };
        if candidates.is_empty() {
            debug!(resource = %description, "Nothing to delete");
            return Ok(Outputs::new());
        }

        let mut errors = Vec::new();
        let mut pending = Vec::new();
        for candidate in &candidates {
            let key = ObjectKey::from_object(candidate)?;
            match bounded(deadline, cancel, client.delete(&key, self.propagation)).await {
                None => errors.push(self.deadline_exceeded(&key.to_string(), started)),
                Some(Ok(())) => pending.push(key),
                Some(Err(e)) if e.is_not_found() => {}
                Some(Err(e)) => errors.push(OperationError::Client(e)),
            }
        }

        for key in &pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = wait_for_deletion(client, key, remaining, cancel).await {
                let e = e.map_aborted(OperationError::Client);
                errors.push(OperationError::from_poll(
                    "delete",
                    &key.to_string(),
                    "still present",
                    e,
                ));
            }
        }

        match OperationError::aggregate(errors) {
            Some(err) => Err(err),
            None => {
                info!(resource = %description, count = candidates.len(), "Resources deleted");
                Ok(Outputs::new())
            }
        }
    }
}
