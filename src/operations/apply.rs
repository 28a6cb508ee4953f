use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::cleanup::Cleaner;
use crate::client::{with_resource_version, ObjectKey};
use crate::eventually::{eventually, Progress};
use crate::resource;

enum Applied {
    Created,
    Patched,
}

/// Create the object when absent, merge-patch it otherwise
pub struct Apply {
    target: Target,
    object: Value,
    cleaner: Option<Arc<Cleaner>>,
    should_fail: bool,
    dry_run: bool,
}

impl Apply {
    pub fn new(target: Target, object: Value) -> Self {
        Self {
            target,
            object,
            cleaner: None,
            should_fail: false,
            dry_run: false,
        }
    }

    /// Register created objects for teardown
    pub fn cleaner(mut self, cleaner: Option<Arc<Cleaner>>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Succeed only when the cluster rejects the object
    pub fn should_fail(mut self, should_fail: bool) -> Self {
        self.should_fail = should_fail;
        self
    }

    /// Send server-side dry-run requests; nothing is persisted or registered
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl Operation for Apply {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let obj = self.target.prepare(&self.object, bindings).await?;
        let key = ObjectKey::from_object(&obj)?;
        let client = self.target.client.as_ref();
        let desired = &obj;
        let key_ref = &key;
        let dry_run = self.dry_run;

        let result = eventually(move || async move {
            let applied = match client.get(key_ref).await {
                Err(e) if e.is_not_found() => {
                    client.create(desired, dry_run).await?;
                    Applied::Created
                }
                Err(e) => return Err(OperationError::Client(e)),
                Ok(actual) => {
                    let patch = with_resource_version(&actual, desired);
                    client.patch(key_ref, &patch, dry_run).await?;
                    Applied::Patched
                }
            };
            Ok(Progress::Ready(applied))
        })
        .timeout(self.target.timeout)
        .interval(self.target.poll_interval)
        .cancel_on(cancel.clone())
        .await_condition()
        .await
        .map_err(|e| OperationError::from_poll("apply", &key.to_string(), "not applied", e));

        let resource = resource::describe(&obj);
        match result {
            Ok(applied) => {
                if let Applied::Created = applied {
                    if let (Some(cleaner), false) = (&self.cleaner, self.dry_run) {
                        cleaner.add(self.target.client.clone(), &obj)?;
                    }
                    info!(resource = %resource, dry_run = self.dry_run, "Resource created");
                } else {
                    info!(resource = %resource, dry_run = self.dry_run, "Resource patched");
                }
                if self.should_fail {
                    return Err(OperationError::ExpectedFailure(resource));
                }
                Ok(Outputs::new())
            }
            Err(OperationError::Client(e)) if self.should_fail => {
                debug!(resource = %resource, error = %e, "Apply failed as expected");
                Ok(Outputs::new())
            }
            Err(e) => Err(e),
        }
    }
}
