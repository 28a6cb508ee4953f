use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::cleanup::Cleaner;
use crate::client::ObjectKey;
use crate::eventually::{eventually, Progress};
use crate::resource;

/// Create an object that must not exist yet
pub struct Create {
    target: Target,
    object: Value,
    cleaner: Option<Arc<Cleaner>>,
    should_fail: bool,
    dry_run: bool,
}

impl Create {
    pub fn new(target: Target, object: Value) -> Self {
        Self {
            target,
            object,
            cleaner: None,
            should_fail: false,
            dry_run: false,
        }
    }

    pub fn cleaner(mut self, cleaner: Option<Arc<Cleaner>>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Succeed only when the object cannot be created
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
impl Operation for Create {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        let obj = self.target.prepare(&self.object, bindings).await?;
        let key = ObjectKey::from_object(&obj)?;
        let resource = resource::describe(&obj);
        let client = self.target.client.as_ref();
        let desired = &obj;
        let key_ref = &key;
        let dry_run = self.dry_run;
        let resource_ref = &resource;

        let created = eventually(move || async move {
            match client.get(key_ref).await {
                Ok(_) => Err(OperationError::AlreadyExists(resource_ref.clone())),
                Err(e) if e.is_not_found() => {
                    client.create(desired, dry_run).await?;
                    Ok(Progress::Ready(()))
                }
                Err(e) => Err(OperationError::Client(e)),
            }
        })
        .timeout(self.target.timeout)
        .interval(self.target.poll_interval)
        .cancel_on(cancel.clone())
        .await_condition()
        .await
        .map_err(|e| OperationError::from_poll("create", &key.to_string(), "not created", e));

        match created {
            Ok(()) => {
                if let (Some(cleaner), false) = (&self.cleaner, self.dry_run) {
                    cleaner.add(self.target.client.clone(), &obj)?;
                }
                info!(resource = %resource, dry_run = self.dry_run, "Resource created");
                if self.should_fail {
                    return Err(OperationError::ExpectedFailure(resource));
                }
                Ok(Outputs::new())
            }
            Err(e @ (OperationError::AlreadyExists(_) | OperationError::Client(_)))
                if self.should_fail =>
            {
                debug!(resource = %resource, error = %e, "Create failed as expected");
                Ok(Outputs::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{cm, target};
    use super::*;
    use crate::client::{ClientError, MemoryClient, Verb};
    use crate::config::DeletionPropagation;
    use serde_json::json;
    use std::time::Duration;

    fn cleaner() -> Arc<Cleaner> {
        Arc::new(Cleaner::new(
            Duration::from_secs(5),
            None,
            DeletionPropagation::Background,
        ))
    }

    #[tokio::test]
    async fn test_create_registers_cleanup() {
        let memory = MemoryClient::new();
        let cleaner = cleaner();
        Create::new(target(&memory), cm("a"))
            .cleaner(Some(cleaner.clone()))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(memory.count(Verb::Create), 1);
        assert_eq!(cleaner.len(), 1);
    }

    #[tokio::test]
    async fn test_create_dry_run_leaves_cluster_untouched() {
        let memory = MemoryClient::new();
        let cleaner = cleaner();
        Create::new(target(&memory), cm("a"))
            .cleaner(Some(cleaner.clone()))
            .dry_run(true)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(memory.count(Verb::Create), 1);
        assert!(memory.is_empty());
        assert!(cleaner.is_empty());
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let memory = MemoryClient::new();
        memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns"}}));

        let err = Create::new(target(&memory), cm("a"))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::AlreadyExists(_)));
        assert_eq!(memory.count(Verb::Create), 0);

        Create::new(target(&memory), cm("a"))
            .should_fail(true)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_should_fail_inverts_outcome() {
        let memory = MemoryClient::new();
        memory.fail_next(
            Verb::Create,
            ClientError::Api {
                code: 422,
                message: "invalid".to_string(),
            },
        );
        Create::new(target(&memory), cm("a"))
            .should_fail(true)
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();

        let cleaner = cleaner();
        let err = Create::new(target(&memory), cm("b"))
            .should_fail(true)
            .cleaner(Some(cleaner.clone()))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::ExpectedFailure(_)));
        assert_eq!(cleaner.len(), 1);
    }
}
