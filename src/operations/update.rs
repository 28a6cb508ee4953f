use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Operation, OperationError, Outputs, Target};
use crate::bindings::Bindings;
use crate::client::{with_resource_version, ClusterClient, ObjectKey};
use crate::eventually::{eventually, Progress};
use crate::resource;

#[derive(Clone, Copy)]
enum Mode {
    Update,
    Patch,
}

impl Mode {
    fn verb(self) -> &'static str {
        match self {
            Mode::Update => "update",
            Mode::Patch => "patch",
        }
    }
}

/// Modify an existing object; a missing target is a hard failure
async fn modify(
    mode: Mode,
    target: &Target,
    object: &Value,
    bindings: &Bindings,
    cancel: &CancellationToken,
) -> Result<Outputs, OperationError> {
    let obj = target.prepare(object, bindings).await?;
    let key = ObjectKey::from_object(&obj)?;
    let resource = resource::describe(&obj);
    let client: &dyn ClusterClient = target.client.as_ref();
    let desired = &obj;
    let key_ref = &key;
    let resource_ref = &resource;

    eventually(move || async move {
        let actual = match client.get(key_ref).await {
            Ok(actual) => actual,
            Err(e) if e.is_not_found() => {
                return Err(OperationError::NotFound(resource_ref.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let pinned = with_resource_version(&actual, desired);
        match mode {
            Mode::Update => client.update(&pinned).await?,
            Mode::Patch => client.patch(key_ref, &pinned, false).await?,
        };
        Ok::<_, OperationError>(Progress::Ready(()))
    })
    .timeout(target.timeout)
    .interval(target.poll_interval)
    .cancel_on(cancel.clone())
    .await_condition()
    .await
    .map_err(|e| OperationError::from_poll(mode.verb(), &resource, "not modified", e))?;

    info!(resource = %resource, operation = mode.verb(), "Resource modified");
    Ok(Outputs::new())
}

/// Replace an existing object
pub struct Update {
    target: Target,
    object: Value,
}

impl Update {
    pub fn new(target: Target, object: Value) -> Self {
        Self { target, object }
    }
}

#[async_trait]
impl Operation for Update {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        modify(Mode::Update, &self.target, &self.object, bindings, cancel).await
    }
}

/// Merge-patch an existing object
pub struct Patch {
    target: Target,
    object: Value,
}

impl Patch {
    pub fn new(target: Target, object: Value) -> Self {
        Self { target, object }
    }
}

#[async_trait]
impl Operation for Patch {
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError> {
        modify(Mode::Patch, &self.target, &self.object, bindings, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{cm, target};
    use super::*;
    use crate::client::{MemoryClient, Verb};
    use serde_json::json;

    fn existing(memory: &MemoryClient) -> ObjectKey {
        memory.insert(json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "ns", "labels": {"keep": "me"}},
            "data": {"key": "old"}}));
        ObjectKey::new("v1", "ConfigMap", Some("ns"), "a")
    }

    #[tokio::test]
    async fn test_update_replaces_object() {
        let memory = MemoryClient::new();
        let key = existing(&memory);

        Update::new(target(&memory), cm("a"))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(memory.count(Verb::Update), 1);
        let stored = memory.object(&key).unwrap();
        assert_eq!(stored["data"], json!({"key": "value"}));
        assert!(stored.pointer("/metadata/labels").is_none());
    }

    #[tokio::test]
    async fn test_patch_merges_into_object() {
        let memory = MemoryClient::new();
        let key = existing(&memory);

        Patch::new(target(&memory), cm("a"))
            .exec(&Bindings::new(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(memory.count(Verb::Patch), 1);
        let stored = memory.object(&key).unwrap();
        assert_eq!(stored["data"], json!({"key": "value"}));
        assert_eq!(stored["metadata"]["labels"], json!({"keep": "me"}));
    }

    #[tokio::test]
    async fn test_missing_target_is_hard_failure() {
        let memory = MemoryClient::new();
        for op in [
            Box::new(Update::new(target(&memory), cm("a"))) as Box<dyn Operation>,
            Box::new(Patch::new(target(&memory), cm("a"))),
        ] {
            let err = op
                .exec(&Bindings::new(), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, OperationError::NotFound(_)));
        }
        assert_eq!(memory.count(Verb::Get), 2);
    }
}
