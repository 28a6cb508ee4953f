//! `ClusterClient` backed by a live API server
//!
//! Objects go through `DynamicObject` so any kind, including custom
//! resources, is addressable. Kind to resource mapping is discovered once per
//! (apiVersion, kind) and cached.

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{ClientError, ClusterClient, ObjectKey, Selector};
use crate::config::DeletionPropagation;
use crate::resource;

type Discovered = (ApiResource, ApiCapabilities);

/// Client for a real cluster
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    cache: Arc<Mutex<HashMap<(String, String), Discovered>>>,
}

impl KubeClient {
    /// Connect using the default kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn discover(&self, api_version: &str, kind: &str) -> Result<Discovered, ClientError> {
        let cache_key = (api_version.to_string(), kind.to_string());
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cache_key)
            .cloned();
        if let Some(found) = cached {
            return Ok(found);
        }

        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let discovered = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| map_error(e, kind, api_version))?;

        debug!(api_version = %api_version, kind = %kind, plural = %discovered.0.plural, "Discovered resource");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, discovered.clone());
        Ok(discovered)
    }

    async fn api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, caps) = self.discover(api_version, kind).await?;
        Ok(match caps.scope {
            Scope::Namespaced => match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::default_namespaced_with(self.client.clone(), &ar),
            },
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
        })
    }
}

/// Split `group/version`; the core group has no prefix
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn to_dynamic(obj: &Value) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(obj.clone())
        .map_err(|e| ClientError::Invalid(format!("invalid object format: {e}")))
}

/// Serialize back to a document, restoring type fields dropped by list calls
fn to_value(obj: DynamicObject, api_version: &str, kind: &str) -> Result<Value, ClientError> {
    let mut value = serde_json::to_value(obj)
        .map_err(|e| ClientError::Invalid(format!("failed to serialize object: {e}")))?;
    if let Some(root) = value.as_object_mut() {
        root.entry("apiVersion")
            .or_insert_with(|| Value::String(api_version.to_string()));
        root.entry("kind")
            .or_insert_with(|| Value::String(kind.to_string()));
    }
    Ok(value)
}

/// Classify a kube error and give it a readable message
fn map_error(err: kube::Error, kind: &str, name: &str) -> ClientError {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(format!("{kind} '{name}'")),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ClientError::AlreadyExists(format!("{kind} '{name}'"))
        }
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(format!("{kind} '{name}'")),
        kube::Error::Api(ae) => ClientError::Api {
            code: ae.code,
            message: improve_error_message(&err, kind, name),
        },
        _ => ClientError::Transport(improve_error_message(&err, kind, name)),
    }
}

fn improve_error_message(err: &kube::Error, kind: &str, name: &str) -> String {
    let raw = err.to_string();

    if raw.contains("Forbidden") || raw.contains("403") {
        return format!("{kind} '{name}': permission denied (check RBAC)");
    }

    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{kind} '{name}': cannot connect to Kubernetes API");
    }

    if raw.contains("timeout") || raw.contains("deadline exceeded") {
        return format!("{kind} '{name}': request timed out");
    }

    format!("{kind} '{name}': {raw}")
}

fn propagation_policy(p: DeletionPropagation) -> PropagationPolicy {
    match p {
        DeletionPropagation::Foreground => PropagationPolicy::Foreground,
        DeletionPropagation::Background => PropagationPolicy::Background,
        DeletionPropagation::Orphan => PropagationPolicy::Orphan,
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, key: &ObjectKey) -> Result<Value, ClientError> {
        let api = self
            .api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let obj = api
            .get(&key.name)
            .await
            .map_err(|e| map_error(e, &key.kind, &key.name))?;
        to_value(obj, &key.api_version, &key.kind)
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<Value>, ClientError> {
        let (ar, caps) = self.discover(&selector.api_version, &selector.kind).await?;
        let api: Api<DynamicObject> = match (&caps.scope, &selector.namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut params = ListParams::default();
        if !selector.labels.is_empty() {
            params = params.labels(&selector.label_selector());
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| map_error(e, &selector.kind, &selector.label_selector()))?;
        list.items
            .into_iter()
            .map(|obj| to_value(obj, &selector.api_version, &selector.kind))
            .collect()
    }

    async fn create(&self, obj: &Value, dry_run: bool) -> Result<Value, ClientError> {
        let key = ObjectKey::from_object(obj)?;
        let api = self
            .api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let params = PostParams {
            dry_run,
            ..PostParams::default()
        };
        let created = api
            .create(&params, &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error(e, &key.kind, &key.name))?;
        debug!(resource = %resource::describe(obj), dry_run, "Created resource");
        to_value(created, &key.api_version, &key.kind)
    }

    async fn update(&self, obj: &Value) -> Result<Value, ClientError> {
        let key = ObjectKey::from_object(obj)?;
        let api = self
            .api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let updated = api
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error(e, &key.kind, &key.name))?;
        to_value(updated, &key.api_version, &key.kind)
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        dry_run: bool,
    ) -> Result<Value, ClientError> {
        let api = self
            .api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let params = PatchParams {
            dry_run,
            ..PatchParams::default()
        };
        let patched = api
            .patch(&key.name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| map_error(e, &key.kind, &key.name))?;
        to_value(patched, &key.api_version, &key.kind)
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: DeletionPropagation,
    ) -> Result<(), ClientError> {
        let api = self
            .api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let params = DeleteParams {
            propagation_policy: Some(propagation_policy(propagation)),
            ..DeleteParams::default()
        };
        api.delete(&key.name, &params)
            .await
            .map_err(|e| map_error(e, &key.kind, &key.name))?;
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClientError> {
        let (_, caps) = self.discover(api_version, kind).await?;
        Ok(matches!(caps.scope, Scope::Namespaced))
    }
}
