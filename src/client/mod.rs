//! Cluster client abstraction
//!
//! The engine talks to the cluster only through [`ClusterClient`], a
//! key-addressed, kind-typed view of an eventually-consistent object store.
//! [`KubeClient`] implements it against a real API server and
//! [`MemoryClient`] against an in-process store for tests.

mod kubernetes;
mod memory;

pub use self::kubernetes::KubeClient;
pub use self::memory::{Call, MemoryClient, Verb};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::DeletionPropagation;
use crate::eventually::{eventually, PollError, Progress};
use crate::resource;

/// Interval of the wait-for-deletion loop
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cluster client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("cannot reach cluster: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }
}

/// Address of a single object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of a document carrying `metadata.name`
    pub fn from_object(obj: &Value) -> Result<Self, ClientError> {
        let api_version = resource::api_version(obj)
            .ok_or_else(|| ClientError::Invalid("object has no apiVersion".to_string()))?;
        let kind = resource::kind(obj)
            .ok_or_else(|| ClientError::Invalid("object has no kind".to_string()))?;
        let name = resource::name(obj)
            .ok_or_else(|| ClientError::Invalid("object has no metadata.name".to_string()))?;
        Ok(Self::new(api_version, kind, resource::namespace(obj), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Label selection over one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Selector built from a document's kind, namespace and `metadata.labels`
    pub fn from_object(obj: &Value) -> Result<Self, ClientError> {
        let api_version = resource::api_version(obj)
            .ok_or_else(|| ClientError::Invalid("object has no apiVersion".to_string()))?;
        let kind = resource::kind(obj)
            .ok_or_else(|| ClientError::Invalid("object has no kind".to_string()))?;
        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: resource::namespace(obj).map(str::to_string),
            labels: resource::labels(obj),
        })
    }

    /// `k=v,k2=v2` form used by the API server
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether `obj` falls under this selector
    pub fn matches(&self, obj: &Value) -> bool {
        if resource::api_version(obj) != Some(self.api_version.as_str())
            || resource::kind(obj) != Some(self.kind.as_str())
        {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if resource::namespace(obj) != Some(ns.as_str()) {
                return false;
            }
        }
        let labels = resource::labels(obj);
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Operations the engine needs from a cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object, `ClientError::NotFound` when absent
    async fn get(&self, key: &ObjectKey) -> Result<Value, ClientError>;

    /// List objects under a selector
    async fn list(&self, selector: &Selector) -> Result<Vec<Value>, ClientError>;

    /// Create an object; with `dry_run` the server validates without persisting
    async fn create(&self, obj: &Value, dry_run: bool) -> Result<Value, ClientError>;

    async fn update(&self, obj: &Value) -> Result<Value, ClientError>;

    /// Apply a JSON merge patch
    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        dry_run: bool,
    ) -> Result<Value, ClientError>;

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: DeletionPropagation,
    ) -> Result<(), ClientError>;

    /// Whether the kind lives inside namespaces
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClientError>;
}

/// Objects addressed by `template`
///
/// A template with `metadata.name` resolves to at most one object; one
/// without resolves to every object matching its labels. An unknown kind
/// resolves to nothing.
pub async fn read_candidates(
    client: &dyn ClusterClient,
    template: &Value,
) -> Result<Vec<Value>, ClientError> {
    if resource::name(template).is_some() {
        let key = ObjectKey::from_object(template)?;
        match client.get(&key).await {
            Ok(obj) => Ok(vec![obj]),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    } else {
        match client.list(&Selector::from_object(template)?).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }
}

/// Poll until `key` is gone
pub async fn wait_for_deletion(
    client: &dyn ClusterClient,
    key: &ObjectKey,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), PollError<ClientError>> {
    eventually(move || async move {
        match client.get(key).await {
            Ok(_) => Ok(Progress::pending(format!("{key} still exists"))),
            Err(e) if e.is_not_found() => Ok(Progress::Ready(())),
            Err(e) => Err(e),
        }
    })
    .timeout(timeout)
    .interval(DELETION_POLL_INTERVAL)
    .cancel_on(cancel.clone())
    .await_condition()
    .await
}

/// `desired` pinned to the live resource version of `actual`
///
/// Used as the body of a replace and as the merge patch of an apply, so a
/// concurrent writer surfaces as a conflict.
pub fn with_resource_version(actual: &Value, desired: &Value) -> Value {
    let mut obj = desired.clone();
    if let Some(rv) = actual.pointer("/metadata/resourceVersion").cloned() {
        if let Some(meta) = obj
            .as_object_mut()
            .and_then(|root| root.get_mut("metadata"))
            .and_then(Value::as_object_mut)
        {
            meta.insert("resourceVersion".to_string(), rv);
        }
    }
    obj
}
