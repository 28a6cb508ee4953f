//! Operation executors
//!
//! One executor per verb. Resource executors run inside a bounded polling
//! loop (see [`crate::eventually`]): hard API errors abort immediately,
//! while transient states (missing or non-matching candidates) are retried
//! until the operation's deadline. A deadline or a cancelled run surfaces as
//! [`OperationError::DeadlineExceeded`], kept distinct from hard failures.

mod apply;
mod assert;
mod collect;
mod command;
mod create;
mod delete;
mod sleep;
mod update;
mod wait;

pub use apply::Apply;
pub use assert::{Assert, Error};
pub use collect::{Events, Get};
pub use command::Command;
pub use create::Create;
pub use delete::Delete;
pub use sleep::Sleep;
pub use update::{Patch, Update};
pub use wait::Wait;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::bindings::{BindingError, Bindings};
use crate::client::{ClientError, ClusterClient};
use crate::eventually::PollError;
use crate::matching::MatchError;
use crate::resource::{self, ResourceError};
use crate::wait::WaitError;

/// Bindings produced by an operation, in registration order
pub type Outputs = Vec<(String, Value)>;

/// Operation failures
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Hard error from the cluster; never retried
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("{0}")]
    DeadlineExceeded(WaitError),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}: expected an error but the operation succeeded")]
    ExpectedFailure(String),

    #[error("check failed: {0}")]
    Check(#[from] MatchError),

    #[error("{0}")]
    Command(String),

    #[error(transparent)]
    InvalidResource(#[from] ResourceError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("failed to render output: {0}")]
    Render(String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<OperationError>),
}

fn join_errors(errors: &[OperationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl OperationError {
    /// Whether the failure is a time budget running out (or a cancelled run)
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            OperationError::DeadlineExceeded(_) => true,
            OperationError::Aggregate(errors) => {
                errors.iter().any(OperationError::is_deadline_exceeded)
            }
            _ => false,
        }
    }

    /// Collapse a list of failures; `None` when empty
    pub(crate) fn aggregate(mut errors: Vec<OperationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(OperationError::Aggregate(errors)),
        }
    }

    /// Failure of a polling loop
    pub(crate) fn from_poll(
        operation: &str,
        resource: &str,
        state: &str,
        err: PollError<OperationError>,
    ) -> Self {
        match err {
            PollError::Aborted(e) => e,
            other => OperationError::DeadlineExceeded(
                WaitError::from_poll(operation, resource, state, &other).unwrap_or_else(|| {
                    WaitError::new(operation, resource, Duration::ZERO, Duration::ZERO)
                }),
            ),
        }
    }
}

/// Run one cluster request bounded by `deadline` and `cancel`
///
/// `None` when the deadline passed or the run was cancelled first.
pub(crate) async fn bounded<T, F>(
    deadline: Instant,
    cancel: &CancellationToken,
    request: F,
) -> Option<Result<T, ClientError>>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = timeout_at(deadline, request) => result.ok(),
    }
}

/// An executable operation
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run against `bindings`, returning the bindings it produced
    async fn exec(
        &self,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<Outputs, OperationError>;
}

/// Where and how a resource executor runs
#[derive(Clone)]
pub struct Target {
    pub client: Arc<dyn ClusterClient>,
    /// Namespace given to namespaced objects that declare none
    pub namespace: Option<String>,
    /// Substitute `"$name"` references before executing
    pub templating: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("namespace", &self.namespace)
            .field("templating", &self.templating)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Target {
    pub fn new(client: Arc<dyn ClusterClient>, timeout: Duration) -> Self {
        Self {
            client,
            namespace: None,
            templating: true,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn templating(mut self, enabled: bool) -> Self {
        self.templating = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resolve references, validate and namespace a document
    pub(crate) async fn prepare(
        &self,
        object: &Value,
        bindings: &Bindings,
    ) -> Result<Value, OperationError> {
        let mut obj = if self.templating {
            bindings.resolve_value(object)?
        } else {
            object.clone()
        };
        resource::validate(&obj)?;

        if let Some(ns) = &self.namespace {
            if resource::namespace(&obj).is_none() {
                let api_version = resource::api_version(&obj).unwrap_or_default();
                let kind = resource::kind(&obj).unwrap_or_default();
                if self.client.is_namespaced(api_version, kind).await? {
                    resource::set_namespace(&mut obj, ns)?;
                }
            }
        }
        Ok(obj)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::client::MemoryClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_prepare_sets_namespace_on_namespaced_kinds() {
        let memory = MemoryClient::new();
        let target = target(&memory);
        let bindings = Bindings::new();

        let obj = target.prepare(&cm("a"), &bindings).await.unwrap();
        assert_eq!(resource::namespace(&obj), Some("ns"));

        let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "x"}});
        let obj = target.prepare(&ns, &bindings).await.unwrap();
        assert_eq!(resource::namespace(&obj), None);

        let explicit = json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "mine"}});
        let obj = target.prepare(&explicit, &bindings).await.unwrap();
        assert_eq!(resource::namespace(&obj), Some("mine"));
    }

    #[tokio::test]
    async fn test_prepare_leaves_custom_cluster_scoped_kinds_alone() {
        let memory = MemoryClient::new().with_cluster_scoped_kind("ClusterIssuer");
        let issuer = json!({"apiVersion": "cert-manager.io/v1", "kind": "ClusterIssuer",
            "metadata": {"name": "ca"}});

        let obj = target(&memory).prepare(&issuer, &Bindings::new()).await.unwrap();
        assert_eq!(resource::namespace(&obj), None);
    }

    #[tokio::test]
    async fn test_prepare_resolves_references() {
        let memory = MemoryClient::new();
        let bindings = Bindings::new().register("name", json!("from-binding")).unwrap();
        let template = json!({"apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "$name"}});

        let obj = target(&memory).prepare(&template, &bindings).await.unwrap();
        assert_eq!(resource::name(&obj), Some("from-binding"));

        let raw = target(&memory)
            .templating(false)
            .prepare(&template, &bindings)
            .await
            .unwrap();
        assert_eq!(resource::name(&raw), Some("$name"));

        let err = target(&memory)
            .prepare(&template, &Bindings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Binding(_)));
    }

    #[tokio::test]
    async fn test_prepare_rejects_documents_without_kind() {
        let memory = MemoryClient::new();
        let err = target(&memory)
            .prepare(&json!({"apiVersion": "v1"}), &Bindings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::InvalidResource(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_request() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let token = CancellationToken::new();

        let done = bounded(deadline, &token, async { Ok::<_, ClientError>(1) }).await;
        assert_eq!(done, Some(Ok(1)));

        let slow = bounded(deadline, &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ClientError>(2)
        })
        .await;
        assert_eq!(slow, None);

        token.cancel();
        let cancelled = bounded(Instant::now() + Duration::from_secs(10), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ClientError>(3)
        })
        .await;
        assert_eq!(cancelled, None);
    }

    #[test]
    fn test_deadline_class() {
        let wait = WaitError::new("assert", "v1/ConfigMap", Duration::from_secs(1), Duration::from_secs(1));
        let deadline = OperationError::DeadlineExceeded(wait);
        assert!(deadline.is_deadline_exceeded());
        assert!(!OperationError::NotFound("x".to_string()).is_deadline_exceeded());

        let aggregate = OperationError::aggregate(vec![
            OperationError::NotFound("x".to_string()),
            deadline,
        ])
        .unwrap();
        assert!(aggregate.is_deadline_exceeded());
        assert!(OperationError::aggregate(Vec::new()).is_none());
    }
}
