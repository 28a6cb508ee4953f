//! Layered execution context
//!
//! A `TestContext` carries everything an operation needs to resolve its
//! settings: bindings, timeouts, deletion policy, catch handlers and the
//! cluster to talk to. Each level of a test (run, test, step, operation)
//! derives its own context from the enclosing one through the `with_*`
//! methods, which consume the value and return a modified copy. Sibling
//! steps and operations therefore never observe each other's overrides.
//!
//! # Example
//!
//! ```
//! use kuvio::client::MemoryClient;
//! use kuvio::config::{Configuration, Timeouts, TimeoutKind};
//! use kuvio::context::{Clusters, TestContext};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clusters = Clusters::new(Arc::new(MemoryClient::new()));
//! let test_ctx = TestContext::new(&Configuration::new(), clusters)
//!     .with_timeouts(&Timeouts::new().assert(Duration::from_secs(10)));
//! let step_ctx = test_ctx.clone()
//!     .with_timeouts(&Timeouts::new().assert(Duration::from_secs(3)));
//!
//! assert_eq!(test_ctx.timeout(TimeoutKind::Assert, None), Duration::from_secs(10));
//! assert_eq!(step_ctx.timeout(TimeoutKind::Assert, None), Duration::from_secs(3));
//! assert_eq!(
//!     step_ctx.timeout(TimeoutKind::Assert, Some(Duration::from_secs(1))),
//!     Duration::from_secs(1)
//! );
//! ```

mod clusters;

pub use clusters::Clusters;

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bindings::{BindingError, Bindings};
use crate::client::ClusterClient;
use crate::config::{Configuration, DefaultTimeouts, DeletionPropagation, TimeoutKind, Timeouts};
use crate::model::{Binding, Operation};

/// Errors from resolving a context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("cluster '{0}' is not registered")]
    UnknownCluster(String),

    #[error(transparent)]
    Binding(#[from] BindingError),
}

/// Immutable, copy-on-override execution context
#[derive(Debug, Clone)]
pub struct TestContext {
    bindings: Bindings,
    catch: Vec<Operation>,
    clusters: Clusters,
    cluster: Option<String>,
    timeouts: DefaultTimeouts,
    poll_interval: Duration,
    deletion_propagation: DeletionPropagation,
    delay_before_cleanup: Option<Duration>,
    skip_delete: bool,
    fail_fast: bool,
    templating: bool,
    namespace: Option<String>,
    base_path: Option<PathBuf>,
}

impl TestContext {
    /// Root context of a run
    pub fn new(config: &Configuration, clusters: Clusters) -> Self {
        Self {
            bindings: Bindings::new(),
            catch: Vec::new(),
            clusters,
            cluster: None,
            timeouts: config.resolved_timeouts(),
            poll_interval: config.poll_interval,
            deletion_propagation: config.deletion_propagation,
            delay_before_cleanup: config.delay_before_cleanup,
            skip_delete: config.skip_delete,
            fail_fast: config.fail_fast,
            templating: config.templating,
            namespace: config.namespace.clone(),
            base_path: None,
        }
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Catch handlers, outermost level first
    pub fn catch(&self) -> &[Operation] {
        &self.catch
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn timeouts(&self) -> &DefaultTimeouts {
        &self.timeouts
    }

    /// Timeout for one verb; an operation's own value wins over every level
    pub fn timeout(&self, kind: TimeoutKind, operation: Option<Duration>) -> Duration {
        operation.unwrap_or_else(|| self.timeouts.get(kind))
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn deletion_propagation(&self) -> DeletionPropagation {
        self.deletion_propagation
    }

    pub fn delay_before_cleanup(&self) -> Option<Duration> {
        self.delay_before_cleanup
    }

    pub fn skip_delete(&self) -> bool {
        self.skip_delete
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn templating(&self) -> bool {
        self.templating
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// Client of the current cluster
    pub fn client(&self) -> Result<Arc<dyn ClusterClient>, ContextError> {
        self.clusters.get(self.cluster.as_deref())
    }

    pub fn with_binding(mut self, name: &str, value: Value) -> Result<Self, ContextError> {
        self.bindings = self.bindings.register(name, value)?;
        Ok(self)
    }

    /// Register declared bindings in order
    ///
    /// Each value may reference bindings registered before it.
    pub fn with_declared_bindings(mut self, declared: &[Binding]) -> Result<Self, ContextError> {
        for binding in declared {
            let value = self.bindings.resolve_value(&binding.value)?;
            self.bindings = self.bindings.register(&binding.name, value)?;
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_timeouts(mut self, overrides: &Timeouts) -> Self {
        self.timeouts = self.timeouts.with_overrides(overrides);
        self
    }

    /// Append catch handlers after the ones inherited from outer levels
    #[must_use]
    pub fn with_catch(mut self, handlers: &[Operation]) -> Self {
        self.catch.extend_from_slice(handlers);
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Option<&str>) -> Self {
        if let Some(name) = cluster {
            self.cluster = Some(name.to_string());
        }
        self
    }

    #[must_use]
    pub fn with_deletion_propagation(mut self, policy: Option<DeletionPropagation>) -> Self {
        if let Some(policy) = policy {
            self.deletion_propagation = policy;
        }
        self
    }

    #[must_use]
    pub fn with_delay_before_cleanup(mut self, delay: Option<Duration>) -> Self {
        if delay.is_some() {
            self.delay_before_cleanup = delay;
        }
        self
    }

    #[must_use]
    pub fn with_skip_delete(mut self, skip: Option<bool>) -> Self {
        if let Some(skip) = skip {
            self.skip_delete = skip;
        }
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: Option<bool>) -> Self {
        if let Some(fail_fast) = fail_fast {
            self.fail_fast = fail_fast;
        }
        self
    }

    #[must_use]
    pub fn with_templating(mut self, templating: Option<bool>) -> Self {
        if let Some(templating) = templating {
            self.templating = templating;
        }
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, path: Option<&Path>) -> Self {
        if let Some(path) = path {
            self.base_path = Some(path.to_path_buf());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryClient;
    use serde_json::json;

    fn root() -> TestContext {
        TestContext::new(
            &Configuration::new(),
            Clusters::new(Arc::new(MemoryClient::new()))
                .register("other", Arc::new(MemoryClient::new())),
        )
    }

    #[test]
    fn test_defaults_from_configuration() {
        let ctx = TestContext::new(
            &Configuration::new()
                .skip_delete(true)
                .deletion_propagation(DeletionPropagation::Orphan)
                .namespace("shared"),
            Clusters::new(Arc::new(MemoryClient::new())),
        );
        assert!(ctx.skip_delete());
        assert!(ctx.templating());
        assert_eq!(ctx.deletion_propagation(), DeletionPropagation::Orphan);
        assert_eq!(ctx.namespace(), Some("shared"));
        assert_eq!(ctx.timeout(TimeoutKind::Apply, None), Duration::from_secs(5));
    }

    #[test]
    fn test_unset_overrides_inherit() {
        let test = root()
            .with_deletion_propagation(Some(DeletionPropagation::Foreground))
            .with_skip_delete(Some(true));
        let step = test
            .clone()
            .with_deletion_propagation(None)
            .with_skip_delete(None)
            .with_templating(Some(false));

        assert_eq!(step.deletion_propagation(), DeletionPropagation::Foreground);
        assert!(step.skip_delete());
        assert!(!step.templating());
        assert!(test.templating());
    }

    #[test]
    fn test_timeout_precedence() {
        let test = root().with_timeouts(&Timeouts::new().delete(Duration::from_secs(20)));
        let step = test
            .clone()
            .with_timeouts(&Timeouts::new().assert(Duration::from_secs(2)));

        assert_eq!(step.timeout(TimeoutKind::Delete, None), Duration::from_secs(20));
        assert_eq!(step.timeout(TimeoutKind::Assert, None), Duration::from_secs(2));
        assert_eq!(
            step.timeout(TimeoutKind::Delete, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(test.timeout(TimeoutKind::Assert, None), Duration::from_secs(30));
    }

    #[test]
    fn test_catch_handlers_accumulate() {
        let test = root().with_catch(&[Operation::script("echo test")]);
        let step = test.clone().with_catch(&[Operation::script("echo step")]);
        assert_eq!(test.catch().len(), 1);
        assert_eq!(step.catch().len(), 2);
        assert_eq!(step.catch()[0], Operation::script("echo test"));
    }

    #[test]
    fn test_declared_bindings_reference_earlier_ones() {
        let ctx = root()
            .with_binding("namespace", json!("ns-1"))
            .unwrap()
            .with_declared_bindings(&[
                Binding::new("target", json!("$namespace")),
                Binding::new("copy", json!({"ns": "$target"})),
            ])
            .unwrap();
        assert_eq!(ctx.bindings().get("copy"), Some(&json!({"ns": "ns-1"})));
    }

    #[test]
    fn test_cluster_selection() {
        let ctx = root();
        assert!(ctx.client().is_ok());
        assert_eq!(ctx.clone().with_cluster(None).cluster(), None);

        let other = ctx.clone().with_cluster(Some("other"));
        assert_eq!(other.cluster(), Some("other"));
        assert!(other.client().is_ok());

        let missing = ctx.with_cluster(Some("nope"));
        assert_eq!(
            missing.client().err(),
            Some(ContextError::UnknownCluster("nope".to_string()))
        );
    }
}
