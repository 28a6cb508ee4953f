//! Test orchestration
//!
//! The runner drives declared tests against one or more clusters:
//!
//! 1. Validate the configuration and prepare the shared namespace, if any
//! 2. Run non-concurrent tests one after another
//! 3. Run concurrent tests, at most `parallel` at a time
//! 4. Tear down the shared namespace and report
//!
//! Each test gets its own namespace, its own cleanup collectors and a child
//! of the run's cancellation token. With fail-fast enabled, the first failed
//! step cancels the run token: in-flight waits end as deadline exceeded and
//! tests that have not started yet are reported as skipped.
//!
//! # Example
//!
//! ```ignore
//! use kuvio::{Configuration, KubeClient, Runner, Test};
//! use std::sync::Arc;
//!
//! let client = Arc::new(KubeClient::try_default().await?);
//! let runner = Runner::new(Configuration::new().parallel(4), client);
//! let report = runner.run(vec![Test::from_file("tests/basic/test.yaml")?]).await?;
//! assert!(report.summary().success());
//! ```

mod operation;
mod step;

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bindings::BindingError;
use crate::cleanup::Cleaner;
use crate::client::{ClientError, ClusterClient, ObjectKey};
use crate::config::{ConfigError, Configuration, TimeoutKind};
use crate::context::{Clusters, ContextError, TestContext};
use crate::model::Test;
use crate::operations::OperationError;
use crate::report::{OperationType, Phase, RunReport, TestReport};
use crate::resource::ResourceError;

use test::Unit;

/// Errors that stop a test or a run
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("{operation} is not allowed in {phase}")]
    NotAllowed {
        operation: OperationType,
        phase: Phase,
    },

    #[error("namespace setup failed: {0}")]
    Namespace(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Make sure `name` exists, registering it with `cleaner` when created here
pub(crate) async fn ensure_namespace(
    client: Arc<dyn ClusterClient>,
    name: &str,
    cleaner: Option<&Cleaner>,
) -> Result<(), ClientError> {
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    match client.get(&ObjectKey::new("v1", "Namespace", None, name)).await {
        Ok(_) => {
            info!(namespace = %name, "Using existing namespace");
            return Ok(());
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [("kuvio.dev/test".to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    let obj = serde_json::to_value(&ns).map_err(|e| ClientError::Invalid(e.to_string()))?;
    client.create(&obj, false).await?;
    info!(namespace = %name, "Created test namespace");

    if let Some(cleaner) = cleaner {
        cleaner.add(client, &obj)?;
    }
    Ok(())
}

/// Runs declared tests and collects their reports
pub struct Runner {
    config: Configuration,
    clusters: Clusters,
}

impl Runner {
    /// Create a runner talking to `client` by default
    pub fn new(config: Configuration, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            config,
            clusters: Clusters::new(client),
        }
    }

    /// Register an additional cluster operations can select by name
    pub fn with_cluster(mut self, name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        self.clusters = self.clusters.register(name, client);
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Run every test and return the report tree
    ///
    /// Test failures are recorded in the report; an `Err` means the run
    /// itself could not start.
    pub async fn run(&self, tests: Vec<Test>) -> Result<RunReport, RunnerError> {
        self.config.validate()?;
        let mut report = RunReport::start(&self.config.report_name);
        let ctx = TestContext::new(&self.config, self.clusters.clone());
        let run_token = CancellationToken::new();

        let shared = Cleaner::new(
            ctx.timeout(TimeoutKind::Cleanup, None),
            None,
            ctx.deletion_propagation(),
        );
        if let Some(ns) = ctx.namespace() {
            let registry = if ctx.skip_delete() { None } else { Some(&shared) };
            ensure_namespace(ctx.client()?, ns, registry).await?;
        }

        let units = Unit::expand(tests);
        info!(
            tests = units.len(),
            parallel = self.config.parallel,
            "Starting run"
        );

        let (sequential, concurrent): (Vec<Unit>, Vec<Unit>) =
            units.into_iter().partition(|u| !u.concurrent());

        for unit in &sequential {
            report.add(test::run(unit, &ctx, &run_token).await);
        }
        for test_report in self.run_concurrent(concurrent, &ctx, &run_token).await {
            report.add(test_report);
        }

        for e in shared.run(None).await {
            warn!(error = %e, "Shared namespace cleanup failed");
        }

        report.finish();
        let summary = report.summary();
        if summary.success() {
            info!(
                passed = summary.passed,
                skipped = summary.skipped,
                cleanup_failures = summary.cleanup_failures,
                "Run passed"
            );
        } else {
            error!(
                passed = summary.passed,
                failed = summary.failed,
                skipped = summary.skipped,
                cleanup_failures = summary.cleanup_failures,
                "Run failed"
            );
        }
        Ok(report)
    }

    /// Run units in parallel under the configured limit
    ///
    /// Reports come back in declaration order.
    async fn run_concurrent(
        &self,
        units: Vec<Unit>,
        ctx: &TestContext,
        run_token: &CancellationToken,
    ) -> Vec<TestReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallel));
        let mut names = Vec::with_capacity(units.len());
        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let semaphore = semaphore.clone();
            let ctx = ctx.clone();
            let run_token = run_token.clone();
            names.push(unit.name());
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                test::run(&unit, &ctx, &run_token).await
            }));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(test = %name, error = %e, "Test task aborted");
                    let mut report = TestReport::start(name, true);
                    report.fail(format!("test task aborted: {e}"));
                    report.finish();
                    reports.push(report);
                }
            }
        }
        reports
    }
}
