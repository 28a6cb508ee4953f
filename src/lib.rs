//! Kuvio - declarative end-to-end tests for Kubernetes
//!
//! Tests are declared as data: ordered steps, each with `try`, `catch`,
//! `finally` and `cleanup` operations. Operations create and modify
//! resources, assert on cluster state through partial templates, run local
//! commands and scripts, or wait. Kuvio runs each test in its own namespace,
//! retries assertions until their deadline and removes everything it created,
//! newest first.
//!
//! # Example
//!
//! ```no_run
//! use kuvio::model::{Operation, Step, Test};
//! use kuvio::{Configuration, KubeClient, Runner};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     kuvio::telemetry::init_logging();
//!
//!     let test = Test::new("configmap").step(
//!         Step::new("create and check")
//!             .try_op(Operation::apply(json!({
//!                 "apiVersion": "v1",
//!                 "kind": "ConfigMap",
//!                 "metadata": {"name": "settings"},
//!                 "data": {"mode": "fast"}
//!             })))
//!             .try_op(Operation::assert(json!({
//!                 "apiVersion": "v1",
//!                 "kind": "ConfigMap",
//!                 "metadata": {"name": "settings"},
//!                 "data": {"mode": "fast"}
//!             }))),
//!     );
//!
//!     let client = Arc::new(KubeClient::try_default().await?);
//!     let report = Runner::new(Configuration::new(), client)
//!         .run(vec![test])
//!         .await?;
//!
//!     println!("{:?}", report.summary());
//!     Ok(())
//! }
//! ```
//!
//! # Tests from files
//!
//! ```yaml
//! name: configmap
//! steps:
//!   - name: create and check
//!     try:
//!       - apply:
//!           file: configmap.yaml
//!       - assert:
//!           resource:
//!             apiVersion: v1
//!             kind: ConfigMap
//!             metadata:
//!               name: settings
//!     finally:
//!       - script:
//!           content: kubectl get configmap -n "$NAMESPACE"
//! ```

pub mod bindings;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod context;
pub mod eventually;
pub mod exec;
pub mod matching;
pub mod model;
pub mod operations;
pub mod report;
pub mod resource;
pub mod runner;
pub mod telemetry;
pub mod wait;

// Re-export commonly used types
pub use bindings::{BindingError, Bindings};
pub use cleanup::{Cleaner, CleanupError};
pub use client::{ClientError, ClusterClient, KubeClient, MemoryClient, ObjectKey};
pub use config::{ConfigError, Configuration, DeletionPropagation, Timeouts};
pub use context::{Clusters, ContextError, TestContext};
pub use eventually::{eventually, PollError, Progress};
pub use matching::{match_value, MatchError};
pub use model::{Operation, Step, Test};
pub use operations::OperationError;
pub use report::{RunReport, Status, Summary, TestReport};
pub use runner::{Runner, RunnerError};
pub use wait::WaitError;
